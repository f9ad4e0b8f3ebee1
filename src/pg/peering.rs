//! Output buffer of a peering step.

use crate::network::Message;
use crate::storage::Transaction;
use crate::types::OsdId;
use std::collections::BTreeMap;

/// Messages and storage ops produced while advancing PGs.
///
/// Dispatched as one unit by the shard coordinator.
#[derive(Debug, Default)]
pub struct PeeringCtx {
    pub transaction: Transaction,
    pub message_map: BTreeMap<OsdId, Vec<Message>>,
}

impl PeeringCtx {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&mut self, to: OsdId, msg: Message) {
        self.message_map.entry(to).or_default().push(msg);
    }

    /// Take the buffered messages, leaving none behind.
    pub fn take_messages(&mut self) -> BTreeMap<OsdId, Vec<Message>> {
        std::mem::take(&mut self.message_map)
    }

    pub fn num_messages(&self) -> usize {
        self.message_map.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.transaction.is_empty() && self.message_map.is_empty()
    }
}
