//! Messages exchanged with peers and the monitor.

use crate::error::Result;
use crate::types::{Epoch, OsdId, PgId, PgShard, SpgId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Every message this core sends or receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// A batch of map epochs.
    MapUpdate(MapUpdate),

    /// Temporary acting-set overrides requested from the monitor.
    PgTemp(PgTempRequest),

    /// Acknowledges that a monitor-requested PG now exists.
    PgCreated { pgid: PgId },

    /// Liveness claim asking the monitor to raise our up_thru.
    Alive { epoch: Epoch, want: Epoch },

    /// PG-to-PG peering traffic.
    Peering(PeeringMessage),
}

impl Message {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::MapUpdate(_) => "map_update",
            Message::PgTemp(_) => "pg_temp",
            Message::PgCreated { .. } => "pg_created",
            Message::Alive { .. } => "alive",
            Message::Peering(_) => "peering",
        }
    }
}

/// One epoch's encoding inside a [`MapUpdate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapEntry {
    Full(Bytes),
    Incremental(Bytes),
}

/// A batch of encoded epochs.
///
/// An epoch may carry a full encoding, an incremental one, or both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapUpdate {
    pub fsid: Uuid,
    pub maps: BTreeMap<Epoch, Bytes>,
    pub incremental_maps: BTreeMap<Epoch, Bytes>,
    pub cluster_trim_lower_bound: Epoch,
    pub newest_map: Epoch,
}

impl MapUpdate {
    pub fn new(fsid: Uuid, cluster_trim_lower_bound: Epoch, newest_map: Epoch) -> Self {
        Self {
            fsid,
            maps: BTreeMap::new(),
            incremental_maps: BTreeMap::new(),
            cluster_trim_lower_bound,
            newest_map,
        }
    }

    pub fn with_full(mut self, epoch: Epoch, bytes: Bytes) -> Self {
        self.maps.insert(epoch, bytes);
        self
    }

    pub fn with_incremental(mut self, epoch: Epoch, bytes: Bytes) -> Self {
        self.incremental_maps.insert(epoch, bytes);
        self
    }

    /// Lowest epoch carried.
    pub fn first(&self) -> Option<Epoch> {
        let full = self.maps.keys().next().copied();
        let inc = self.incremental_maps.keys().next().copied();
        match (full, inc) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Highest epoch carried.
    pub fn last(&self) -> Option<Epoch> {
        let full = self.maps.keys().next_back().copied();
        let inc = self.incremental_maps.keys().next_back().copied();
        match (full, inc) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    /// Claimed `[first, last]` range.
    pub fn epoch_range(&self) -> Option<(Epoch, Epoch)> {
        Some((self.first()?, self.last()?))
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty() && self.incremental_maps.is_empty()
    }

    /// Number of epochs carrying at least one encoding.
    pub fn len(&self) -> usize {
        self.maps
            .keys()
            .chain(self.incremental_maps.keys())
            .collect::<std::collections::BTreeSet<_>>()
            .len()
    }

    /// Encoding to use for an epoch; the full form wins when both exist.
    pub fn entry(&self, epoch: Epoch) -> Option<MapEntry> {
        if let Some(bytes) = self.maps.get(&epoch) {
            return Some(MapEntry::Full(bytes.clone()));
        }
        self.incremental_maps
            .get(&epoch)
            .map(|bytes| MapEntry::Incremental(bytes.clone()))
    }

    /// Total encoded bytes carried.
    pub fn encoded_len(&self) -> usize {
        self.maps
            .values()
            .chain(self.incremental_maps.values())
            .map(Bytes::len)
            .sum()
    }
}

/// pg_temp request to the monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgTempRequest {
    pub epoch: Epoch,
    pub forced: bool,
    pub pg_temp: BTreeMap<PgId, Vec<OsdId>>,
}

/// Kind of a peering message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeeringKind {
    /// Replica announces itself to the primary.
    Notify,
    /// Primary asks a replica for its info.
    Query,
    /// Info reply.
    Info,
}

/// Peering traffic between PG instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeeringMessage {
    pub pgid: SpgId,
    pub from: PgShard,
    pub epoch: Epoch,
    pub kind: PeeringKind,
}
