//! Transport and monitor client contracts.

use super::messages::Message;
use crate::error::Result;
use crate::types::Epoch;
use async_trait::async_trait;
use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;
use uuid::Uuid;

/// A connection to a peer daemon.
#[async_trait]
pub trait Connection: Send + Sync + Debug {
    fn peer_addr(&self) -> SocketAddr;

    /// Queue a message. Fails with a network error if the peer is gone.
    async fn send(&self, msg: Message) -> Result<()>;
}

/// Factory for peer connections.
pub trait Messenger: Send + Sync + Debug {
    /// Connection to `addr`, reusing an existing one when possible.
    fn connect(&self, addr: SocketAddr) -> Arc<dyn Connection>;
}

/// How long a monitor subscription lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeMode {
    /// Keep receiving updates.
    Continuous,
    /// Deliver what is asked for once.
    OneTime,
}

/// Monitor client contract.
#[async_trait]
pub trait MonClient: Send + Sync + Debug {
    async fn send_message(&self, msg: Message) -> Result<()>;

    /// Ask for `name` starting at `start`. Returns false if an equal or
    /// newer subscription already exists.
    fn sub_want_increment(&self, name: &str, start: Epoch, mode: SubscribeMode) -> bool;

    /// Push pending subscriptions to the monitor.
    async fn renew_subs(&self) -> Result<()>;

    fn cluster_id(&self) -> Uuid;
}
