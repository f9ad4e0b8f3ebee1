//! Test doubles and cross-component scenarios.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Test doubles                           │
//! │  RecordingMonClient   records monitor messages and subs       │
//! │  RecordingMessenger   records peer sends, can drop peers      │
//! │  RecordingScrubber    records scan requests                   │
//! │  MapHistory           builds consecutive map encodings        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The doubles are public so embedders can drive an [`OsdNode`] without a
//! real monitor or transport.
//!
//! [`OsdNode`]: crate::osd::OsdNode


use crate::error::{NetworkError, Result};
use crate::network::{Connection, MapUpdate, Message, Messenger, MonClient, SubscribeMode};
use crate::osdmap::{self, ClusterMap, Incremental, PoolInfo};
use crate::scrub::{ScanRequest, ScrubBackend};
use crate::types::{Epoch, OsdId, PoolId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Cluster address used for `osd` by [`MapHistory`].
pub fn osd_addr(osd: OsdId) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, (osd % 250) as u8 + 1], 6800))
}

// ============================================================================
// Monitor client
// ============================================================================

/// Monitor client that records what it is asked to do.
#[derive(Debug)]
pub struct RecordingMonClient {
    fsid: Uuid,
    sent: Mutex<Vec<Message>>,
    subs: Mutex<BTreeMap<String, Epoch>>,
    renewals: AtomicUsize,
}

impl RecordingMonClient {
    pub fn new(fsid: Uuid) -> Self {
        Self {
            fsid,
            sent: Mutex::new(Vec::new()),
            subs: Mutex::new(BTreeMap::new()),
            renewals: AtomicUsize::new(0),
        }
    }

    /// Every message sent so far.
    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }

    /// Drain the recorded messages.
    pub fn take_sent(&self) -> Vec<Message> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Start epoch of the subscription to `name`, if any.
    pub fn subscription(&self, name: &str) -> Option<Epoch> {
        self.subs.lock().get(name).copied()
    }

    pub fn renewals(&self) -> usize {
        self.renewals.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MonClient for RecordingMonClient {
    async fn send_message(&self, msg: Message) -> Result<()> {
        self.sent.lock().push(msg);
        Ok(())
    }

    fn sub_want_increment(&self, name: &str, start: Epoch, _mode: SubscribeMode) -> bool {
        let mut subs = self.subs.lock();
        match subs.get(name) {
            Some(existing) if *existing >= start => false,
            _ => {
                subs.insert(name.to_string(), start);
                true
            }
        }
    }

    async fn renew_subs(&self) -> Result<()> {
        self.renewals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn cluster_id(&self) -> Uuid {
        self.fsid
    }
}

// ============================================================================
// Messenger
// ============================================================================

#[derive(Debug, Default)]
struct Wire {
    sent: Mutex<Vec<(SocketAddr, Message)>>,
    disconnected: Mutex<HashSet<SocketAddr>>,
}

/// Messenger whose connections record sends in one shared log.
#[derive(Debug, Default)]
pub struct RecordingMessenger {
    wire: Arc<Wire>,
    connects: AtomicUsize,
}

impl RecordingMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `(destination, message)` sent so far.
    pub fn sent(&self) -> Vec<(SocketAddr, Message)> {
        self.wire.sent.lock().clone()
    }

    /// Messages sent to `addr`.
    pub fn sent_to(&self, addr: SocketAddr) -> Vec<Message> {
        self.wire
            .sent
            .lock()
            .iter()
            .filter(|(to, _)| *to == addr)
            .map(|(_, msg)| msg.clone())
            .collect()
    }

    /// Make sends to `addr` fail.
    pub fn disconnect(&self, addr: SocketAddr) {
        self.wire.disconnected.lock().insert(addr);
    }

    pub fn clear(&self) {
        self.wire.sent.lock().clear();
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl Messenger for RecordingMessenger {
    fn connect(&self, addr: SocketAddr) -> Arc<dyn Connection> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Arc::new(RecordingConnection {
            addr,
            wire: self.wire.clone(),
        })
    }
}

/// Connection handed out by [`RecordingMessenger`].
#[derive(Debug)]
pub struct RecordingConnection {
    addr: SocketAddr,
    wire: Arc<Wire>,
}

impl RecordingConnection {
    /// A standalone connection to `addr` with its own log.
    pub fn detached(addr: SocketAddr) -> Self {
        Self {
            addr,
            wire: Arc::new(Wire::default()),
        }
    }

    pub fn sent(&self) -> Vec<Message> {
        self.wire
            .sent
            .lock()
            .iter()
            .map(|(_, msg)| msg.clone())
            .collect()
    }
}

#[async_trait]
impl Connection for RecordingConnection {
    fn peer_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn send(&self, msg: Message) -> Result<()> {
        if self.wire.disconnected.lock().contains(&self.addr) {
            return Err(NetworkError::Disconnected(self.addr.to_string()).into());
        }
        self.wire.sent.lock().push((self.addr, msg));
        Ok(())
    }
}

// ============================================================================
// Scrub
// ============================================================================

/// Scrub backend that only records requests.
#[derive(Debug, Default)]
pub struct RecordingScrubber {
    requests: Mutex<Vec<ScanRequest>>,
}

impl RecordingScrubber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<ScanRequest> {
        self.requests.lock().clone()
    }
}

impl ScrubBackend for RecordingScrubber {
    fn scan_range(&self, request: ScanRequest) -> Result<()> {
        self.requests.lock().push(request);
        Ok(())
    }
}

// ============================================================================
// Map history
// ============================================================================

/// A sequence of map epochs as a monitor would publish them.
#[derive(Debug, Clone)]
pub struct MapHistory {
    fsid: Uuid,
    maps: BTreeMap<Epoch, ClusterMap>,
    incrementals: BTreeMap<Epoch, Incremental>,
}

impl MapHistory {
    /// History holding only the empty epoch 0.
    pub fn new(fsid: Uuid) -> Self {
        let mut maps = BTreeMap::new();
        maps.insert(0, ClusterMap::new(fsid));
        Self {
            fsid,
            maps,
            incrementals: BTreeMap::new(),
        }
    }

    /// Epoch 1 brings `num_osds` daemons up and creates a replicated pool 1.
    pub fn with_cluster(fsid: Uuid, num_osds: u32, pool_size: u32, pg_num: u32) -> Result<Self> {
        let mut history = Self::new(fsid);
        let mut inc = history.next_incremental();
        for osd in 0..num_osds {
            inc = inc.with_new_up(osd, osd_addr(osd));
        }
        inc = inc.with_new_pool(1, PoolInfo::replicated("rbd", pool_size, pg_num));
        history.push(inc)?;
        Ok(history)
    }

    pub fn fsid(&self) -> Uuid {
        self.fsid
    }

    pub fn newest(&self) -> Epoch {
        self.maps.keys().next_back().copied().unwrap_or(0)
    }

    /// Empty delta for the next epoch.
    pub fn next_incremental(&self) -> Incremental {
        Incremental::new(self.fsid, self.newest() + 1)
    }

    /// Append an epoch.
    pub fn push(&mut self, inc: Incremental) -> Result<Epoch> {
        let mut map = self.map(self.newest()).cloned().unwrap_or_default();
        map.apply_incremental(&inc)?;
        let epoch = map.epoch();
        self.maps.insert(epoch, map);
        self.incrementals.insert(epoch, inc);
        Ok(epoch)
    }

    /// Append `count` epochs that only bump `osd`'s up_thru.
    pub fn advance(&mut self, count: u32, osd: OsdId) -> Result<Epoch> {
        for _ in 0..count {
            let epoch = self.newest() + 1;
            self.push(self.next_incremental().with_up_thru(osd, epoch))?;
        }
        Ok(self.newest())
    }

    /// Append an epoch that deletes `pool`.
    pub fn remove_pool(&mut self, pool: PoolId) -> Result<Epoch> {
        self.push(self.next_incremental().with_removed_pool(pool))
    }

    pub fn map(&self, epoch: Epoch) -> Option<&ClusterMap> {
        self.maps.get(&epoch)
    }

    pub fn full_bytes(&self, epoch: Epoch) -> Result<bytes::Bytes> {
        let map = self
            .maps
            .get(&epoch)
            .ok_or(crate::error::StorageError::MapNotFound(epoch))?;
        Ok(osdmap::encode_full(map)?)
    }

    pub fn inc_bytes(&self, epoch: Epoch) -> Result<bytes::Bytes> {
        let inc = self
            .incrementals
            .get(&epoch)
            .ok_or(crate::error::StorageError::MapNotFound(epoch))?;
        Ok(osdmap::encode_incremental(inc)?)
    }

    /// Update carrying full encodings of `first..=last`.
    pub fn full_update(&self, first: Epoch, last: Epoch) -> Result<MapUpdate> {
        let mut update = MapUpdate::new(self.fsid, first, last);
        for epoch in first..=last {
            update = update.with_full(epoch, self.full_bytes(epoch)?);
        }
        Ok(update)
    }

    /// Update carrying the full encoding of `first` and incrementals up to `last`.
    pub fn mixed_update(&self, first: Epoch, last: Epoch) -> Result<MapUpdate> {
        let mut update = MapUpdate::new(self.fsid, first, last).with_full(first, self.full_bytes(first)?);
        for epoch in first + 1..=last {
            update = update.with_incremental(epoch, self.inc_bytes(epoch)?);
        }
        Ok(update)
    }

    /// Update carrying only incrementals of `first..=last`.
    pub fn incremental_update(&self, first: Epoch, last: Epoch) -> Result<MapUpdate> {
        let mut update = MapUpdate::new(self.fsid, 0, last);
        for epoch in first..=last {
            update = update.with_incremental(epoch, self.inc_bytes(epoch)?);
        }
        Ok(update)
    }
}

/// Route test logs through `tracing-subscriber`.
#[cfg(test)]
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}
