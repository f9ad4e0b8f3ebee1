//! Placement group object.

use super::peering::PeeringCtx;
use crate::error::{Result, StorageError};
use crate::network::{Message, PeeringKind, PeeringMessage};
use crate::osdmap::{ClusterMap, PoolInfo};
use crate::scrub::{ScanRequest, ScrubBackend, ScrubEvent};
use crate::storage::{CollectionHandle, CollectionId, ObjectKey, ObjectStore, Transaction};
use crate::types::{Epoch, OsdId, PgShard, SpgId};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Lifecycle state of a PG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgState {
    /// Constructed, not yet activated on a map.
    Initial,
    /// Serving.
    Active,
    /// Shut down.
    Stopped,
}

impl fmt::Display for PgState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PgState::Initial => write!(f, "initial"),
            PgState::Active => write!(f, "active"),
            PgState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Epoch bookkeeping of a PG.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgHistory {
    pub epoch_created: Epoch,
    pub same_interval_since: Epoch,
    pub last_epoch_started: Epoch,
}

impl PgHistory {
    pub fn created_at(epoch: Epoch) -> Self {
        Self {
            epoch_created: epoch,
            same_interval_since: epoch,
            last_epoch_started: 0,
        }
    }
}

/// A closed interval during which the acting set did not change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgInterval {
    pub first: Epoch,
    pub last: Epoch,
    pub acting: Vec<OsdId>,
    pub primary: Option<OsdId>,
}

/// Past intervals since the PG was last clean.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PastIntervals {
    pub intervals: Vec<PgInterval>,
}

impl PastIntervals {
    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }
}

/// Persisted PG info, stored in the PG's own collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgInfo {
    pub pgid: SpgId,
    pub epoch: Epoch,
    pub history: PgHistory,
    pub past_intervals: PastIntervals,
}

impl PgInfo {
    /// Stage the record into `txn`.
    pub fn store(&self, txn: &mut Transaction) -> Result<()> {
        let bytes = bincode::serialize(self)?;
        txn.write(
            CollectionId::Pg(self.pgid),
            ObjectKey::PgInfo,
            Bytes::from(bytes),
        );
        Ok(())
    }

    /// Load the record of `pgid`.
    pub async fn load(store: &dyn ObjectStore, pgid: SpgId) -> Result<PgInfo> {
        let bytes = store
            .read(&CollectionId::Pg(pgid), &ObjectKey::PgInfo)
            .await?
            .ok_or_else(|| StorageError::RecordNotFound(format!("pg info of {}", pgid)))?;
        Ok(bincode::deserialize(&bytes)?)
    }
}

/// Request to create a PG.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgCreateInfo {
    pub pgid: SpgId,
    /// Epoch the creation was requested at.
    pub epoch: Epoch,
    pub history: PgHistory,
    pub past_intervals: PastIntervals,
    /// Requested by the monitor rather than by a peer.
    pub by_mon: bool,
}

impl PgCreateInfo {
    pub fn new(pgid: SpgId, epoch: Epoch, by_mon: bool) -> Self {
        Self {
            pgid,
            epoch,
            history: PgHistory::created_at(epoch),
            past_intervals: PastIntervals::default(),
            by_mon,
        }
    }
}

/// Point-in-time view of a PG for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgStats {
    pub pgid: SpgId,
    pub epoch: Epoch,
    pub state: PgState,
    pub role: i32,
    pub up: Vec<OsdId>,
    pub acting: Vec<OsdId>,
    pub same_interval_since: Epoch,
    pub last_scrub_objects: u64,
}

struct Membership {
    map: Arc<ClusterMap>,
    state: PgState,
    role: i32,
    up: Vec<OsdId>,
    up_primary: Option<OsdId>,
    acting: Vec<OsdId>,
    acting_primary: Option<OsdId>,
    history: PgHistory,
    past_intervals: PastIntervals,
    last_scrub_objects: u64,
}

/// A placement group hosted by this daemon.
///
/// Holds the map epoch it was last advanced to, which keeps that epoch
/// resident in the epoch cache and on disk.
pub struct PlacementGroup {
    pgid: SpgId,
    whoami: PgShard,
    coll: CollectionHandle,
    pool: PoolInfo,
    name: String,
    ec_profile: BTreeMap<String, String>,
    inner: Mutex<Membership>,
}

impl PlacementGroup {
    pub fn new(
        pgid: SpgId,
        whoami: PgShard,
        coll: CollectionHandle,
        pool: PoolInfo,
        name: String,
        map: Arc<ClusterMap>,
        ec_profile: BTreeMap<String, String>,
    ) -> Self {
        Self {
            pgid,
            whoami,
            coll,
            pool,
            name,
            ec_profile,
            inner: Mutex::new(Membership {
                map,
                state: PgState::Initial,
                role: -1,
                up: Vec::new(),
                up_primary: None,
                acting: Vec::new(),
                acting_primary: None,
                history: PgHistory::default(),
                past_intervals: PastIntervals::default(),
                last_scrub_objects: 0,
            }),
        }
    }

    pub fn pgid(&self) -> SpgId {
        self.pgid
    }

    pub fn whoami(&self) -> PgShard {
        self.whoami
    }

    pub fn collection(&self) -> &CollectionHandle {
        &self.coll
    }

    pub fn pool(&self) -> &PoolInfo {
        &self.pool
    }

    pub fn pool_name(&self) -> &str {
        &self.name
    }

    pub fn ec_profile(&self) -> &BTreeMap<String, String> {
        &self.ec_profile
    }

    /// Epoch this PG was last advanced to.
    pub fn epoch(&self) -> Epoch {
        self.inner.lock().map.epoch()
    }

    pub fn map(&self) -> Arc<ClusterMap> {
        self.inner.lock().map.clone()
    }

    pub fn state(&self) -> PgState {
        self.inner.lock().state
    }

    pub fn role(&self) -> i32 {
        self.inner.lock().role
    }

    pub fn is_primary(&self) -> bool {
        self.inner.lock().role == 0
    }

    pub fn acting(&self) -> Vec<OsdId> {
        self.inner.lock().acting.clone()
    }

    pub fn history(&self) -> PgHistory {
        self.inner.lock().history.clone()
    }

    pub fn past_intervals(&self) -> PastIntervals {
        self.inner.lock().past_intervals.clone()
    }

    /// Record initial membership and stage the on-disk PG info.
    #[allow(clippy::too_many_arguments)]
    pub fn init(
        &self,
        role: i32,
        up: Vec<OsdId>,
        up_primary: Option<OsdId>,
        acting: Vec<OsdId>,
        acting_primary: Option<OsdId>,
        history: PgHistory,
        past_intervals: PastIntervals,
        txn: &mut Transaction,
    ) -> Result<()> {
        let info = {
            let mut inner = self.inner.lock();
            inner.role = role;
            inner.up = up;
            inner.up_primary = up_primary;
            inner.acting = acting;
            inner.acting_primary = acting_primary;
            inner.history = history;
            inner.past_intervals = past_intervals;
            self.info_locked(&inner)
        };

        txn.create_collection(self.coll.cid());
        info.store(txn)?;
        debug!(pgid = %self.pgid, role, "Initialized pg");
        Ok(())
    }

    /// Restore history and intervals from disk and recompute membership.
    pub async fn read_state(&self, store: &dyn ObjectStore) -> Result<()> {
        let info = PgInfo::load(store, self.pgid).await?;
        let mut inner = self.inner.lock();
        inner.history = info.history;
        inner.past_intervals = info.past_intervals;
        let map = inner.map.clone();
        self.refresh_membership(&mut inner, &map);
        debug!(pgid = %self.pgid, epoch = info.epoch, "Read pg state");
        Ok(())
    }

    /// Advance to `next`, which must be newer than the current epoch.
    ///
    /// When up or acting changes a new interval starts and peering
    /// messages are queued into `ctx`.
    pub fn handle_advance_map(&self, next: Arc<ClusterMap>, ctx: &mut PeeringCtx) {
        let mut inner = self.inner.lock();
        if inner.state == PgState::Stopped || next.epoch() <= inner.map.epoch() {
            return;
        }

        let old_up = inner.up.clone();
        let old_acting = inner.acting.clone();
        let old_primary = inner.acting_primary;
        self.refresh_membership(&mut inner, &next);
        let epoch = next.epoch();
        inner.map = next;

        if inner.up == old_up && inner.acting == old_acting {
            return;
        }

        let first = inner.history.same_interval_since;
        inner.past_intervals.intervals.push(PgInterval {
            first,
            last: epoch - 1,
            acting: old_acting,
            primary: old_primary,
        });
        inner.history.same_interval_since = epoch;
        debug!(
            pgid = %self.pgid,
            epoch,
            acting = ?inner.acting,
            role = inner.role,
            "New interval"
        );

        if inner.role == 0 {
            for osd in inner.acting.iter().filter(|osd| **osd != self.whoami.osd) {
                ctx.send(*osd, self.peering_message(epoch, PeeringKind::Query));
            }
        } else if inner.role > 0 {
            if let Some(primary) = inner.acting_primary {
                ctx.send(primary, self.peering_message(epoch, PeeringKind::Notify));
            }
        }
    }

    /// Activate on the current map and stage the updated PG info.
    pub fn handle_activate_map(&self, ctx: &mut PeeringCtx) -> Result<()> {
        let info = {
            let mut inner = self.inner.lock();
            if inner.state == PgState::Stopped {
                return Ok(());
            }
            if inner.state == PgState::Initial && inner.role >= 0 {
                inner.history.last_epoch_started = inner.map.epoch();
            }
            inner.state = PgState::Active;
            self.info_locked(&inner)
        };
        info.store(&mut ctx.transaction)
    }

    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        if inner.state != PgState::Stopped {
            inner.state = PgState::Stopped;
            info!(pgid = %self.pgid, "Stopped pg");
        }
    }

    pub fn stats(&self) -> PgStats {
        let inner = self.inner.lock();
        PgStats {
            pgid: self.pgid,
            epoch: inner.map.epoch(),
            state: inner.state,
            role: inner.role,
            up: inner.up.clone(),
            acting: inner.acting.clone(),
            same_interval_since: inner.history.same_interval_since,
            last_scrub_objects: inner.last_scrub_objects,
        }
    }

    /// Ask the scrub collaborator to scan `[start, end)`.
    pub fn request_scan(
        &self,
        backend: &dyn ScrubBackend,
        start: impl Into<String>,
        end: impl Into<String>,
        deep: bool,
    ) -> Result<()> {
        let request = ScanRequest {
            pgid: self.pgid,
            version: self.epoch(),
            deep,
            start: start.into(),
            end: end.into(),
        };
        backend.scan_range(request)
    }

    /// Consume a scrub result.
    pub fn handle_scrub_event(&self, event: ScrubEvent) {
        match event {
            ScrubEvent::ScanComplete { pgid, result, .. } if pgid == self.pgid => {
                self.inner.lock().last_scrub_objects += result.objects;
            }
            ScrubEvent::ScanComplete { pgid, .. } => {
                debug!(pgid = %self.pgid, other = %pgid, "Ignoring scrub event for another pg");
            }
        }
    }

    fn refresh_membership(&self, inner: &mut Membership, map: &ClusterMap) {
        let ua = map.pg_to_up_acting(&self.pgid.pgid);
        inner.role = map.calc_pg_role(self.whoami, &ua.acting);
        inner.up = ua.up;
        inner.up_primary = ua.up_primary;
        inner.acting = ua.acting;
        inner.acting_primary = ua.acting_primary;
    }

    fn info_locked(&self, inner: &Membership) -> PgInfo {
        PgInfo {
            pgid: self.pgid,
            epoch: inner.map.epoch(),
            history: inner.history.clone(),
            past_intervals: inner.past_intervals.clone(),
        }
    }

    fn peering_message(&self, epoch: Epoch, kind: PeeringKind) -> Message {
        Message::Peering(PeeringMessage {
            pgid: self.pgid,
            from: self.whoami,
            epoch,
            kind,
        })
    }
}

impl fmt::Debug for PlacementGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PlacementGroup")
            .field("pgid", &self.pgid)
            .field("epoch", &inner.map.epoch())
            .field("state", &inner.state)
            .field("role", &inner.role)
            .field("acting", &inner.acting)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osdmap::Incremental;
    use crate::storage::MemStore;
    use crate::types::PgId;
    use std::net::SocketAddr;
    use uuid::Uuid;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn maps() -> (Arc<ClusterMap>, Arc<ClusterMap>) {
        let fsid = Uuid::new_v4();
        let mut map = ClusterMap::new(fsid);
        map.apply_incremental(
            &Incremental::new(fsid, 1)
                .with_new_up(0, addr(6800))
                .with_new_up(1, addr(6801))
                .with_new_up(2, addr(6802))
                .with_new_pool(1, PoolInfo::replicated("rbd", 2, 4)),
        )
        .unwrap();
        let first = Arc::new(map.clone());
        let acting = first.pg_to_up_acting(&PgId::new(1, 0)).acting;
        let outsider = (0..3).find(|osd| !acting.contains(osd)).unwrap();
        map.apply_incremental(
            &Incremental::new(fsid, 2).with_pg_temp(PgId::new(1, 0), vec![acting[0], outsider]),
        )
        .unwrap();
        (first, Arc::new(map))
    }

    fn make_pg(map: Arc<ClusterMap>, osd: OsdId) -> PlacementGroup {
        let pgid = SpgId::new(PgId::new(1, 0));
        PlacementGroup::new(
            pgid,
            PgShard::new(osd, None),
            CollectionHandle::new(CollectionId::Pg(pgid)),
            PoolInfo::replicated("rbd", 2, 4),
            "rbd".into(),
            map,
            BTreeMap::new(),
        )
    }

    fn init_from_map(pg: &PlacementGroup, map: &ClusterMap, txn: &mut Transaction) {
        let ua = map.pg_to_up_acting(&pg.pgid().pgid);
        let role = map.calc_pg_role(pg.whoami(), &ua.acting);
        pg.init(
            role,
            ua.up,
            ua.up_primary,
            ua.acting,
            ua.acting_primary,
            PgHistory::created_at(map.epoch()),
            PastIntervals::default(),
            txn,
        )
        .unwrap();
    }

    #[test]
    fn test_init_stages_collection_and_info() {
        let (first, _) = maps();
        let primary = first.pg_to_up_acting(&PgId::new(1, 0)).acting[0];
        let pg = make_pg(first.clone(), primary);
        let mut txn = Transaction::new();
        init_from_map(&pg, &first, &mut txn);

        assert!(pg.is_primary());
        assert_eq!(pg.state(), PgState::Initial);
        assert_eq!(txn.num_ops(), 2);
    }

    #[test]
    fn test_advance_map_opens_interval_and_queries_replicas() {
        let (first, second) = maps();
        let primary = first.pg_to_up_acting(&PgId::new(1, 0)).acting[0];
        let pg = make_pg(first.clone(), primary);
        init_from_map(&pg, &first, &mut Transaction::new());

        let mut ctx = PeeringCtx::new();
        pg.handle_advance_map(second.clone(), &mut ctx);

        assert_eq!(pg.epoch(), 2);
        assert_eq!(pg.history().same_interval_since, 2);
        assert_eq!(pg.past_intervals().len(), 1);
        assert_eq!(ctx.num_messages(), 1);
        let (to, msgs) = ctx.message_map.iter().next().unwrap();
        assert_ne!(*to, primary);
        assert!(matches!(
            &msgs[0],
            Message::Peering(PeeringMessage { kind: PeeringKind::Query, epoch: 2, .. })
        ));
    }

    #[test]
    fn test_replica_notifies_primary() {
        let (first, second) = maps();
        let acting = second.pg_to_up_acting(&PgId::new(1, 0)).acting;
        let pg = make_pg(first.clone(), acting[1]);
        init_from_map(&pg, &first, &mut Transaction::new());

        let mut ctx = PeeringCtx::new();
        pg.handle_advance_map(second, &mut ctx);
        assert_eq!(pg.role(), 1);
        let msgs = ctx.message_map.get(&acting[0]).unwrap();
        assert!(matches!(
            &msgs[0],
            Message::Peering(PeeringMessage { kind: PeeringKind::Notify, .. })
        ));
    }

    #[test]
    fn test_stale_map_is_ignored() {
        let (first, second) = maps();
        let pg = make_pg(second.clone(), 0);
        let mut ctx = PeeringCtx::new();
        pg.handle_advance_map(first, &mut ctx);
        assert_eq!(pg.epoch(), 2);
        assert!(ctx.is_empty());
    }

    #[tokio::test]
    async fn test_activate_then_read_state() {
        let (first, _) = maps();
        let primary = first.pg_to_up_acting(&PgId::new(1, 0)).acting[0];
        let pg = make_pg(first.clone(), primary);
        let mut ctx = PeeringCtx::new();
        init_from_map(&pg, &first, &mut ctx.transaction);
        pg.handle_activate_map(&mut ctx).unwrap();
        assert_eq!(pg.state(), PgState::Active);

        let store = MemStore::new();
        store
            .do_transaction(pg.collection(), ctx.transaction.take())
            .await
            .unwrap();

        let reloaded = make_pg(first, primary);
        reloaded.read_state(&store).await.unwrap();
        assert_eq!(reloaded.history().last_epoch_started, 1);
        assert!(reloaded.is_primary());
    }

    #[test]
    fn test_stop() {
        let (first, _) = maps();
        let pg = make_pg(first, 0);
        pg.stop();
        assert_eq!(pg.state(), PgState::Stopped);
        assert_eq!(pg.stats().state, PgState::Stopped);
    }
}
