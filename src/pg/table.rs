//! Per-core registry of PGs and of in-flight creations.

use super::placement_group::PlacementGroup;
use crate::error::{Error, Result};
use crate::types::SpgId;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::debug;

/// Terminal outcome of a lookup or creation: the PG, or none.
pub type PgOutcome = Result<Option<Arc<PlacementGroup>>>;

/// What a caller of [`PlacementTable::begin_or_wait`] must do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationRole {
    /// The PG already exists; the waiter is ready.
    Existing,
    /// First requester: drive the creation and resolve the waiters.
    Driver,
    /// A creation is already in flight; just wait.
    Waiter,
}

/// Resolves to the outcome of a pending creation, or immediately on a hit.
#[derive(Debug)]
pub struct PgWaiter {
    inner: WaiterInner,
}

#[derive(Debug)]
enum WaiterInner {
    Ready(Option<PgOutcome>),
    Pending(oneshot::Receiver<PgOutcome>),
}

impl PgWaiter {
    fn ready(outcome: PgOutcome) -> Self {
        Self {
            inner: WaiterInner::Ready(Some(outcome)),
        }
    }

    fn pending(rx: oneshot::Receiver<PgOutcome>) -> Self {
        Self {
            inner: WaiterInner::Pending(rx),
        }
    }

    /// Whether the outcome is already known.
    pub fn is_ready(&self) -> bool {
        matches!(self.inner, WaiterInner::Ready(_))
    }
}

impl Future for PgWaiter {
    type Output = PgOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.inner {
            WaiterInner::Ready(outcome) => Poll::Ready(
                outcome
                    .take()
                    .unwrap_or_else(|| Err(Error::Internal("pg waiter polled twice".into()))),
            ),
            WaiterInner::Pending(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
                Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Cancelled)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

#[derive(Default)]
struct Creation {
    creating: bool,
    waiters: Vec<oneshot::Sender<PgOutcome>>,
}

#[derive(Default)]
struct TableState {
    pgs: BTreeMap<SpgId, Arc<PlacementGroup>>,
    pending: HashMap<SpgId, Creation>,
}

/// PGs owned by one core plus the waiters of pending creations.
///
/// Waiters of one PG resolve in registration order.
#[derive(Default)]
pub struct PlacementTable {
    state: Mutex<TableState>,
}

impl PlacementTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for `pgid` to appear.
    ///
    /// The flag is true when the PG exists or a creation is already in
    /// flight, meaning the caller must not start another one.
    pub fn wait_for_pg(&self, pgid: SpgId) -> (PgWaiter, bool) {
        let mut state = self.state.lock();
        if let Some(pg) = state.pgs.get(&pgid) {
            return (PgWaiter::ready(Ok(Some(pg.clone()))), true);
        }
        let creation = state.pending.entry(pgid).or_default();
        let (tx, rx) = oneshot::channel();
        creation.waiters.push(tx);
        (PgWaiter::pending(rx), creation.creating)
    }

    /// Ready waiter holding the PG if it is installed, or none.
    pub fn lookup(&self, pgid: &SpgId) -> PgWaiter {
        PgWaiter::ready(Ok(self.get_pg(pgid)))
    }

    /// Register a waiter and claim the driver role if nobody holds it.
    pub fn begin_or_wait(&self, pgid: SpgId) -> (PgWaiter, CreationRole) {
        let mut state = self.state.lock();
        if let Some(pg) = state.pgs.get(&pgid) {
            return (PgWaiter::ready(Ok(Some(pg.clone()))), CreationRole::Existing);
        }
        let creation = state.pending.entry(pgid).or_default();
        let (tx, rx) = oneshot::channel();
        creation.waiters.push(tx);
        let role = if creation.creating {
            CreationRole::Waiter
        } else {
            creation.creating = true;
            CreationRole::Driver
        };
        debug!(pgid = %pgid, role = ?role, waiters = creation.waiters.len(), "Registered pg waiter");
        (PgWaiter::pending(rx), role)
    }

    /// Mark a creation as in flight.
    pub fn set_creating(&self, pgid: SpgId) {
        let mut state = self.state.lock();
        state.pending.entry(pgid).or_default().creating = true;
    }

    pub fn is_creating(&self, pgid: &SpgId) -> bool {
        self.state
            .lock()
            .pending
            .get(pgid)
            .map(|c| c.creating)
            .unwrap_or(false)
    }

    /// Install a newly created PG and resolve its waiters.
    ///
    /// # Panics
    ///
    /// If `pgid` is already installed.
    pub fn pg_created(&self, pgid: SpgId, pg: Arc<PlacementGroup>) {
        self.install(pgid, pg, "created");
    }

    /// Install a PG loaded from disk and resolve any waiters.
    ///
    /// # Panics
    ///
    /// If `pgid` is already installed.
    pub fn pg_loaded(&self, pgid: SpgId, pg: Arc<PlacementGroup>) {
        self.install(pgid, pg, "loaded");
    }

    /// Resolve every waiter of `pgid` with "no PG".
    pub fn pg_creation_canceled(&self, pgid: SpgId) {
        let waiters = self.take_waiters(&pgid);
        debug!(pgid = %pgid, waiters = waiters.len(), "Pg creation canceled");
        for tx in waiters {
            let _ = tx.send(Ok(None));
        }
    }

    /// Resolve every waiter of `pgid` with the same failure.
    pub fn pg_creation_failed(&self, pgid: SpgId, reason: &str) {
        let waiters = self.take_waiters(&pgid);
        debug!(pgid = %pgid, reason, waiters = waiters.len(), "Pg creation failed");
        for tx in waiters {
            let _ = tx.send(Err(Error::PgCreationFailed {
                pgid,
                reason: reason.to_string(),
            }));
        }
    }

    pub fn get_pg(&self, pgid: &SpgId) -> Option<Arc<PlacementGroup>> {
        self.state.lock().pgs.get(pgid).cloned()
    }

    /// Every installed PG, ordered by id.
    pub fn get_pgs(&self) -> Vec<Arc<PlacementGroup>> {
        self.state.lock().pgs.values().cloned().collect()
    }

    pub fn remove_pg(&self, pgid: &SpgId) -> Option<Arc<PlacementGroup>> {
        self.state.lock().pgs.remove(pgid)
    }

    pub fn len(&self) -> usize {
        self.state.lock().pgs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of PG ids with registered waiters.
    pub fn num_pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn install(&self, pgid: SpgId, pg: Arc<PlacementGroup>, how: &'static str) {
        let waiters = {
            let mut state = self.state.lock();
            assert!(
                !state.pgs.contains_key(&pgid),
                "pg {} {} twice",
                pgid,
                how
            );
            state.pgs.insert(pgid, pg.clone());
            state
                .pending
                .remove(&pgid)
                .map(|c| c.waiters)
                .unwrap_or_default()
        };
        debug!(pgid = %pgid, how, waiters = waiters.len(), "Installed pg");
        for tx in waiters {
            let _ = tx.send(Ok(Some(pg.clone())));
        }
    }

    fn take_waiters(&self, pgid: &SpgId) -> Vec<oneshot::Sender<PgOutcome>> {
        self.state
            .lock()
            .pending
            .remove(pgid)
            .map(|c| c.waiters)
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for PlacementTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PlacementTable")
            .field("pgs", &state.pgs.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osdmap::{ClusterMap, PoolInfo};
    use crate::storage::{CollectionHandle, CollectionId};
    use crate::types::{PgId, PgShard};
    use uuid::Uuid;

    fn pgid() -> SpgId {
        SpgId::new(PgId::new(1, 0))
    }

    fn pg() -> Arc<PlacementGroup> {
        Arc::new(PlacementGroup::new(
            pgid(),
            PgShard::new(0, None),
            CollectionHandle::new(CollectionId::Pg(pgid())),
            PoolInfo::replicated("rbd", 1, 1),
            "rbd".into(),
            Arc::new(ClusterMap::new(Uuid::nil())),
            Default::default(),
        ))
    }

    #[tokio::test]
    async fn test_first_caller_drives_rest_wait() {
        let table = PlacementTable::new();
        let (w1, r1) = table.begin_or_wait(pgid());
        let (w2, r2) = table.begin_or_wait(pgid());
        assert_eq!(r1, CreationRole::Driver);
        assert_eq!(r2, CreationRole::Waiter);
        assert!(table.is_creating(&pgid()));

        let created = pg();
        table.pg_created(pgid(), created.clone());

        let a = w1.await.unwrap().unwrap();
        let b = w2.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &created));
        assert!(Arc::ptr_eq(&b, &created));
        assert_eq!(table.num_pending(), 0);
    }

    #[tokio::test]
    async fn test_hit_is_immediately_ready() {
        let table = PlacementTable::new();
        table.pg_loaded(pgid(), pg());

        let (waiter, role) = table.begin_or_wait(pgid());
        assert_eq!(role, CreationRole::Existing);
        assert!(waiter.is_ready());
        assert!(waiter.await.unwrap().is_some());

        let (waiter, existed) = table.wait_for_pg(pgid());
        assert!(existed);
        assert!(waiter.await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_wait_for_pg_reports_in_flight_creation() {
        let table = PlacementTable::new();
        let (_w, existed) = table.wait_for_pg(pgid());
        assert!(!existed);
        table.set_creating(pgid());
        let (_w2, existed) = table.wait_for_pg(pgid());
        assert!(existed);
    }

    #[tokio::test]
    async fn test_cancel_resolves_all_with_none() {
        let table = PlacementTable::new();
        let (w1, _) = table.begin_or_wait(pgid());
        let (w2, _) = table.wait_for_pg(pgid());
        table.pg_creation_canceled(pgid());

        assert!(w1.await.unwrap().is_none());
        assert!(w2.await.unwrap().is_none());
        assert!(!table.is_creating(&pgid()));
        assert!(table.get_pg(&pgid()).is_none());
    }

    #[tokio::test]
    async fn test_failure_reaches_every_waiter() {
        let table = PlacementTable::new();
        let (w1, _) = table.begin_or_wait(pgid());
        let (w2, _) = table.begin_or_wait(pgid());
        table.pg_creation_failed(pgid(), "disk gone");

        for waiter in [w1, w2] {
            match waiter.await {
                Err(Error::PgCreationFailed { reason, .. }) => assert_eq!(reason, "disk gone"),
                other => panic!("unexpected outcome: {:?}", other),
            }
        }
    }

    #[test]
    #[should_panic(expected = "twice")]
    fn test_duplicate_install_panics() {
        let table = PlacementTable::new();
        table.pg_created(pgid(), pg());
        table.pg_created(pgid(), pg());
    }

    #[test]
    fn test_remove_pg() {
        let table = PlacementTable::new();
        table.pg_loaded(pgid(), pg());
        assert_eq!(table.len(), 1);
        assert!(table.remove_pg(&pgid()).is_some());
        assert!(table.is_empty());
    }
}
