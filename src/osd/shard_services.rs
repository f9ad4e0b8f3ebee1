//! Per-core PG services.
//!
//! Each execution core runs one [`ShardCoordinator`]. It owns the PGs
//! placed on that core, a copy of the current map and superblock, and the
//! creation state machine:
//!
//! ```text
//!   absent ──create info──▶ creating ──validation fails──▶ cancelled (None)
//!                              │
//!                              └──init, advance, activate──▶ present ──stop──▶ stopped
//! ```
//!
//! Map lookups and peer sends go to the [`ClusterMapAuthority`] on its own
//! core.

use super::authority::ClusterMapAuthority;
use super::superblock::Superblock;
use crate::error::{Error, Result, StorageError};
use crate::metrics::OsdMetrics;
use crate::network::Message;
use crate::osdmap::{ClusterMap, FLAG_CREATING};
use crate::pg::{
    CreationRole, PeeringCtx, PgCreateInfo, PgInfo, PgStats, PgWaiter, PlacementGroup,
    PlacementTable,
};
use crate::shard::{ensure_core, spawn_here, ShardRuntime};
use crate::storage::{CollectionHandle, CollectionId, ObjectStore, Transaction};
use crate::types::{CoreId, Epoch, OsdId, PgShard, SpgId};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

struct ShardState {
    osdmap: Arc<ClusterMap>,
    superblock: Superblock,
}

/// PG services of one execution core.
pub struct ShardCoordinator {
    core: CoreId,
    whoami: OsdId,
    runtime: Arc<ShardRuntime>,
    authority: Arc<ClusterMapAuthority>,
    store: Arc<dyn ObjectStore>,
    metrics: Arc<OsdMetrics>,
    state: Mutex<ShardState>,
    pg_map: PlacementTable,
    next_tid: AtomicU64,
}

impl ShardCoordinator {
    pub fn new(
        core: CoreId,
        runtime: Arc<ShardRuntime>,
        authority: Arc<ClusterMapAuthority>,
        store: Arc<dyn ObjectStore>,
        metrics: Arc<OsdMetrics>,
    ) -> Self {
        let fsid = authority.fsid();
        let whoami = authority.whoami();
        Self {
            core,
            whoami,
            runtime,
            authority,
            store,
            metrics,
            state: Mutex::new(ShardState {
                osdmap: Arc::new(ClusterMap::new(fsid)),
                superblock: Superblock::new(fsid, whoami),
            }),
            pg_map: PlacementTable::new(),
            next_tid: AtomicU64::new(u64::from(core) << 56),
        }
    }

    pub fn core(&self) -> CoreId {
        self.core
    }

    /// Current map of this core.
    pub fn osdmap(&self) -> Result<Arc<ClusterMap>> {
        ensure_core(self.core)?;
        Ok(self.current_map())
    }

    pub fn superblock(&self) -> Result<Superblock> {
        ensure_core(self.core)?;
        Ok(self.state.lock().superblock.clone())
    }

    /// Transaction id unique across cores: the core id sits in the top 8 bits.
    pub fn next_tid(&self) -> u64 {
        self.next_tid.fetch_add(1, Ordering::Relaxed)
    }

    fn current_map(&self) -> Arc<ClusterMap> {
        self.state.lock().osdmap.clone()
    }

    // ========================================================================
    // Maps
    // ========================================================================

    /// Install a newer map and superblock. Older maps are ignored.
    pub fn handle_new_map(&self, map: Arc<ClusterMap>, superblock: Superblock) -> Result<()> {
        ensure_core(self.core)?;
        let mut state = self.state.lock();
        if map.epoch() < state.osdmap.epoch() {
            debug!(
                core = self.core,
                epoch = map.epoch(),
                current = state.osdmap.epoch(),
                "Ignoring older map"
            );
            return Ok(());
        }
        debug!(core = self.core, epoch = map.epoch(), "Installed new map");
        state.osdmap = map;
        state.superblock = superblock;
        Ok(())
    }

    /// Map of `epoch`, from this core's current map or the authority.
    pub async fn get_map_at(&self, epoch: Epoch) -> Result<Arc<ClusterMap>> {
        ensure_core(self.core)?;
        let current = self.current_map();
        if current.epoch() == epoch {
            return Ok(current);
        }
        let authority = self.authority.clone();
        self.runtime
            .invoke_on(authority.owner(), move || async move {
                authority.get_local_map(epoch).await
            })
            .await?
    }

    /// Advance every PG on this core to `epoch` and activate it.
    pub async fn broadcast_map_to_pgs(&self, epoch: Epoch) -> Result<()> {
        ensure_core(self.core)?;
        let pgs = self.pg_map.get_pgs();
        debug!(core = self.core, epoch, pgs = pgs.len(), "Broadcasting map to pgs");
        for pg in pgs {
            let mut ctx = PeeringCtx::new();
            self.advance_pg(&pg, epoch, &mut ctx).await?;
            self.dispatch_context(pg.collection(), ctx).await?;
        }
        Ok(())
    }

    /// Step `pg` through every retained epoch up to `to`, then activate it.
    ///
    /// Epochs below the oldest retained map were skipped by the cluster and
    /// are stepped over.
    async fn advance_pg(&self, pg: &PlacementGroup, to: Epoch, ctx: &mut PeeringCtx) -> Result<()> {
        let oldest = self.state.lock().superblock.oldest_map;
        let from = pg.epoch().saturating_add(1).max(oldest);
        if from > pg.epoch().saturating_add(1) {
            info!(pgid = %pg.pgid(), epoch = pg.epoch(), oldest, "Pg skips trimmed epochs");
        }
        for epoch in from..=to {
            let map = self.get_map_at(epoch).await?;
            pg.handle_advance_map(map, ctx);
        }
        pg.handle_activate_map(ctx)
    }

    // ========================================================================
    // PG creation and loading
    // ========================================================================

    /// Build a PG object for `pgid` at `create_map`.
    ///
    /// Pool info comes from the map, or from the recorded final info when a
    /// newer epoch deleted the pool. Both lookups and the collection open run
    /// concurrently.
    pub async fn make_pg(
        &self,
        create_map: Arc<ClusterMap>,
        pgid: SpgId,
        create: bool,
    ) -> Result<Arc<PlacementGroup>> {
        ensure_core(self.core)?;
        let pool_id = pgid.pool();

        let pool_info = async {
            if let Some(pool) = create_map.pool(pool_id) {
                let ec_profile = match &pool.ec_profile {
                    Some(profile) => create_map.erasure_code_profile(profile),
                    None => BTreeMap::new(),
                };
                return Ok::<_, Error>((pool.clone(), pool.name.clone(), ec_profile));
            }
            let authority = self.authority.clone();
            let final_info = self
                .runtime
                .invoke_on(authority.owner(), move || async move {
                    authority.final_pool_info(pool_id).await
                })
                .await??;
            match final_info {
                Some(info) => Ok((info.pool, info.name, info.ec_profile)),
                None => Err(Error::from(StorageError::RecordNotFound(format!(
                    "final pool info of pool {}",
                    pool_id
                )))),
            }
        };

        let collection = async {
            let cid = CollectionId::Pg(pgid);
            if create {
                self.store.open_or_create_collection(cid).await
            } else {
                self.store
                    .open_collection(&cid)
                    .await?
                    .ok_or_else(|| StorageError::CollectionNotFound(cid.to_string()).into())
            }
        };

        let ((pool, name, ec_profile), coll) = tokio::try_join!(pool_info, collection)?;
        Ok(Arc::new(PlacementGroup::new(
            pgid,
            PgShard::new(self.whoami, pgid.shard),
            coll,
            pool,
            name,
            create_map,
            ec_profile,
        )))
    }

    /// Drive one creation to its terminal outcome and resolve the waiters.
    pub async fn handle_pg_create_info(self: Arc<Self>, info: PgCreateInfo) {
        let pgid = info.pgid;
        match self.create_pg(info).await {
            Ok(Some(pg)) => {
                info!(core = self.core, pgid = %pgid, epoch = pg.epoch(), "Created pg");
                self.pg_map.pg_created(pgid, pg);
                self.metrics.pgs_created.inc();
                self.metrics.pg_count.inc();
            }
            Ok(None) => {
                self.pg_map.pg_creation_canceled(pgid);
                self.metrics.pgs_canceled.inc();
            }
            Err(e) => {
                warn!(core = self.core, pgid = %pgid, error = %e, "Pg creation failed");
                self.pg_map.pg_creation_failed(pgid, &e.to_string());
                self.metrics.pg_creation_failures.inc();
            }
        }
    }

    async fn create_pg(&self, info: PgCreateInfo) -> Result<Option<Arc<PlacementGroup>>> {
        let pgid = info.pgid;
        let current = self.current_map();
        let startmap = self.get_map_at(info.epoch).await?;

        if !current.is_up_acting_osd_shard(&pgid, self.whoami) {
            info!(pgid = %pgid, epoch = current.epoch(), "Not up or acting in the current map, canceling creation");
            return Ok(None);
        }
        if !startmap.is_up_acting_osd_shard(&pgid, self.whoami) {
            info!(pgid = %pgid, epoch = startmap.epoch(), "Not up or acting at the creation epoch, canceling creation");
            return Ok(None);
        }
        if info.by_mon {
            match current.pool(pgid.pool()) {
                None => {
                    info!(pgid = %pgid, "Pool was deleted, canceling creation");
                    return Ok(None);
                }
                Some(pool) if !pool.is_sharded_backend() => {
                    info!(pgid = %pgid, pool = %pool.name, "Pool is not served by this backend, canceling creation");
                    return Ok(None);
                }
                Some(pool) if !pool.has_flag(FLAG_CREATING) => {
                    info!(pgid = %pgid, pool = %pool.name, "Pool is no longer creating, canceling creation");
                    return Ok(None);
                }
                Some(_) => {}
            }
        }

        let by_mon = info.by_mon;
        let cid = CollectionId::Pg(pgid);
        let pg = match self.make_pg(startmap.clone(), pgid, true).await {
            Ok(pg) => pg,
            Err(e) => {
                self.discard_collection(cid).await;
                return Err(e);
            }
        };
        if let Err(e) = self.init_pg(&pg, &startmap, current.epoch(), info).await {
            self.discard_collection(cid).await;
            return Err(e);
        }

        if by_mon {
            let authority = self.authority.clone();
            let created = pgid.pgid;
            self.runtime
                .invoke_on(authority.owner(), move || async move {
                    authority.send_pg_created(created).await
                })
                .await??;
        }
        Ok(Some(pg))
    }

    /// Initialize a new PG at `startmap`, catch it up to `to` and persist it.
    async fn init_pg(
        &self,
        pg: &PlacementGroup,
        startmap: &ClusterMap,
        to: Epoch,
        info: PgCreateInfo,
    ) -> Result<()> {
        let ua = startmap.pg_to_up_acting(&info.pgid.pgid);
        let role = startmap.calc_pg_role(pg.whoami(), &ua.acting);

        let mut ctx = PeeringCtx::new();
        pg.init(
            role,
            ua.up,
            ua.up_primary,
            ua.acting,
            ua.acting_primary,
            info.history,
            info.past_intervals,
            &mut ctx.transaction,
        )?;
        self.advance_pg(pg, to, &mut ctx).await?;
        self.dispatch_context(pg.collection(), ctx).await
    }

    /// Remove the collection of a creation that never committed its info.
    async fn discard_collection(&self, cid: CollectionId) {
        let mut txn = Transaction::new();
        txn.remove_collection(cid);
        match self.store.do_transaction(&CollectionHandle::new(cid), txn).await {
            Ok(()) => debug!(core = self.core, cid = %cid, "Removed collection of failed pg creation"),
            Err(e) => warn!(
                core = self.core,
                cid = %cid,
                error = %e,
                "Failed to remove collection of failed pg creation"
            ),
        }
    }

    /// Look up a PG, creating it from `info` when given.
    ///
    /// The first caller with creation info drives the creation on a task of
    /// this core; everyone else waits for the same outcome. Without info the
    /// returned waiter is ready at once.
    pub fn get_or_create_pg(
        self: &Arc<Self>,
        pgid: SpgId,
        info: Option<PgCreateInfo>,
    ) -> Result<PgWaiter> {
        ensure_core(self.core)?;
        let Some(info) = info else {
            return Ok(self.pg_map.lookup(&pgid));
        };

        let (waiter, role) = self.pg_map.begin_or_wait(pgid);
        if role == CreationRole::Driver {
            debug!(core = self.core, pgid = %pgid, epoch = info.epoch, "Starting pg creation");
            spawn_here(self.clone().handle_pg_create_info(info));
        }
        Ok(waiter)
    }

    /// Wait for `pgid` without starting a creation.
    pub fn wait_for_pg(&self, pgid: SpgId) -> Result<(PgWaiter, bool)> {
        ensure_core(self.core)?;
        Ok(self.pg_map.wait_for_pg(pgid))
    }

    /// Instantiate a PG from its on-disk state and catch it up to the current map.
    pub async fn load_pg(&self, pgid: SpgId) -> Result<Arc<PlacementGroup>> {
        ensure_core(self.core)?;
        let info = PgInfo::load(self.store.as_ref(), pgid).await?;
        let oldest = self.state.lock().superblock.oldest_map;
        let map = self.get_map_at(info.epoch.max(oldest)).await?;
        let pg = self.make_pg(map, pgid, false).await?;
        pg.read_state(self.store.as_ref()).await?;

        let mut ctx = PeeringCtx::new();
        self.advance_pg(&pg, self.current_map().epoch(), &mut ctx).await?;
        self.dispatch_context(pg.collection(), ctx).await?;

        info!(core = self.core, pgid = %pgid, from = info.epoch, epoch = pg.epoch(), "Loaded pg");
        self.pg_map.pg_loaded(pgid, pg.clone());
        self.metrics.pgs_loaded.inc();
        self.metrics.pg_count.inc();
        Ok(pg)
    }

    pub fn get_pg(&self, pgid: &SpgId) -> Result<Option<Arc<PlacementGroup>>> {
        ensure_core(self.core)?;
        Ok(self.pg_map.get_pg(pgid))
    }

    /// Take `pgid` out of this core's table.
    pub fn remove_pg(&self, pgid: &SpgId) -> Result<Option<Arc<PlacementGroup>>> {
        ensure_core(self.core)?;
        let removed = self.pg_map.remove_pg(pgid);
        if removed.is_some() {
            debug!(core = self.core, pgid = %pgid, "Removed pg");
            self.metrics.pg_count.dec();
        }
        Ok(removed)
    }

    pub fn num_pgs(&self) -> usize {
        self.pg_map.len()
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Send the context's messages and commit its transaction concurrently.
    pub async fn dispatch_context(&self, coll: &CollectionHandle, mut ctx: PeeringCtx) -> Result<()> {
        ensure_core(self.core)?;
        let messages = ctx.take_messages();
        let txn = ctx.transaction.take();
        tokio::try_join!(
            self.dispatch_context_messages(messages),
            self.dispatch_context_transaction(coll, txn)
        )?;
        Ok(())
    }

    /// Hand per-peer messages to the authority, stamped with this core's epoch.
    pub async fn dispatch_context_messages(
        &self,
        messages: BTreeMap<OsdId, Vec<Message>>,
    ) -> Result<()> {
        ensure_core(self.core)?;
        if messages.is_empty() {
            return Ok(());
        }
        let epoch = self.current_map().epoch();
        let authority = self.authority.clone();
        self.runtime
            .invoke_on(authority.owner(), move || async move {
                authority.send_messages(messages, epoch).await
            })
            .await?
    }

    /// Commit `txn`, or flush and run its callbacks when it has no ops.
    pub async fn dispatch_context_transaction(
        &self,
        coll: &CollectionHandle,
        mut txn: Transaction,
    ) -> Result<()> {
        ensure_core(self.core)?;
        if txn.is_empty() {
            self.store.flush(coll).await?;
            for callback in txn.collect_on_commit() {
                callback();
            }
            return Ok(());
        }
        self.store.do_transaction(coll, txn).await
    }

    // ========================================================================
    // Shutdown and reporting
    // ========================================================================

    /// Stop every PG and take it out of the table.
    pub fn stop_pgs(&self) -> Result<()> {
        ensure_core(self.core)?;
        let pgs = self.pg_map.get_pgs();
        info!(core = self.core, pgs = pgs.len(), "Stopping pgs");
        for pg in pgs {
            pg.stop();
            self.remove_pg(&pg.pgid())?;
        }
        Ok(())
    }

    /// Stats of the PGs this core is primary for.
    pub fn get_pg_stats(&self) -> Result<Vec<PgStats>> {
        ensure_core(self.core)?;
        Ok(self
            .pg_map
            .get_pgs()
            .into_iter()
            .filter(|pg| pg.is_primary())
            .map(|pg| pg.stats())
            .collect())
    }
}

impl std::fmt::Debug for ShardCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardCoordinator")
            .field("core", &self.core)
            .field("whoami", &self.whoami)
            .field("epoch", &self.state.lock().osdmap.epoch())
            .field("pg_map", &self.pg_map)
            .finish()
    }
}
