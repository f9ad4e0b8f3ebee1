//! The daemon façade.
//!
//! [`OsdNode`] wires the execution cores, the [`ClusterMapAuthority`] and one
//! [`ShardCoordinator`] per core:
//!
//! ```text
//!                    ┌──────────────────────────────┐
//!   MapUpdate ──────▶│           OsdNode            │◀────── PG requests
//!                    └──────────────────────────────┘
//!                        │                     │
//!            invoke_on(authority_core)   invoke_on(core_for(pgid))
//!                        ▼                     ▼
//!             ┌────────────────────┐  ┌────────────────────┐
//!             │ ClusterMapAuthority│◀─│ ShardCoordinator×N │
//!             │  maps, superblock, │  │  PlacementTable,   │
//!             │  pg_temp, alive    │  │  PGs, current map  │
//!             └────────────────────┘  └────────────────────┘
//! ```
//!
//! PGs are assigned to the least-loaded core on first use and stay there.

pub mod authority;
mod pg_temp;
mod shard_services;
mod superblock;

pub use authority::{ClusterMapAuthority, MapUpdateOutcome};
pub use pg_temp::{PgTempBatch, PgTempEntry, PgTempQueue};
pub use shard_services::ShardCoordinator;
pub use superblock::Superblock;

use crate::config::OsdConfig;
use crate::error::{Error, Result};
use crate::metrics::OsdMetrics;
use crate::network::{MapUpdate, Messenger, MonClient};
use crate::osdmap::ClusterMap;
use crate::pg::{PgCreateInfo, PgStats, PlacementGroup};
use crate::scrub::{ScrubBackend, ScrubEvent};
use crate::shard::ShardRuntime;
use crate::storage::{CollectionHandle, CollectionId, ObjectKey, ObjectStore, Transaction};
use crate::types::{CoreId, Epoch, OsdId, PgId, SpgId};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use twox_hash::XxHash64;

/// A storage daemon: map authority, per-core PG services and PG placement.
pub struct OsdNode {
    config: RwLock<OsdConfig>,
    runtime: Arc<ShardRuntime>,
    authority: Arc<ClusterMapAuthority>,
    coordinators: Vec<Arc<ShardCoordinator>>,
    pg_to_core: DashMap<SpgId, CoreId>,
    core_load: Vec<AtomicUsize>,
    metrics: Arc<OsdMetrics>,
    store: Arc<dyn ObjectStore>,
}

impl OsdNode {
    /// Start the cores, restore the superblock and load every PG on disk.
    pub async fn start(
        config: OsdConfig,
        store: Arc<dyn ObjectStore>,
        messenger: Arc<dyn Messenger>,
        monc: Arc<dyn MonClient>,
    ) -> Result<Self> {
        config.validate()?;

        let runtime = Arc::new(ShardRuntime::start(config.num_cores)?);
        let metrics = Arc::new(OsdMetrics::new());
        let authority = Arc::new(ClusterMapAuthority::new(
            config.clone(),
            store.clone(),
            messenger,
            monc,
            metrics.clone(),
        ));

        let coordinators: Vec<Arc<ShardCoordinator>> = (0..config.num_cores)
            .map(|core| {
                Arc::new(ShardCoordinator::new(
                    core,
                    runtime.clone(),
                    authority.clone(),
                    store.clone(),
                    metrics.clone(),
                ))
            })
            .collect();

        let node = Self {
            core_load: (0..config.num_cores).map(|_| AtomicUsize::new(0)).collect(),
            config: RwLock::new(config),
            runtime,
            authority,
            coordinators,
            pg_to_core: DashMap::new(),
            metrics,
            store,
        };

        node.with_authority(|authority| async move { authority.init().await })
            .await?;
        node.publish_map().await?;
        let loaded = node.load_pgs().await?;

        info!(
            osd = node.whoami(),
            cores = node.coordinators.len(),
            pgs = loaded,
            "Daemon started"
        );
        Ok(node)
    }

    pub fn whoami(&self) -> OsdId {
        self.authority.whoami()
    }

    pub fn authority(&self) -> &Arc<ClusterMapAuthority> {
        &self.authority
    }

    pub fn runtime(&self) -> &Arc<ShardRuntime> {
        &self.runtime
    }

    pub fn metrics(&self) -> &Arc<OsdMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> OsdConfig {
        self.config.read().clone()
    }

    /// Core hosting `pgid`, if it has been placed.
    pub fn core_of(&self, pgid: &SpgId) -> Option<CoreId> {
        self.pg_to_core.get(pgid).map(|core| *core)
    }

    /// Run `f` against the authority on its core.
    pub async fn with_authority<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Arc<ClusterMapAuthority>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let authority = self.authority.clone();
        self.runtime
            .invoke_on(authority.owner(), move || f(authority))
            .await?
    }

    /// Run `f` against the coordinator of `core` on that core.
    pub async fn with_coordinator<F, Fut, T>(&self, core: CoreId, f: F) -> Result<T>
    where
        F: FnOnce(Arc<ShardCoordinator>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let coordinator = self
            .coordinators
            .get(core as usize)
            .cloned()
            .ok_or(Error::UnknownCore(core))?;
        self.runtime.invoke_on(core, move || f(coordinator)).await?
    }

    // ========================================================================
    // Maps
    // ========================================================================

    /// Apply a map batch and, if anything was committed, advance every core.
    pub async fn handle_map_update(&self, update: MapUpdate) -> Result<MapUpdateOutcome> {
        let outcome = self
            .with_authority(move |authority| async move {
                authority.apply_incoming_maps(&update).await
            })
            .await?;
        if outcome.applied_through().is_some() {
            self.publish_map().await?;
        }
        Ok(outcome)
    }

    /// Current map of the authority.
    pub async fn osdmap(&self) -> Result<Arc<ClusterMap>> {
        self.with_authority(|authority| async move { authority.osdmap() })
            .await
    }

    /// Push the authority's map and superblock to every core and advance its PGs.
    pub async fn publish_map(&self) -> Result<()> {
        let (map, superblock) = self
            .with_authority(|authority| async move {
                Ok((authority.osdmap()?, authority.superblock()?))
            })
            .await?;
        let epoch = map.epoch();
        for core in 0..self.coordinators.len() as CoreId {
            let map = map.clone();
            let superblock = superblock.clone();
            self.with_coordinator(core, move |coordinator| async move {
                coordinator.handle_new_map(map, superblock)?;
                coordinator.broadcast_map_to_pgs(epoch).await
            })
            .await?;
        }
        debug!(epoch, "Published map to all cores");
        Ok(())
    }

    /// Trim stored epochs up to `new_floor`. Returns the removed epochs.
    pub async fn trim(&self, new_floor: Epoch) -> Result<Vec<Epoch>> {
        self.with_authority(move |authority| async move { authority.trim(new_floor).await })
            .await
    }

    // ========================================================================
    // PGs
    // ========================================================================

    /// Core for `pgid`: the one it is already on, else the least-loaded.
    ///
    /// Ties go to the first core at or after a hash-derived start index, so
    /// PGs spread evenly when every core is empty.
    fn core_for(&self, pgid: SpgId) -> CoreId {
        *self.pg_to_core.entry(pgid).or_insert_with(|| {
            let num_cores = self.core_load.len();
            let mut hasher = XxHash64::with_seed(0);
            pgid.hash(&mut hasher);
            let start = (hasher.finish() % num_cores as u64) as usize;

            let core = (0..num_cores)
                .map(|offset| (start + offset) % num_cores)
                .min_by_key(|core| self.core_load[*core].load(Ordering::Relaxed))
                .unwrap_or(0);
            self.core_load[core].fetch_add(1, Ordering::Relaxed);
            debug!(pgid = %pgid, core, "Assigned pg to core");
            core as CoreId
        })
    }

    /// Look up `pgid`, creating it from `info` when given.
    ///
    /// Resolves to `None` when the PG does not exist and no creation was
    /// requested, or when the creation was cancelled.
    pub async fn get_or_create_pg(
        &self,
        pgid: SpgId,
        info: Option<PgCreateInfo>,
    ) -> Result<Option<Arc<PlacementGroup>>> {
        let core = match (&info, self.core_of(&pgid)) {
            (_, Some(core)) => core,
            (Some(_), None) => self.core_for(pgid),
            (None, None) => return Ok(None),
        };
        self.with_coordinator(core, move |coordinator| async move {
            coordinator.get_or_create_pg(pgid, info)?.await
        })
        .await
    }

    /// Instantiate `pgid` from disk on its core.
    pub async fn load_pg(&self, pgid: SpgId) -> Result<Arc<PlacementGroup>> {
        let core = self.core_for(pgid);
        self.with_coordinator(core, move |coordinator| async move {
            coordinator.load_pg(pgid).await
        })
        .await
    }

    pub async fn get_pg(&self, pgid: SpgId) -> Result<Option<Arc<PlacementGroup>>> {
        let Some(core) = self.core_of(&pgid) else {
            return Ok(None);
        };
        self.with_coordinator(core, move |coordinator| async move { coordinator.get_pg(&pgid) })
            .await
    }

    /// Load every PG collection on disk. Collections without PG info are
    /// leftovers of creations that never committed and are removed.
    async fn load_pgs(&self) -> Result<usize> {
        let mut loaded = 0;
        for cid in self.store.list_collections().await? {
            let CollectionId::Pg(pgid) = cid else {
                continue;
            };
            if self.store.read(&cid, &ObjectKey::PgInfo).await?.is_none() {
                warn!(pgid = %pgid, "Removing pg collection without pg info");
                let mut txn = Transaction::new();
                txn.remove_collection(cid);
                self.store
                    .do_transaction(&CollectionHandle::new(cid), txn)
                    .await?;
                continue;
            }
            self.load_pg(pgid).await?;
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Stats of every PG this daemon is primary for, across all cores.
    pub async fn pg_stats(&self) -> Result<Vec<PgStats>> {
        let mut stats = Vec::new();
        for core in 0..self.coordinators.len() as CoreId {
            stats.extend(
                self.with_coordinator(core, |coordinator| async move {
                    coordinator.get_pg_stats()
                })
                .await?,
            );
        }
        stats.sort_by_key(|stat| stat.pgid);
        Ok(stats)
    }

    /// Ask `backend` to scan `[start, end)` of `pgid`. Returns false if the
    /// PG is not hosted here.
    pub async fn request_scrub(
        &self,
        pgid: SpgId,
        backend: Arc<dyn ScrubBackend>,
        start: String,
        end: String,
        deep: bool,
    ) -> Result<bool> {
        match self.get_pg(pgid).await? {
            Some(pg) => {
                pg.request_scan(backend.as_ref(), start, end, deep)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Route a scrub result to its PG. Events for unknown PGs are dropped.
    pub async fn handle_scrub_event(&self, event: ScrubEvent) -> Result<()> {
        let pgid = match &event {
            ScrubEvent::ScanComplete { pgid, .. } => *pgid,
        };
        match self.get_pg(pgid).await? {
            Some(pg) => pg.handle_scrub_event(event),
            None => debug!(pgid = %pgid, "Dropping scrub event for unknown pg"),
        }
        Ok(())
    }

    // ========================================================================
    // Monitor traffic
    // ========================================================================

    /// Claim liveness through `want`. Returns whether a claim was sent.
    pub async fn send_alive(&self, want: Epoch) -> Result<bool> {
        self.with_authority(move |authority| async move { authority.send_alive(want).await })
            .await
    }

    pub async fn queue_pg_temp(&self, pgid: PgId, acting: Vec<OsdId>, forced: bool) -> Result<()> {
        self.with_authority(move |authority| async move {
            authority.queue_want_pg_temp(pgid, acting, forced)
        })
        .await
    }

    pub async fn remove_pg_temp(&self, pgid: PgId) -> Result<()> {
        self.with_authority(move |authority| async move { authority.remove_want_pg_temp(&pgid) })
            .await
    }

    pub async fn send_pg_temp(&self) -> Result<()> {
        self.with_authority(|authority| async move { authority.send_pg_temp().await })
            .await
    }

    pub async fn requeue_pg_temp(&self) -> Result<()> {
        self.with_authority(|authority| async move { authority.requeue_pg_temp() })
            .await
    }

    /// Replay monitor state after a new monitor session.
    ///
    /// Unacknowledged pg_temp and pg_created are sent again and the map
    /// subscription is renewed from the next epoch.
    pub async fn handle_monitor_reconnect(&self) -> Result<()> {
        self.with_authority(|authority| async move {
            authority.requeue_pg_temp()?;
            authority.send_pg_temp().await?;
            authority.resend_pg_created().await?;
            let next = authority.superblock()?.newest_map + 1;
            authority.osdmap_subscribe(next, true).await
        })
        .await
    }

    // ========================================================================
    // Configuration and shutdown
    // ========================================================================

    /// Apply a configuration change to the reservation ledgers.
    pub async fn handle_conf_change(
        &self,
        config: OsdConfig,
        changed: HashSet<String>,
    ) -> Result<()> {
        *self.config.write() = config.clone();
        self.with_authority(move |authority| async move {
            authority.handle_conf_change(&config, &changed)
        })
        .await
    }

    /// Stop every PG, then the cores.
    pub async fn stop(&self) -> Result<()> {
        for core in 0..self.coordinators.len() as CoreId {
            self.with_coordinator(core, |coordinator| async move { coordinator.stop_pgs() })
                .await?;
        }
        self.runtime.shutdown().await;
        info!(osd = self.whoami(), "Daemon stopped");
        Ok(())
    }
}

impl std::fmt::Debug for OsdNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OsdNode")
            .field("osd", &self.whoami())
            .field("cores", &self.coordinators.len())
            .field("pgs", &self.pg_to_core.len())
            .finish()
    }
}
