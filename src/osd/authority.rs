//! The process-wide owner of the cluster map.
//!
//! One [`ClusterMapAuthority`] exists per daemon. It lives on a designated
//! core and every public operation checks it runs there; other cores reach
//! it through [`ShardRuntime::invoke_on`](crate::shard::ShardRuntime::invoke_on).
//!
//! ```text
//!  monitor ──MapUpdate──▶ apply_incoming_maps ──▶ Transaction ──▶ ObjectStore
//!                                │                                  │
//!                                ▼                                  │
//!                 EpochCache / EncodedMapCache ◀── commit ──────────┘
//!                                │
//!                                ▼
//!        get_local_map, build_incremental_update, trim
//! ```

use super::pg_temp::{PgTempEntry, PgTempQueue};
use super::superblock::Superblock;
use crate::cache::{EncodedMapCache, EpochCache};
use crate::config::OsdConfig;
use crate::error::{Error, MapError, Result};
use crate::metrics::OsdMetrics;
use crate::network::{
    Connection, MapEntry, MapUpdate, Message, Messenger, MonClient, PgTempRequest, SubscribeMode,
};
use crate::osdmap::{self, ClusterMap, FLAG_CREATING};
use crate::reservation::Reservers;
use crate::shard::ensure_core;
use crate::storage::{FinalPoolInfo, MetaCollection, ObjectStore, Transaction};
use crate::types::{CoreId, Epoch, OsdId, PgId, PoolId};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Result of [`ClusterMapAuthority::apply_incoming_maps`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapUpdateOutcome {
    /// Epochs `first..=last` were committed.
    Applied { first: Epoch, last: Epoch },
    /// Nothing newer than what is already stored.
    Stale,
    /// The batch starts after `newest + 1`; the missing range was requested.
    Gap { newest: Epoch, first: Epoch },
}

impl MapUpdateOutcome {
    /// Newest epoch committed by this call, if any.
    pub fn applied_through(&self) -> Option<Epoch> {
        match self {
            MapUpdateOutcome::Applied { last, .. } => Some(*last),
            _ => None,
        }
    }
}

struct StagedEpoch {
    epoch: Epoch,
    map: ClusterMap,
    full: Bytes,
    inc: Option<Bytes>,
}

struct AuthorityState {
    osdmap: Arc<ClusterMap>,
    superblock: Superblock,
    pg_temp: PgTempQueue,
    pg_created: BTreeSet<PgId>,
    up_thru_wanted: Epoch,
}

/// Owner of the current map, the superblock and the map caches.
pub struct ClusterMapAuthority {
    owner: CoreId,
    whoami: OsdId,
    config: RwLock<OsdConfig>,
    state: Mutex<AuthorityState>,
    /// Serializes map application and trimming so epochs commit in order.
    apply_lock: tokio::sync::Mutex<()>,
    maps: EpochCache<ClusterMap>,
    map_bl_cache: EncodedMapCache,
    inc_map_bl_cache: EncodedMapCache,
    meta: MetaCollection,
    reservers: Reservers,
    messenger: Arc<dyn Messenger>,
    monc: Arc<dyn MonClient>,
    metrics: Arc<OsdMetrics>,
}

impl ClusterMapAuthority {
    pub fn new(
        config: OsdConfig,
        store: Arc<dyn ObjectStore>,
        messenger: Arc<dyn Messenger>,
        monc: Arc<dyn MonClient>,
        metrics: Arc<OsdMetrics>,
    ) -> Self {
        let fsid = monc.cluster_id();
        Self {
            owner: config.authority_core,
            whoami: config.osd_id,
            state: Mutex::new(AuthorityState {
                osdmap: Arc::new(ClusterMap::new(fsid)),
                superblock: Superblock::new(fsid, config.osd_id),
                pg_temp: PgTempQueue::new(),
                pg_created: BTreeSet::new(),
                up_thru_wanted: 0,
            }),
            apply_lock: tokio::sync::Mutex::new(()),
            maps: EpochCache::new(config.map_cache_size),
            map_bl_cache: EncodedMapCache::new(config.map_bl_cache_size),
            inc_map_bl_cache: EncodedMapCache::new(config.map_bl_cache_size),
            meta: MetaCollection::new(store),
            reservers: Reservers::new(&config),
            config: RwLock::new(config),
            messenger,
            monc,
            metrics,
        }
    }

    /// Core this authority is bound to.
    pub fn owner(&self) -> CoreId {
        self.owner
    }

    pub fn whoami(&self) -> OsdId {
        self.whoami
    }

    pub fn fsid(&self) -> Uuid {
        self.monc.cluster_id()
    }

    /// Restore the superblock and current map from disk.
    pub async fn init(&self) -> Result<()> {
        ensure_core(self.owner)?;

        let Some(superblock) = self.meta.load_superblock().await? else {
            info!(osd = self.whoami, "No superblock on disk, starting at epoch 0");
            return Ok(());
        };
        let fsid = self.fsid();
        if superblock.fsid != fsid {
            return Err(Error::FsidMismatch {
                expected: fsid,
                got: superblock.fsid,
            });
        }

        let osdmap = if superblock.is_empty() {
            Arc::new(ClusterMap::new(fsid))
        } else {
            self.get_local_map(superblock.newest_map).await?
        };
        self.metrics
            .set_map_range(superblock.oldest_map, superblock.newest_map);
        info!(
            osd = self.whoami,
            oldest = superblock.oldest_map,
            newest = superblock.newest_map,
            trim_lower_bound = superblock.cluster_trim_lower_bound,
            "Loaded superblock"
        );

        let mut state = self.state.lock();
        state.osdmap = osdmap;
        state.superblock = superblock;
        Ok(())
    }

    // ========================================================================
    // Map application and trimming
    // ========================================================================

    /// Apply a batch of map epochs from the monitor or a peer.
    ///
    /// Every epoch after the newest stored one is decoded or derived from
    /// its predecessor, then all of them are committed in one transaction.
    /// Nothing is cached before the commit succeeds.
    pub async fn apply_incoming_maps(&self, update: &MapUpdate) -> Result<MapUpdateOutcome> {
        ensure_core(self.owner)?;
        let _serial = self.apply_lock.lock().await;

        let fsid = self.fsid();
        if update.fsid != fsid {
            self.metrics.map_batches_rejected.inc();
            return Err(Error::FsidMismatch {
                expected: fsid,
                got: update.fsid,
            });
        }
        let Some((first, last)) = update.epoch_range() else {
            return Ok(MapUpdateOutcome::Stale);
        };
        self.metrics
            .maps_received_full
            .inc_by(update.maps.len() as u64);
        self.metrics
            .maps_received_incremental
            .inc_by(update.incremental_maps.len() as u64);

        let (mut superblock, current) = {
            let state = self.state.lock();
            (state.superblock.clone(), state.osdmap.clone())
        };
        let newest = superblock.newest_map;
        if last <= newest {
            debug!(first, last, newest, "Ignoring stale map update");
            return Ok(MapUpdateOutcome::Stale);
        }
        // Epochs can only be skipped when the cluster has trimmed them and
        // the batch restarts from a full map.
        let skips = first > newest + 1;
        if skips
            && !(update.maps.contains_key(&first)
                && (superblock.is_empty() || update.cluster_trim_lower_bound >= first))
        {
            info!(
                first,
                last,
                newest,
                trim_lower_bound = update.cluster_trim_lower_bound,
                "Gap in map updates, requesting missing epochs"
            );
            self.osdmap_subscribe(newest + 1, false).await?;
            return Ok(MapUpdateOutcome::Gap { newest, first });
        }
        let start = first.max(newest + 1);

        let mut txn = Transaction::new();
        let staged = match self.stage_epochs(update, start, first, last, &mut txn).await {
            Ok(staged) => staged,
            Err(e) => {
                self.metrics.map_batches_rejected.inc();
                return Err(e);
            }
        };
        self.stage_final_pool_infos(&mut txn, &current, &staged)?;

        let mut dropped = Vec::new();
        if skips && !superblock.is_empty() {
            dropped = self.stage_drop_retained(&mut txn, &mut superblock, first);
        }
        superblock.insert_range(start, last);
        let trim_lower_bound = update.cluster_trim_lower_bound.min(last);
        if trim_lower_bound > superblock.cluster_trim_lower_bound {
            superblock.cluster_trim_lower_bound = trim_lower_bound;
        }
        let trimmed = self.stage_trim(&mut txn, &mut superblock, trim_lower_bound);
        self.meta.store_superblock(&mut txn, &superblock)?;

        self.meta
            .store()
            .do_transaction(self.meta.handle(), txn)
            .await?;

        for epoch in dropped.iter().chain(&trimmed) {
            self.map_bl_cache.invalidate(*epoch);
            self.inc_map_bl_cache.invalidate(*epoch);
        }
        let mut newest_map = None;
        for staged_epoch in staged {
            if staged_epoch.epoch < superblock.oldest_map {
                continue;
            }
            self.map_bl_cache
                .insert(staged_epoch.epoch, staged_epoch.full);
            if let Some(inc) = staged_epoch.inc {
                self.inc_map_bl_cache.insert(staged_epoch.epoch, inc);
            }
            newest_map = Some(self.maps.insert(staged_epoch.epoch, staged_epoch.map));
        }

        {
            let mut state = self.state.lock();
            if let Some(map) = newest_map {
                state.osdmap = map;
            }
            state.superblock = superblock.clone();
        }
        self.prune_pg_created()?;

        self.metrics.maps_applied.inc_by(u64::from(last - start + 1));
        self.metrics
            .epochs_trimmed
            .inc_by((dropped.len() + trimmed.len()) as u64);
        self.metrics
            .set_map_range(superblock.oldest_map, superblock.newest_map);
        info!(
            first = start,
            last,
            oldest = superblock.oldest_map,
            trimmed = trimmed.len(),
            "Committed maps"
        );

        Ok(MapUpdateOutcome::Applied { first: start, last })
    }

    async fn stage_epochs(
        &self,
        update: &MapUpdate,
        start: Epoch,
        first: Epoch,
        last: Epoch,
        txn: &mut Transaction,
    ) -> Result<Vec<StagedEpoch>> {
        let fsid = self.fsid();
        let mut staged: Vec<StagedEpoch> = Vec::new();

        for epoch in start..=last {
            let Some(entry) = update.entry(epoch) else {
                error!(epoch, first, last, "Map update has no encoding for a claimed epoch");
                return Err(Error::ProtocolViolation { epoch, first, last });
            };

            let staged_epoch = match entry {
                MapEntry::Full(full) => {
                    let map = osdmap::decode_full(&full)?;
                    if map.epoch() != epoch {
                        return Err(MapError::MisfiledEpoch {
                            expected: epoch,
                            encoded: map.epoch(),
                        }
                        .into());
                    }
                    if map.fsid() != fsid {
                        return Err(MapError::FsidMismatch.into());
                    }
                    debug!(epoch, bytes = full.len(), "Decoded full map");
                    StagedEpoch {
                        epoch,
                        map,
                        full,
                        inc: update.incremental_maps.get(&epoch).cloned(),
                    }
                }
                MapEntry::Incremental(inc_bytes) => {
                    let inc = osdmap::decode_incremental(&inc_bytes)?;
                    let mut map = match staged.last() {
                        Some(prev) if prev.epoch + 1 == epoch => prev.map.clone(),
                        _ => ClusterMap::clone(&*self.get_local_map(epoch - 1).await?),
                    };
                    map.apply_incremental(&inc)?;
                    let full = osdmap::encode_full(&map)?;
                    debug!(epoch, bytes = inc_bytes.len(), "Applied incremental map");
                    StagedEpoch {
                        epoch,
                        map,
                        full,
                        inc: Some(inc_bytes),
                    }
                }
            };

            self.meta
                .store_map(txn, epoch, staged_epoch.full.clone());
            if let Some(inc) = &staged_epoch.inc {
                self.meta.store_inc_map(txn, epoch, inc.clone());
            }
            staged.push(staged_epoch);
        }

        Ok(staged)
    }

    /// Persist the last known info of every pool the batch deletes.
    fn stage_final_pool_infos(
        &self,
        txn: &mut Transaction,
        current: &ClusterMap,
        staged: &[StagedEpoch],
    ) -> Result<()> {
        let mut prev = current;
        for staged_epoch in staged {
            for (pool, info) in prev.pools() {
                if staged_epoch.map.has_pool(*pool) {
                    continue;
                }
                let ec_profile = match &info.ec_profile {
                    Some(profile) => prev.erasure_code_profile(profile),
                    None => BTreeMap::new(),
                };
                let final_info = FinalPoolInfo {
                    pool: info.clone(),
                    name: info.name.clone(),
                    ec_profile,
                };
                info!(pool, epoch = staged_epoch.epoch, "Recording final info of deleted pool");
                self.meta.store_final_pool_info(txn, *pool, &final_info)?;
            }
            prev = &staged_epoch.map;
        }
        Ok(())
    }

    /// Stage removal of every retained epoch before a skipped range and
    /// restart the retained range at `first`.
    fn stage_drop_retained(
        &self,
        txn: &mut Transaction,
        superblock: &mut Superblock,
        first: Epoch,
    ) -> Vec<Epoch> {
        let dropped: Vec<Epoch> = (superblock.oldest_map..=superblock.newest_map).collect();
        for epoch in &dropped {
            self.meta.remove_map(txn, *epoch);
            self.meta.remove_inc_map(txn, *epoch);
        }
        warn!(
            oldest = superblock.oldest_map,
            newest = superblock.newest_map,
            first,
            "Skipping epochs trimmed by the cluster, dropping retained maps"
        );
        superblock.oldest_map = first;
        dropped
    }

    /// Stage removal of epochs below `min(floor, cached_lower_bound)`.
    ///
    /// Stops once `txn` reaches the configured operation budget.
    fn stage_trim(
        &self,
        txn: &mut Transaction,
        superblock: &mut Superblock,
        floor: Epoch,
    ) -> Vec<Epoch> {
        let mut removed = Vec::new();
        if superblock.is_empty() {
            return removed;
        }

        self.maps.release_below(floor);
        let lower_bound = self.maps.cached_lower_bound();
        let bound = match lower_bound {
            Some(resident) => floor.min(resident),
            None => floor,
        };
        if bound <= superblock.oldest_map {
            debug!(
                floor,
                lower_bound = ?lower_bound,
                oldest = superblock.oldest_map,
                "Nothing to trim"
            );
            return removed;
        }

        let budget = self.config.read().target_transaction_size;
        while superblock.oldest_map < bound && txn.num_ops() < budget {
            let epoch = superblock.oldest_map;
            self.meta.remove_map(txn, epoch);
            self.meta.remove_inc_map(txn, epoch);
            removed.push(epoch);
            superblock.oldest_map += 1;
        }

        // Epochs a live PG still holds must stay on disk.
        if let Some(resident) = lower_bound {
            assert!(
                superblock.oldest_map <= resident,
                "trimmed to {} past resident epoch {}",
                superblock.oldest_map,
                resident
            );
        }
        debug!(
            floor,
            bound,
            removed = removed.len(),
            oldest = superblock.oldest_map,
            "Staged trim"
        );
        removed
    }

    /// Remove persisted epochs below `min(new_floor, cached_lower_bound)`.
    ///
    /// `new_floor` is clamped to the newest stored epoch and raises the
    /// recorded cluster trim lower bound. Returns the removed epochs.
    pub async fn trim(&self, new_floor: Epoch) -> Result<Vec<Epoch>> {
        ensure_core(self.owner)?;
        let _serial = self.apply_lock.lock().await;

        let before = self.state.lock().superblock.clone();
        if before.is_empty() {
            return Ok(Vec::new());
        }
        let mut superblock = before.clone();
        let floor = new_floor.min(superblock.newest_map);
        if floor > superblock.cluster_trim_lower_bound {
            superblock.cluster_trim_lower_bound = floor;
        }

        let mut txn = Transaction::new();
        let removed = self.stage_trim(&mut txn, &mut superblock, floor);
        if superblock == before {
            return Ok(removed);
        }
        self.meta.store_superblock(&mut txn, &superblock)?;
        self.meta
            .store()
            .do_transaction(self.meta.handle(), txn)
            .await?;

        for epoch in &removed {
            self.map_bl_cache.invalidate(*epoch);
            self.inc_map_bl_cache.invalidate(*epoch);
        }
        self.state.lock().superblock = superblock.clone();
        self.metrics.epochs_trimmed.inc_by(removed.len() as u64);
        self.metrics
            .set_map_range(superblock.oldest_map, superblock.newest_map);
        info!(
            floor,
            removed = removed.len(),
            oldest = superblock.oldest_map,
            "Trimmed maps"
        );
        Ok(removed)
    }

    // ========================================================================
    // Map lookup
    // ========================================================================

    /// Decoded map of `epoch`, from the cache or storage.
    pub async fn get_local_map(&self, epoch: Epoch) -> Result<Arc<ClusterMap>> {
        ensure_core(self.owner)?;
        if epoch == 0 {
            return Ok(Arc::new(ClusterMap::new(self.fsid())));
        }
        if let Some(map) = self.maps.get(epoch) {
            self.metrics.map_cache_hits.inc();
            return Ok(map);
        }
        self.metrics.map_cache_misses.inc();
        debug!(epoch, "Map cache miss");
        let map = self.load_map(epoch).await?;
        Ok(self.maps.insert(epoch, map))
    }

    /// Decode `epoch` from its stored full encoding.
    pub async fn load_map(&self, epoch: Epoch) -> Result<ClusterMap> {
        ensure_core(self.owner)?;
        if epoch == 0 {
            return Ok(ClusterMap::new(self.fsid()));
        }
        let bytes = self.load_map_bl(epoch).await?;
        let map = osdmap::decode_full(&bytes)?;
        if map.epoch() != epoch {
            return Err(MapError::MisfiledEpoch {
                expected: epoch,
                encoded: map.epoch(),
            }
            .into());
        }
        Ok(map)
    }

    /// Full encoding of `epoch`.
    pub async fn load_map_bl(&self, epoch: Epoch) -> Result<Bytes> {
        ensure_core(self.owner)?;
        if let Some(bytes) = self.map_bl_cache.get(epoch) {
            return Ok(bytes);
        }
        let bytes = self.meta.load_map(epoch).await?;
        self.map_bl_cache.insert(epoch, bytes.clone());
        Ok(bytes)
    }

    /// Incremental encoding of `epoch`, if one was stored.
    pub async fn load_inc_map_bl(&self, epoch: Epoch) -> Result<Option<Bytes>> {
        ensure_core(self.owner)?;
        if let Some(bytes) = self.inc_map_bl_cache.get(epoch) {
            return Ok(Some(bytes));
        }
        let bytes = self.meta.load_inc_map(epoch).await?;
        if let Some(bytes) = &bytes {
            self.inc_map_bl_cache.insert(epoch, bytes.clone());
        }
        Ok(bytes)
    }

    /// Encodings of `first..=last`, incremental where available.
    pub async fn load_map_bls(&self, first: Epoch, last: Epoch) -> Result<BTreeMap<Epoch, MapEntry>> {
        ensure_core(self.owner)?;
        let mut entries = BTreeMap::new();
        for epoch in first..=last {
            let entry = match self.load_inc_map_bl(epoch).await? {
                Some(inc) => MapEntry::Incremental(inc),
                None => MapEntry::Full(self.load_map_bl(epoch).await?),
            };
            entries.insert(epoch, entry);
        }
        Ok(entries)
    }

    // ========================================================================
    // Map sharing
    // ========================================================================

    /// Build an update carrying `first..=last`, bounded by count and bytes.
    ///
    /// If `first` is below the retained floor, the floor's full map is sent
    /// first and the range resumes after it. The result may be a prefix of
    /// the requested range; at least one epoch is always included.
    pub async fn build_incremental_update(&self, first: Epoch, last: Epoch) -> Result<MapUpdate> {
        ensure_core(self.owner)?;
        let superblock = self.state.lock().superblock.clone();
        let (max_epochs, max_bytes) = {
            let config = self.config.read();
            (config.map_message_max, config.map_message_max_bytes)
        };

        let mut update = MapUpdate::new(
            self.fsid(),
            superblock.cluster_trim_lower_bound,
            superblock.newest_map,
        );
        let mut remaining = max_epochs;
        let mut first = first;

        let floor = superblock
            .cluster_trim_lower_bound
            .max(superblock.oldest_map);
        if first < floor {
            info!(first, floor, "Requested epochs were trimmed, sending the floor map in full");
            let full = self.load_map_bl(floor).await?;
            update = update.with_full(floor, full);
            remaining = remaining.saturating_sub(1);
            first = floor + 1;
        }
        if first > last || remaining == 0 {
            return Ok(update);
        }

        let span = Epoch::try_from(remaining).unwrap_or(Epoch::MAX) - 1;
        let end = last.min(first.saturating_add(span));
        let mut budget = max_bytes;
        let mut included = 0usize;
        for (epoch, entry) in self.load_map_bls(first, end).await? {
            let len = match &entry {
                MapEntry::Full(bytes) | MapEntry::Incremental(bytes) => bytes.len(),
            };
            if included > 0 && len > budget {
                debug!(epoch, len, budget, "Map update byte budget reached");
                break;
            }
            budget = budget.saturating_sub(len);
            update = match entry {
                MapEntry::Full(bytes) => update.with_full(epoch, bytes),
                MapEntry::Incremental(bytes) => update.with_incremental(epoch, bytes),
            };
            included += 1;
        }

        debug!(
            requested_first = first,
            requested_last = last,
            epochs = update.len(),
            bytes = update.encoded_len(),
            "Built incremental map update"
        );
        Ok(update)
    }

    /// Send epochs from `first` up to the current map over `conn`.
    ///
    /// Starts no further back than `map_share_max_epochs` behind the newest map.
    pub async fn send_incremental_map(&self, conn: &dyn Connection, first: Epoch) -> Result<()> {
        ensure_core(self.owner)?;
        let to = self.state.lock().osdmap.epoch();
        let share_max = self.config.read().map_share_max_epochs;
        let mut first = first;
        if to > first && to - first > share_max {
            debug!(first, to, share_max, "Capping map share range");
            first = to - share_max;
        }

        let update = self.build_incremental_update(first, to).await?;
        let msg = Message::MapUpdate(update);
        let kind = msg.kind();
        conn.send(msg).await?;
        self.metrics.peer_messages_sent.inc(kind);
        Ok(())
    }

    /// Share maps from `first` with `osd` unless it is down.
    pub async fn send_incremental_map_to_osd(&self, osd: OsdId, first: Epoch) -> Result<()> {
        ensure_core(self.owner)?;
        let osdmap = self.state.lock().osdmap.clone();
        if osdmap.is_down(osd) {
            info!(osd, "Peer is down, not sharing maps");
            self.metrics.peer_messages_skipped.inc("down");
            return Ok(());
        }
        let Some(addr) = osdmap.cluster_addr(osd) else {
            self.metrics.peer_messages_skipped.inc("no_addr");
            return Ok(());
        };
        let conn = self.messenger.connect(addr);
        self.send_incremental_map(conn.as_ref(), first).await
    }

    /// Send `msg` to `peer` unless it is down or restarted after `from_epoch`.
    pub async fn send_to_osd(&self, peer: OsdId, msg: Message, from_epoch: Epoch) -> Result<()> {
        ensure_core(self.owner)?;
        let osdmap = self.state.lock().osdmap.clone();
        if osdmap.is_down(peer) {
            info!(peer, kind = msg.kind(), "Peer is down, skipping send");
            self.metrics.peer_messages_skipped.inc("down");
            return Ok(());
        }
        if osdmap.up_from(peer) > from_epoch {
            info!(
                peer,
                from_epoch,
                up_from = osdmap.up_from(peer),
                kind = msg.kind(),
                "Peer restarted since the message was built, skipping send"
            );
            self.metrics.peer_messages_skipped.inc("restarted");
            return Ok(());
        }
        let Some(addr) = osdmap.cluster_addr(peer) else {
            self.metrics.peer_messages_skipped.inc("no_addr");
            return Ok(());
        };

        let kind = msg.kind();
        self.messenger.connect(addr).send(msg).await?;
        self.metrics.peer_messages_sent.inc(kind);
        Ok(())
    }

    /// Send a batch of per-peer messages built at `from_epoch`.
    pub async fn send_messages(
        &self,
        messages: BTreeMap<OsdId, Vec<Message>>,
        from_epoch: Epoch,
    ) -> Result<()> {
        ensure_core(self.owner)?;
        for (peer, msgs) in messages {
            for msg in msgs {
                self.send_to_osd(peer, msg, from_epoch).await?;
            }
        }
        Ok(())
    }

    /// Ask the monitor for maps starting at `epoch`.
    pub async fn osdmap_subscribe(&self, epoch: Epoch, force: bool) -> Result<()> {
        ensure_core(self.owner)?;
        if self
            .monc
            .sub_want_increment("osdmap", epoch, SubscribeMode::OneTime)
            || force
        {
            debug!(epoch, force, "Renewing osdmap subscription");
            self.monc.renew_subs().await?;
        }
        Ok(())
    }

    // ========================================================================
    // pg_temp
    // ========================================================================

    pub fn queue_want_pg_temp(&self, pgid: PgId, acting: Vec<OsdId>, forced: bool) -> Result<()> {
        ensure_core(self.owner)?;
        self.state.lock().pg_temp.queue_want(pgid, acting, forced);
        Ok(())
    }

    pub fn remove_want_pg_temp(&self, pgid: &PgId) -> Result<()> {
        ensure_core(self.owner)?;
        self.state.lock().pg_temp.remove_want(pgid);
        Ok(())
    }

    /// Move in-flight pg_temp requests back to wanted, e.g. after a
    /// monitor reconnect.
    pub fn requeue_pg_temp(&self) -> Result<()> {
        ensure_core(self.owner)?;
        self.state.lock().pg_temp.requeue();
        Ok(())
    }

    /// Flush wanted pg_temp entries in at most two messages, unforced and forced.
    pub async fn send_pg_temp(&self) -> Result<()> {
        ensure_core(self.owner)?;
        let (batch, epoch) = {
            let mut state = self.state.lock();
            (state.pg_temp.take_wanted(), state.osdmap.epoch())
        };
        if batch.is_empty() {
            return Ok(());
        }

        for (forced, pg_temp) in [(false, batch.unforced), (true, batch.forced)] {
            if pg_temp.is_empty() {
                continue;
            }
            debug!(epoch, forced, pgs = pg_temp.len(), "Sending pg_temp");
            self.monc
                .send_message(Message::PgTemp(PgTempRequest {
                    epoch,
                    forced,
                    pg_temp,
                }))
                .await?;
            self.metrics.pg_temp_sent.inc();
        }
        Ok(())
    }

    pub fn pg_temp_wanted(&self) -> Result<BTreeMap<PgId, PgTempEntry>> {
        ensure_core(self.owner)?;
        Ok(self.state.lock().pg_temp.wanted().clone())
    }

    pub fn pg_temp_pending(&self) -> Result<BTreeMap<PgId, PgTempEntry>> {
        ensure_core(self.owner)?;
        Ok(self.state.lock().pg_temp.pending().clone())
    }

    // ========================================================================
    // pg_created
    // ========================================================================

    /// Tell the monitor that `pgid` now exists and remember it for resends.
    pub async fn send_pg_created(&self, pgid: PgId) -> Result<()> {
        ensure_core(self.owner)?;
        self.state.lock().pg_created.insert(pgid);
        debug!(pgid = %pgid, "Sending pg_created");
        self.monc.send_message(Message::PgCreated { pgid }).await
    }

    /// Resend every remembered creation acknowledgement.
    pub async fn resend_pg_created(&self) -> Result<()> {
        ensure_core(self.owner)?;
        let pgids: Vec<PgId> = self.state.lock().pg_created.iter().copied().collect();
        for pgid in pgids {
            self.monc.send_message(Message::PgCreated { pgid }).await?;
        }
        Ok(())
    }

    /// Forget acknowledgements whose pool is gone or no longer creating.
    pub fn prune_pg_created(&self) -> Result<()> {
        ensure_core(self.owner)?;
        let mut state = self.state.lock();
        let osdmap = state.osdmap.clone();
        state.pg_created.retain(|pgid| {
            let keep = osdmap
                .pool(pgid.pool)
                .map(|pool| pool.has_flag(FLAG_CREATING))
                .unwrap_or(false);
            if !keep {
                debug!(pgid = %pgid, "Pruning pg_created");
            }
            keep
        });
        Ok(())
    }

    pub fn pg_created(&self) -> Result<BTreeSet<PgId>> {
        ensure_core(self.owner)?;
        Ok(self.state.lock().pg_created.clone())
    }

    // ========================================================================
    // Liveness
    // ========================================================================

    /// Ask the monitor to raise our up_thru to `want`.
    ///
    /// Returns whether a claim was sent. A claim is never sent for an epoch
    /// at or below one already wanted, or already acknowledged in the map.
    pub async fn send_alive(&self, want: Epoch) -> Result<bool> {
        ensure_core(self.owner)?;
        let msg = {
            let mut state = self.state.lock();
            if want <= state.up_thru_wanted {
                debug!(want, wanted = state.up_thru_wanted, "Alive already wanted");
                return Ok(false);
            }
            state.up_thru_wanted = want;

            if !state.osdmap.exists(self.whoami) {
                warn!(osd = self.whoami, "We are not in the map, not sending alive");
                return Ok(false);
            }
            let up_thru = state.osdmap.up_thru(self.whoami);
            if up_thru >= want {
                debug!(want, up_thru, "up_thru already acknowledged");
                return Ok(false);
            }
            Message::Alive {
                epoch: state.osdmap.epoch(),
                want,
            }
        };

        self.monc.send_message(msg).await?;
        self.metrics.alive_sent.inc();
        Ok(true)
    }

    // ========================================================================
    // Configuration and accessors
    // ========================================================================

    /// Apply changed tracked keys to the reservation ledgers.
    pub fn handle_conf_change(&self, config: &OsdConfig, changed: &HashSet<String>) -> Result<()> {
        ensure_core(self.owner)?;
        self.reservers.handle_conf_change(config, changed);
        *self.config.write() = config.clone();
        info!(changed = ?changed, "Applied config change");
        Ok(())
    }

    pub fn reservers(&self) -> Result<&Reservers> {
        ensure_core(self.owner)?;
        Ok(&self.reservers)
    }

    /// The newest committed map.
    pub fn osdmap(&self) -> Result<Arc<ClusterMap>> {
        ensure_core(self.owner)?;
        Ok(self.state.lock().osdmap.clone())
    }

    pub fn superblock(&self) -> Result<Superblock> {
        ensure_core(self.owner)?;
        Ok(self.state.lock().superblock.clone())
    }

    /// Smallest epoch still held in memory, by the cache or anyone else.
    pub fn cached_lower_bound(&self) -> Result<Option<Epoch>> {
        ensure_core(self.owner)?;
        Ok(self.maps.cached_lower_bound())
    }

    /// Final info of a deleted pool.
    pub async fn final_pool_info(&self, pool: PoolId) -> Result<Option<FinalPoolInfo>> {
        ensure_core(self.owner)?;
        self.meta.load_final_pool_info(pool).await
    }
}

impl std::fmt::Debug for ClusterMapAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ClusterMapAuthority")
            .field("owner", &self.owner)
            .field("whoami", &self.whoami)
            .field("epoch", &state.osdmap.epoch())
            .field("oldest_map", &state.superblock.oldest_map)
            .field("newest_map", &state.superblock.newest_map)
            .field("cached", &self.maps.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osdmap::PoolInfo;
    use crate::shard::run_on;
    use crate::error::StorageError;
    use crate::storage::{CollectionId, MemStore, ObjectKey};
    use crate::testing::{
        init_tracing, osd_addr, MapHistory, RecordingConnection, RecordingMessenger,
        RecordingMonClient,
    };

    struct Fixture {
        authority: ClusterMapAuthority,
        store: Arc<MemStore>,
        monc: Arc<RecordingMonClient>,
        messenger: Arc<RecordingMessenger>,
        history: MapHistory,
    }

    fn fixture(config: OsdConfig) -> Fixture {
        init_tracing();
        let history = MapHistory::with_cluster(Uuid::new_v4(), 3, 3, 8).unwrap();
        let store = Arc::new(MemStore::new());
        let monc = Arc::new(RecordingMonClient::new(history.fsid()));
        let messenger = Arc::new(RecordingMessenger::new());
        let authority = ClusterMapAuthority::new(
            config,
            store.clone(),
            messenger.clone(),
            monc.clone(),
            Arc::new(OsdMetrics::new()),
        );
        Fixture {
            authority,
            store,
            monc,
            messenger,
            history,
        }
    }

    #[tokio::test]
    async fn test_apply_full_then_incremental() {
        let mut fx = fixture(OsdConfig::new(0));
        fx.history.advance(4, 1).unwrap();

        run_on(0, async {
            let update = fx.history.mixed_update(1, 5).unwrap();
            let outcome = fx.authority.apply_incoming_maps(&update).await.unwrap();
            assert_eq!(outcome, MapUpdateOutcome::Applied { first: 1, last: 5 });

            let superblock = fx.authority.superblock().unwrap();
            assert_eq!(superblock.newest_map, 5);
            assert_eq!(fx.authority.osdmap().unwrap().epoch(), 5);

            for epoch in 1..=5 {
                let cached = fx.authority.get_local_map(epoch).await.unwrap();
                let stored = osdmap::decode_full(&fx.authority.meta.load_map(epoch).await.unwrap())
                    .unwrap();
                assert_eq!(*cached, stored);
                assert_eq!(&stored, fx.history.map(epoch).unwrap());
            }
        })
        .await;
    }

    #[tokio::test]
    async fn test_incremental_derives_from_stored_predecessor() {
        let mut fx = fixture(OsdConfig::new(0));
        fx.history.advance(2, 2).unwrap();

        run_on(0, async {
            let first = fx.history.full_update(1, 1).unwrap();
            fx.authority.apply_incoming_maps(&first).await.unwrap();

            let rest = fx.history.incremental_update(2, 3).unwrap();
            let outcome = fx.authority.apply_incoming_maps(&rest).await.unwrap();
            assert_eq!(outcome.applied_through(), Some(3));
            assert_eq!(fx.authority.osdmap().unwrap().up_thru(2), 3);
            assert!(fx.authority.load_inc_map_bl(3).await.unwrap().is_some());
        })
        .await;
    }

    #[tokio::test]
    async fn test_missing_encoding_aborts_batch() {
        let mut fx = fixture(OsdConfig::new(0));
        fx.history.advance(2, 0).unwrap();

        run_on(0, async {
            let mut update = fx.history.mixed_update(1, 3).unwrap();
            update.incremental_maps.remove(&2);
            let commits = fx.store.commit_count();

            let err = fx.authority.apply_incoming_maps(&update).await.unwrap_err();
            assert!(matches!(
                err,
                Error::ProtocolViolation {
                    epoch: 2,
                    first: 1,
                    last: 3
                }
            ));
            assert_eq!(fx.store.commit_count(), commits);
            assert!(fx.authority.superblock().unwrap().is_empty());
            assert!(fx.authority.cached_lower_bound().unwrap().is_none());
            assert!(fx.authority.load_map_bl(1).await.is_err());
        })
        .await;
    }

    #[tokio::test]
    async fn test_stale_and_gap_batches() {
        let mut fx = fixture(OsdConfig::new(0));
        fx.history.advance(5, 0).unwrap();

        run_on(0, async {
            let update = fx.history.full_update(1, 2).unwrap();
            fx.authority.apply_incoming_maps(&update).await.unwrap();

            let stale = fx.history.full_update(1, 2).unwrap();
            assert_eq!(
                fx.authority.apply_incoming_maps(&stale).await.unwrap(),
                MapUpdateOutcome::Stale
            );

            let gap = fx.history.incremental_update(5, 6).unwrap();
            assert_eq!(
                fx.authority.apply_incoming_maps(&gap).await.unwrap(),
                MapUpdateOutcome::Gap { newest: 2, first: 5 }
            );
            assert_eq!(fx.monc.subscription("osdmap"), Some(3));
            assert_eq!(fx.monc.renewals(), 1);
            assert_eq!(fx.authority.superblock().unwrap().newest_map, 2);
        })
        .await;
    }

    #[tokio::test]
    async fn test_gap_needs_cluster_trim_past_first() {
        let mut fx = fixture(OsdConfig::new(0));
        fx.history.advance(5, 0).unwrap();

        run_on(0, async {
            let update = fx.history.full_update(1, 2).unwrap();
            fx.authority.apply_incoming_maps(&update).await.unwrap();

            // Epochs 3 and 4 still exist in the cluster.
            let update = MapUpdate {
                cluster_trim_lower_bound: 3,
                ..fx.history.full_update(5, 6).unwrap()
            };
            assert_eq!(
                fx.authority.apply_incoming_maps(&update).await.unwrap(),
                MapUpdateOutcome::Gap { newest: 2, first: 5 }
            );
            assert_eq!(fx.monc.subscription("osdmap"), Some(3));
            assert_eq!(fx.authority.superblock().unwrap().newest_map, 2);
        })
        .await;
    }

    #[tokio::test]
    async fn test_skipped_epochs_restart_retained_range() {
        let mut fx = fixture(OsdConfig::new(0));
        fx.history.advance(6, 0).unwrap();

        run_on(0, async {
            let update = fx.history.full_update(1, 2).unwrap();
            fx.authority.apply_incoming_maps(&update).await.unwrap();

            // The cluster trimmed everything below 5.
            let update = fx.history.full_update(5, 6).unwrap();
            assert_eq!(update.cluster_trim_lower_bound, 5);
            assert_eq!(
                fx.authority.apply_incoming_maps(&update).await.unwrap(),
                MapUpdateOutcome::Applied { first: 5, last: 6 }
            );

            let superblock = fx.authority.superblock().unwrap();
            assert_eq!((superblock.oldest_map, superblock.newest_map), (5, 6));
            assert!(!fx.store.contains(&CollectionId::Meta, &ObjectKey::FullMap(1)));
            assert!(!fx.store.contains(&CollectionId::Meta, &ObjectKey::FullMap(2)));
            assert!(fx.authority.load_map_bl(2).await.is_err());
            assert_eq!(fx.authority.get_local_map(5).await.unwrap().epoch(), 5);

            // Later batches apply on top of the new range.
            let next = fx.history.incremental_update(7, 7).unwrap();
            assert_eq!(
                fx.authority.apply_incoming_maps(&next).await.unwrap(),
                MapUpdateOutcome::Applied { first: 7, last: 7 }
            );
        })
        .await;
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_no_trace() {
        let mut fx = fixture(OsdConfig::new(0));
        fx.history.advance(2, 0).unwrap();

        run_on(0, async {
            let update = fx.history.mixed_update(1, 3).unwrap();
            fx.store.fail_next_commit();
            assert!(matches!(
                fx.authority.apply_incoming_maps(&update).await,
                Err(Error::Storage(StorageError::Io(_)))
            ));
            assert!(fx.authority.superblock().unwrap().is_empty());
            assert_eq!(fx.authority.osdmap().unwrap().epoch(), 0);
            assert!(fx.authority.cached_lower_bound().unwrap().is_none());
            assert!(fx.authority.load_map_bl(1).await.is_err());
            assert!(fx.authority.load_inc_map_bl(2).await.unwrap().is_none());

            let outcome = fx.authority.apply_incoming_maps(&update).await.unwrap();
            assert_eq!(outcome, MapUpdateOutcome::Applied { first: 1, last: 3 });
            assert_eq!(fx.authority.osdmap().unwrap().epoch(), 3);
        })
        .await;
    }

    #[tokio::test]
    async fn test_load_map_bls_prefers_incremental() {
        let mut fx = fixture(OsdConfig::new(0));
        fx.history.advance(3, 0).unwrap();

        run_on(0, async {
            // Epoch 1 only ever had a full encoding.
            let update = fx.history.mixed_update(1, 4).unwrap();
            fx.authority.apply_incoming_maps(&update).await.unwrap();

            let entries = fx.authority.load_map_bls(1, 3).await.unwrap();
            assert_eq!(entries.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
            assert_eq!(
                entries[&1],
                MapEntry::Full(fx.history.full_bytes(1).unwrap())
            );
            assert_eq!(
                entries[&2],
                MapEntry::Incremental(fx.history.inc_bytes(2).unwrap())
            );
            assert!(matches!(entries[&3], MapEntry::Incremental(_)));
        })
        .await;
    }

    #[tokio::test]
    async fn test_map_share_skips_down_and_unknown_peers() {
        let mut fx = fixture(OsdConfig::new(0));
        fx.history
            .push(fx.history.next_incremental().with_new_down(1))
            .unwrap();

        run_on(0, async {
            let update = fx.history.mixed_update(1, 2).unwrap();
            fx.authority.apply_incoming_maps(&update).await.unwrap();

            fx.authority.send_incremental_map_to_osd(1, 1).await.unwrap();
            fx.authority.send_incremental_map_to_osd(9, 1).await.unwrap();
            assert!(fx.messenger.sent().is_empty());
            assert_eq!(fx.messenger.connects(), 0);

            fx.authority.send_incremental_map_to_osd(2, 1).await.unwrap();
            match fx.messenger.sent_to(osd_addr(2)).as_slice() {
                [Message::MapUpdate(update)] => {
                    assert_eq!(update.epoch_range(), Some((1, 2)));
                    assert_eq!(update.newest_map, 2);
                }
                other => panic!("unexpected sends: {:?}", other),
            }
        })
        .await;
    }

    #[tokio::test]
    async fn test_foreign_fsid_rejected() {
        let fx = fixture(OsdConfig::new(0));
        let other = MapHistory::with_cluster(Uuid::new_v4(), 1, 1, 1).unwrap();

        run_on(0, async {
            let update = other.full_update(1, 1).unwrap();
            assert!(matches!(
                fx.authority.apply_incoming_maps(&update).await,
                Err(Error::FsidMismatch { .. })
            ));
        })
        .await;
    }

    #[tokio::test]
    async fn test_deleted_pool_info_is_recorded() {
        let mut fx = fixture(OsdConfig::new(0));
        fx.history.remove_pool(1).unwrap();

        run_on(0, async {
            let update = fx.history.mixed_update(1, 2).unwrap();
            fx.authority.apply_incoming_maps(&update).await.unwrap();

            let info = fx.authority.final_pool_info(1).await.unwrap().unwrap();
            assert_eq!(info.name, "rbd");
            assert_eq!(info.pool.size, 3);
        })
        .await;
    }

    #[tokio::test]
    async fn test_trim_respects_budget_and_floor() {
        let config = OsdConfig::new(0)
            .with_target_transaction_size(4)
            .with_map_cache_size(2);
        let mut fx = fixture(config);
        fx.history.advance(9, 0).unwrap();

        run_on(0, async {
            let update = fx.history.full_update(1, 10).unwrap();
            let update = MapUpdate {
                cluster_trim_lower_bound: 0,
                ..update
            };
            fx.authority.apply_incoming_maps(&update).await.unwrap();

            // Two epochs per transaction at most: each removes full and inc.
            let removed = fx.authority.trim(8).await.unwrap();
            assert_eq!(removed, vec![1, 2]);
            let removed = fx.authority.trim(8).await.unwrap();
            assert_eq!(removed, vec![3, 4]);

            let superblock = fx.authority.superblock().unwrap();
            assert_eq!(superblock.oldest_map, 5);
            assert_eq!(superblock.cluster_trim_lower_bound, 8);
            assert!(fx.authority.load_map_bl(4).await.is_err());
            assert!(fx.authority.load_map_bl(5).await.is_ok());
        })
        .await;
    }

    #[tokio::test]
    async fn test_trim_is_idempotent_and_clamped() {
        let mut fx = fixture(OsdConfig::new(0));
        fx.history.advance(3, 0).unwrap();

        run_on(0, async {
            let update = MapUpdate {
                cluster_trim_lower_bound: 0,
                ..fx.history.full_update(1, 4).unwrap()
            };
            fx.authority.apply_incoming_maps(&update).await.unwrap();

            let removed = fx.authority.trim(100).await.unwrap();
            assert_eq!(removed, vec![1, 2, 3]);
            assert_eq!(fx.authority.superblock().unwrap().oldest_map, 4);
            assert!(fx.authority.trim(100).await.unwrap().is_empty());
            assert!(fx.authority.trim(2).await.unwrap().is_empty());
            assert_eq!(fx.authority.superblock().unwrap().cluster_trim_lower_bound, 4);
        })
        .await;
    }

    #[tokio::test]
    async fn test_build_update_count_bound_and_gap_fill() {
        let config = OsdConfig::new(0).with_map_message_max(4);
        let mut fx = fixture(config);
        fx.history.advance(9, 0).unwrap();

        run_on(0, async {
            let update = MapUpdate {
                cluster_trim_lower_bound: 0,
                ..fx.history.mixed_update(1, 10).unwrap()
            };
            fx.authority.apply_incoming_maps(&update).await.unwrap();

            let msg = fx.authority.build_incremental_update(2, 10).await.unwrap();
            assert_eq!(msg.epoch_range(), Some((2, 5)));
            assert!(msg.incremental_maps.contains_key(&2));
            assert_eq!(msg.newest_map, 10);

            fx.authority.trim(6).await.unwrap();
            let msg = fx.authority.build_incremental_update(2, 10).await.unwrap();
            assert_eq!(msg.len(), 4);
            assert!(msg.maps.contains_key(&6));
            assert_eq!(msg.epoch_range(), Some((6, 9)));
        })
        .await;
    }

    #[tokio::test]
    async fn test_build_update_byte_budget_keeps_one_epoch() {
        let config = OsdConfig::new(0).with_map_message_max_bytes(1);
        let mut fx = fixture(config);
        fx.history.advance(3, 0).unwrap();

        run_on(0, async {
            let update = fx.history.mixed_update(1, 4).unwrap();
            fx.authority.apply_incoming_maps(&update).await.unwrap();

            let msg = fx.authority.build_incremental_update(2, 4).await.unwrap();
            assert_eq!(msg.len(), 1);
            assert_eq!(msg.first(), Some(2));
        })
        .await;
    }

    #[tokio::test]
    async fn test_send_incremental_map_caps_share_range() {
        let config = OsdConfig::new(0).with_map_share_max_epochs(2);
        let mut fx = fixture(config);
        fx.history.advance(5, 0).unwrap();

        run_on(0, async {
            let update = MapUpdate {
                cluster_trim_lower_bound: 0,
                ..fx.history.mixed_update(1, 6).unwrap()
            };
            fx.authority.apply_incoming_maps(&update).await.unwrap();

            let conn = RecordingConnection::detached(osd_addr(1));
            fx.authority.send_incremental_map(&conn, 1).await.unwrap();
            match conn.sent().as_slice() {
                [Message::MapUpdate(update)] => assert_eq!(update.epoch_range(), Some((4, 6))),
                other => panic!("unexpected sends: {:?}", other),
            }
        })
        .await;
    }

    #[tokio::test]
    async fn test_send_to_osd_skips_down_and_restarted_peers() {
        let mut fx = fixture(OsdConfig::new(0));
        fx.history
            .push(fx.history.next_incremental().with_new_down(1))
            .unwrap();
        fx.history
            .push(fx.history.next_incremental().with_new_up(2, osd_addr(2)))
            .unwrap();

        run_on(0, async {
            let update = fx.history.mixed_update(1, 3).unwrap();
            fx.authority.apply_incoming_maps(&update).await.unwrap();

            let msg = Message::Alive { epoch: 1, want: 1 };
            fx.authority.send_to_osd(1, msg.clone(), 3).await.unwrap();
            fx.authority.send_to_osd(2, msg.clone(), 2).await.unwrap();
            assert!(fx.messenger.sent().is_empty());

            fx.authority.send_to_osd(2, msg.clone(), 3).await.unwrap();
            assert_eq!(fx.messenger.sent_to(osd_addr(2)), vec![msg.clone()]);

            fx.messenger.disconnect(osd_addr(0));
            assert!(fx.authority.send_to_osd(0, msg, 3).await.is_err());
        })
        .await;
    }

    #[tokio::test]
    async fn test_pg_temp_flush_partitions_by_forced() {
        let fx = fixture(OsdConfig::new(0));

        run_on(0, async {
            let update = fx.history.full_update(1, 1).unwrap();
            fx.authority.apply_incoming_maps(&update).await.unwrap();

            fx.authority
                .queue_want_pg_temp(PgId::new(1, 0), vec![1, 2], false)
                .unwrap();
            fx.authority
                .queue_want_pg_temp(PgId::new(1, 0), vec![1, 2], false)
                .unwrap();
            fx.authority
                .queue_want_pg_temp(PgId::new(1, 1), vec![2, 0], true)
                .unwrap();
            assert_eq!(fx.authority.pg_temp_wanted().unwrap().len(), 2);

            fx.authority.send_pg_temp().await.unwrap();
            let sent = fx.monc.take_sent();
            assert_eq!(sent.len(), 2);
            assert!(sent.iter().all(|msg| matches!(
                msg,
                Message::PgTemp(PgTempRequest { epoch: 1, pg_temp, .. }) if pg_temp.len() == 1
            )));
            assert!(fx.authority.pg_temp_wanted().unwrap().is_empty());
            assert_eq!(fx.authority.pg_temp_pending().unwrap().len(), 2);

            fx.authority.send_pg_temp().await.unwrap();
            assert!(fx.monc.sent().is_empty());

            fx.authority.requeue_pg_temp().unwrap();
            assert_eq!(fx.authority.pg_temp_wanted().unwrap().len(), 2);
        })
        .await;
    }

    #[tokio::test]
    async fn test_send_alive_is_monotonic() {
        let mut fx = fixture(OsdConfig::new(0));
        fx.history.advance(1, 0).unwrap();

        run_on(0, async {
            let update = fx.history.mixed_update(1, 2).unwrap();
            fx.authority.apply_incoming_maps(&update).await.unwrap();

            // up_thru of osd.0 is 2 in epoch 2.
            assert!(!fx.authority.send_alive(2).await.unwrap());
            assert!(fx.authority.send_alive(5).await.unwrap());
            assert!(!fx.authority.send_alive(5).await.unwrap());
            assert!(!fx.authority.send_alive(4).await.unwrap());
            assert_eq!(fx.monc.sent(), vec![Message::Alive { epoch: 2, want: 5 }]);
        })
        .await;
    }

    #[tokio::test]
    async fn test_send_alive_when_absent_from_map() {
        let fx = fixture(OsdConfig::new(7));

        run_on(0, async {
            let update = fx.history.full_update(1, 1).unwrap();
            fx.authority.apply_incoming_maps(&update).await.unwrap();
            assert!(!fx.authority.send_alive(3).await.unwrap());
            assert!(fx.monc.sent().is_empty());
        })
        .await;
    }

    #[tokio::test]
    async fn test_pg_created_pruned_with_pool() {
        let mut fx = fixture(OsdConfig::new(0));
        fx.history
            .push(
                fx.history
                    .next_incremental()
                    .with_new_pool(2, PoolInfo::replicated("cold", 2, 4).with_flags(0)),
            )
            .unwrap();

        run_on(0, async {
            fx.authority
                .apply_incoming_maps(&fx.history.full_update(1, 1).unwrap())
                .await
                .unwrap();
            fx.authority.send_pg_created(PgId::new(1, 3)).await.unwrap();
            fx.authority.send_pg_created(PgId::new(2, 0)).await.unwrap();

            fx.authority
                .apply_incoming_maps(&fx.history.incremental_update(2, 2).unwrap())
                .await
                .unwrap();
            let remaining = fx.authority.pg_created().unwrap();
            assert_eq!(remaining.into_iter().collect::<Vec<_>>(), vec![PgId::new(1, 3)]);

            fx.monc.take_sent();
            fx.authority.resend_pg_created().await.unwrap();
            assert_eq!(fx.monc.sent(), vec![Message::PgCreated { pgid: PgId::new(1, 3) }]);
        })
        .await;
    }

    #[tokio::test]
    async fn test_init_restores_from_disk() {
        let mut fx = fixture(OsdConfig::new(0));
        fx.history.advance(2, 0).unwrap();

        run_on(0, async {
            fx.authority
                .apply_incoming_maps(&fx.history.mixed_update(1, 3).unwrap())
                .await
                .unwrap();

            let restarted = ClusterMapAuthority::new(
                OsdConfig::new(0),
                fx.store.clone(),
                fx.messenger.clone(),
                fx.monc.clone(),
                Arc::new(OsdMetrics::new()),
            );
            restarted.init().await.unwrap();
            assert_eq!(restarted.osdmap().unwrap().epoch(), 3);
            assert_eq!(restarted.superblock().unwrap().oldest_map, 1);
        })
        .await;
    }

    #[tokio::test]
    async fn test_operations_check_owner_core() {
        let fx = fixture(OsdConfig::new(0).with_num_cores(2).with_authority_core(1));
        assert!(matches!(
            fx.authority.osdmap(),
            Err(Error::WrongCore {
                expected: 1,
                actual: None
            })
        ));
        let on_wrong_core = run_on(0, fx.authority.trim(3)).await;
        assert!(matches!(
            on_wrong_core,
            Err(Error::WrongCore {
                expected: 1,
                actual: Some(0)
            })
        ));
        assert!(run_on(1, async { fx.authority.osdmap() }).await.is_ok());
    }
}
