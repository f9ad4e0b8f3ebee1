//! Decoded cluster map epoch and placement queries.

use super::incremental::Incremental;
use crate::error::MapError;
use crate::types::{Epoch, OsdId, PgId, PgShard, PoolId, SpgId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use twox_hash::XxHash64;
use uuid::Uuid;

/// Pool flag: the pool's initial PGs are still being created.
pub const FLAG_CREATING: u64 = 1 << 0;

/// Pool flag: the pool is served by the sharded backend.
pub const FLAG_SHARDED_BACKEND: u64 = 1 << 1;

/// State of a single daemon as recorded in a map epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsdInfo {
    /// Whether the daemon is currently up.
    pub up: bool,
    /// Epoch at which the daemon last came up.
    pub up_from: Epoch,
    /// Latest epoch the monitor acknowledged this daemon alive through.
    pub up_thru: Epoch,
    /// Epoch at which the daemon last went down.
    pub down_at: Epoch,
    /// Address used for daemon-to-daemon traffic.
    pub cluster_addr: SocketAddr,
}

/// Redundancy scheme of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolKind {
    Replicated,
    Erasure,
}

/// Pool metadata as recorded in a map epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolInfo {
    /// Human-readable pool name.
    pub name: String,
    /// Replicated or erasure coded.
    pub kind: PoolKind,
    /// Number of replicas (or k+m shards).
    pub size: u32,
    /// Number of placement groups.
    pub pg_num: u32,
    /// Flag bits (`FLAG_*`).
    pub flags: u64,
    /// Erasure code profile name, for erasure pools.
    pub ec_profile: Option<String>,
}

impl PoolInfo {
    /// A replicated pool with the given size and PG count.
    pub fn replicated(name: impl Into<String>, size: u32, pg_num: u32) -> Self {
        Self {
            name: name.into(),
            kind: PoolKind::Replicated,
            size,
            pg_num,
            flags: FLAG_CREATING | FLAG_SHARDED_BACKEND,
            ec_profile: None,
        }
    }

    /// An erasure-coded pool using the named profile.
    pub fn erasure(
        name: impl Into<String>,
        size: u32,
        pg_num: u32,
        profile: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: PoolKind::Erasure,
            size,
            pg_num,
            flags: FLAG_CREATING | FLAG_SHARDED_BACKEND,
            ec_profile: Some(profile.into()),
        }
    }

    /// Replace the flag bits.
    pub fn with_flags(mut self, flags: u64) -> Self {
        self.flags = flags;
        self
    }

    /// Check a flag bit.
    pub fn has_flag(&self, flag: u64) -> bool {
        self.flags & flag != 0
    }

    /// Whether the pool is erasure coded.
    pub fn is_erasure(&self) -> bool {
        self.kind == PoolKind::Erasure
    }

    /// Whether this daemon flavour may host the pool's PGs.
    pub fn is_sharded_backend(&self) -> bool {
        self.has_flag(FLAG_SHARDED_BACKEND)
    }
}

/// Up and acting sets of a placement group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpActing {
    pub up: Vec<OsdId>,
    pub up_primary: Option<OsdId>,
    pub acting: Vec<OsdId>,
    pub acting_primary: Option<OsdId>,
}

/// An immutable, decoded snapshot of cluster topology at one epoch.
///
/// Instances are shared read-only between cores behind `Arc`; a new epoch
/// is produced by cloning and applying an [`Incremental`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterMap {
    fsid: Uuid,
    epoch: Epoch,
    osds: BTreeMap<OsdId, OsdInfo>,
    pools: BTreeMap<PoolId, PoolInfo>,
    pg_temp: BTreeMap<PgId, Vec<OsdId>>,
    ec_profiles: BTreeMap<String, BTreeMap<String, String>>,
}

impl ClusterMap {
    /// The empty epoch-0 map of a cluster.
    pub fn new(fsid: Uuid) -> Self {
        Self {
            fsid,
            ..Default::default()
        }
    }

    pub fn fsid(&self) -> Uuid {
        self.fsid
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Whether the daemon appears in this epoch at all.
    pub fn exists(&self, osd: OsdId) -> bool {
        self.osds.contains_key(&osd)
    }

    pub fn is_up(&self, osd: OsdId) -> bool {
        self.osds.get(&osd).map(|info| info.up).unwrap_or(false)
    }

    /// Unknown daemons count as down.
    pub fn is_down(&self, osd: OsdId) -> bool {
        !self.is_up(osd)
    }

    pub fn osd_info(&self, osd: OsdId) -> Option<&OsdInfo> {
        self.osds.get(&osd)
    }

    pub fn up_from(&self, osd: OsdId) -> Epoch {
        self.osds.get(&osd).map(|info| info.up_from).unwrap_or(0)
    }

    pub fn up_thru(&self, osd: OsdId) -> Epoch {
        self.osds.get(&osd).map(|info| info.up_thru).unwrap_or(0)
    }

    pub fn cluster_addr(&self, osd: OsdId) -> Option<SocketAddr> {
        self.osds.get(&osd).map(|info| info.cluster_addr)
    }

    pub fn pool(&self, pool: PoolId) -> Option<&PoolInfo> {
        self.pools.get(&pool)
    }

    pub fn has_pool(&self, pool: PoolId) -> bool {
        self.pools.contains_key(&pool)
    }

    pub fn pools(&self) -> impl Iterator<Item = (&PoolId, &PoolInfo)> {
        self.pools.iter()
    }

    pub fn osds(&self) -> impl Iterator<Item = (&OsdId, &OsdInfo)> {
        self.osds.iter()
    }

    /// Key/value pairs of a named erasure code profile.
    pub fn erasure_code_profile(&self, name: &str) -> BTreeMap<String, String> {
        self.ec_profiles.get(name).cloned().unwrap_or_default()
    }

    pub fn pg_temp(&self, pgid: &PgId) -> Option<&[OsdId]> {
        self.pg_temp.get(pgid).map(Vec::as_slice)
    }

    /// Compute up and acting sets for a PG.
    ///
    /// `up` is chosen by highest-random-weight hashing over the up daemons;
    /// `acting` follows a pg_temp override when one is present.
    pub fn pg_to_up_acting(&self, pgid: &PgId) -> UpActing {
        let Some(pool) = self.pools.get(&pgid.pool) else {
            return UpActing::default();
        };

        let mut candidates: Vec<(u64, OsdId)> = self
            .osds
            .iter()
            .filter(|(_, info)| info.up)
            .map(|(osd, _)| (placement_score(pgid, *osd), *osd))
            .collect();
        candidates.sort_by(|a, b| b.cmp(a));

        let up: Vec<OsdId> = candidates
            .into_iter()
            .take(pool.size as usize)
            .map(|(_, osd)| osd)
            .collect();

        let acting = match self.pg_temp.get(pgid) {
            Some(temp) if !temp.is_empty() => temp.clone(),
            _ => up.clone(),
        };

        UpActing {
            up_primary: up.first().copied(),
            acting_primary: acting.first().copied(),
            up,
            acting,
        }
    }

    /// Whether `osd` serves `pgid` (and, for erasure pools, its shard).
    pub fn is_up_acting_osd_shard(&self, pgid: &SpgId, osd: OsdId) -> bool {
        let Some(pool) = self.pools.get(&pgid.pool()) else {
            return false;
        };
        let ua = self.pg_to_up_acting(&pgid.pgid);
        match pgid.shard {
            Some(shard) if pool.is_erasure() => {
                let shard = shard as usize;
                ua.up.get(shard) == Some(&osd) || ua.acting.get(shard) == Some(&osd)
            }
            _ => ua.up.contains(&osd) || ua.acting.contains(&osd),
        }
    }

    /// Role of a daemon within an acting set: 0 is primary, -1 is stray.
    pub fn calc_pg_role(&self, who: PgShard, acting: &[OsdId]) -> i32 {
        match who.shard {
            Some(shard) => {
                if acting.get(shard as usize) == Some(&who.osd) {
                    shard as i32
                } else {
                    -1
                }
            }
            None => acting
                .iter()
                .position(|osd| *osd == who.osd)
                .map(|pos| pos as i32)
                .unwrap_or(-1),
        }
    }

    /// Apply the delta producing the next epoch.
    pub fn apply_incremental(&mut self, inc: &Incremental) -> Result<(), MapError> {
        if inc.epoch != self.epoch + 1 {
            return Err(MapError::EpochMismatch {
                current: self.epoch,
                got: inc.epoch,
            });
        }
        if !self.fsid.is_nil() && inc.fsid != self.fsid {
            return Err(MapError::FsidMismatch);
        }

        self.fsid = inc.fsid;
        self.epoch = inc.epoch;

        for (osd, addr) in &inc.new_up {
            let info = self.osds.entry(*osd).or_insert(OsdInfo {
                up: false,
                up_from: 0,
                up_thru: 0,
                down_at: 0,
                cluster_addr: *addr,
            });
            info.up = true;
            info.up_from = inc.epoch;
            info.cluster_addr = *addr;
        }
        for osd in &inc.new_down {
            if let Some(info) = self.osds.get_mut(osd) {
                info.up = false;
                info.down_at = inc.epoch;
            }
        }
        for osd in &inc.removed_osds {
            self.osds.remove(osd);
        }
        for (osd, up_thru) in &inc.new_up_thru {
            if let Some(info) = self.osds.get_mut(osd) {
                info.up_thru = *up_thru;
            }
        }
        for (name, profile) in &inc.new_ec_profiles {
            self.ec_profiles.insert(name.clone(), profile.clone());
        }
        for (pool, info) in &inc.new_pools {
            self.pools.insert(*pool, info.clone());
        }
        for pool in &inc.removed_pools {
            self.pools.remove(pool);
            self.pg_temp.retain(|pgid, _| pgid.pool != *pool);
        }
        for (pgid, acting) in &inc.new_pg_temp {
            if acting.is_empty() {
                self.pg_temp.remove(pgid);
            } else {
                self.pg_temp.insert(*pgid, acting.clone());
            }
        }

        Ok(())
    }
}

fn placement_score(pgid: &PgId, osd: OsdId) -> u64 {
    let mut hasher = XxHash64::with_seed(pgid.pool);
    pgid.seed.hash(&mut hasher);
    osd.hash(&mut hasher);
    hasher.finish()
}
