//! Incremental map deltas.

use super::map::PoolInfo;
use crate::types::{Epoch, OsdId, PgId, PoolId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use uuid::Uuid;

/// Delta that turns epoch `epoch - 1` into `epoch`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incremental {
    /// Cluster this delta belongs to.
    pub fsid: Uuid,
    /// Epoch produced by applying this delta.
    pub epoch: Epoch,
    /// Daemons that come up (or appear) at this epoch.
    pub new_up: BTreeMap<OsdId, SocketAddr>,
    /// Daemons marked down at this epoch.
    pub new_down: BTreeSet<OsdId>,
    /// Daemons removed from the map.
    pub removed_osds: BTreeSet<OsdId>,
    /// Acknowledged up_thru updates.
    pub new_up_thru: BTreeMap<OsdId, Epoch>,
    /// Created or modified pools.
    pub new_pools: BTreeMap<PoolId, PoolInfo>,
    /// Deleted pools.
    pub removed_pools: BTreeSet<PoolId>,
    /// pg_temp changes; an empty acting set clears the override.
    pub new_pg_temp: BTreeMap<PgId, Vec<OsdId>>,
    /// Added erasure code profiles.
    pub new_ec_profiles: BTreeMap<String, BTreeMap<String, String>>,
}

impl Incremental {
    /// An empty delta producing `epoch`.
    pub fn new(fsid: Uuid, epoch: Epoch) -> Self {
        Self {
            fsid,
            epoch,
            new_up: BTreeMap::new(),
            new_down: BTreeSet::new(),
            removed_osds: BTreeSet::new(),
            new_up_thru: BTreeMap::new(),
            new_pools: BTreeMap::new(),
            removed_pools: BTreeSet::new(),
            new_pg_temp: BTreeMap::new(),
            new_ec_profiles: BTreeMap::new(),
        }
    }

    pub fn with_new_up(mut self, osd: OsdId, addr: SocketAddr) -> Self {
        self.new_up.insert(osd, addr);
        self
    }

    pub fn with_new_down(mut self, osd: OsdId) -> Self {
        self.new_down.insert(osd);
        self
    }

    pub fn with_removed_osd(mut self, osd: OsdId) -> Self {
        self.removed_osds.insert(osd);
        self
    }

    pub fn with_up_thru(mut self, osd: OsdId, up_thru: Epoch) -> Self {
        self.new_up_thru.insert(osd, up_thru);
        self
    }

    pub fn with_new_pool(mut self, pool: PoolId, info: PoolInfo) -> Self {
        self.new_pools.insert(pool, info);
        self
    }

    pub fn with_removed_pool(mut self, pool: PoolId) -> Self {
        self.removed_pools.insert(pool);
        self
    }

    pub fn with_pg_temp(mut self, pgid: PgId, acting: Vec<OsdId>) -> Self {
        self.new_pg_temp.insert(pgid, acting);
        self
    }

    pub fn with_ec_profile(
        mut self,
        name: impl Into<String>,
        profile: BTreeMap<String, String>,
    ) -> Self {
        self.new_ec_profiles.insert(name.into(), profile);
        self
    }

    /// Whether the delta changes nothing but the epoch.
    pub fn is_empty(&self) -> bool {
        self.new_up.is_empty()
            && self.new_down.is_empty()
            && self.removed_osds.is_empty()
            && self.new_up_thru.is_empty()
            && self.new_pools.is_empty()
            && self.removed_pools.is_empty()
            && self.new_pg_temp.is_empty()
            && self.new_ec_profiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_collects_changes() {
        let fsid = Uuid::new_v4();
        let inc = Incremental::new(fsid, 4)
            .with_new_down(3)
            .with_up_thru(1, 4)
            .with_removed_pool(9);

        assert_eq!(inc.epoch, 4);
        assert!(inc.new_down.contains(&3));
        assert_eq!(inc.new_up_thru.get(&1), Some(&4));
        assert!(inc.removed_pools.contains(&9));
        assert!(!inc.is_empty());
        assert!(Incremental::new(fsid, 5).is_empty());
    }
}
