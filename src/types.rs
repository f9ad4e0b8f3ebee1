//! Core identifier types used throughout the crate.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Cluster map version number.
pub type Epoch = u32;

/// Storage daemon identifier.
pub type OsdId = u32;

/// Pool identifier.
pub type PoolId = u64;

/// Execution core (shard) identifier.
pub type CoreId = u32;

/// Placement group identity within a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PgId {
    /// Owning pool.
    pub pool: PoolId,
    /// Placement seed within the pool.
    pub seed: u32,
}

impl PgId {
    /// Create a new PG id.
    pub const fn new(pool: PoolId, seed: u32) -> Self {
        Self { pool, seed }
    }
}

impl fmt::Display for PgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:x}", self.pool, self.seed)
    }
}

/// Sharded placement group id: the PG plus the erasure shard this daemon holds.
///
/// Replicated pools use `shard: None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SpgId {
    /// The placement group.
    pub pgid: PgId,
    /// Erasure shard, if any.
    pub shard: Option<u8>,
}

impl SpgId {
    /// A replicated (unsharded) PG.
    pub const fn new(pgid: PgId) -> Self {
        Self { pgid, shard: None }
    }

    /// An erasure-coded PG shard.
    pub const fn with_shard(pgid: PgId, shard: u8) -> Self {
        Self {
            pgid,
            shard: Some(shard),
        }
    }

    /// Owning pool.
    pub fn pool(&self) -> PoolId {
        self.pgid.pool
    }
}

impl From<PgId> for SpgId {
    fn from(pgid: PgId) -> Self {
        SpgId::new(pgid)
    }
}

impl fmt::Display for SpgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.shard {
            Some(shard) => write!(f, "{}s{}", self.pgid, shard),
            None => write!(f, "{}", self.pgid),
        }
    }
}

/// A daemon together with the PG shard it serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PgShard {
    pub osd: OsdId,
    pub shard: Option<u8>,
}

impl PgShard {
    pub const fn new(osd: OsdId, shard: Option<u8>) -> Self {
        Self { osd, shard }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pgid_display() {
        assert_eq!(PgId::new(1, 0).to_string(), "1.0");
        assert_eq!(PgId::new(3, 26).to_string(), "3.1a");
    }

    #[test]
    fn test_spgid_display() {
        let pgid = PgId::new(2, 7);
        assert_eq!(SpgId::new(pgid).to_string(), "2.7");
        assert_eq!(SpgId::with_shard(pgid, 1).to_string(), "2.7s1");
    }

    #[test]
    fn test_spgid_ordering_groups_by_pool() {
        let a = SpgId::new(PgId::new(1, 9));
        let b = SpgId::new(PgId::new(2, 0));
        assert!(a < b);
        assert_eq!(a.pool(), 1);
    }
}
