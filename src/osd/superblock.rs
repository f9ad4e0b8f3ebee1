//! Persisted record of retained-epoch bounds.

use crate::types::{Epoch, OsdId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Superblock of a daemon.
///
/// `oldest_map..=newest_map` is the range of epochs kept on disk.
/// `cluster_trim_lower_bound` only ever rises.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub fsid: Uuid,
    pub whoami: OsdId,
    pub oldest_map: Epoch,
    pub newest_map: Epoch,
    pub cluster_trim_lower_bound: Epoch,
}

impl Superblock {
    pub fn new(fsid: Uuid, whoami: OsdId) -> Self {
        Self {
            fsid,
            whoami,
            oldest_map: 0,
            newest_map: 0,
            cluster_trim_lower_bound: 0,
        }
    }

    /// True until the first map is stored.
    pub fn is_empty(&self) -> bool {
        self.newest_map == 0
    }

    /// Record newly stored epochs `first..=last`.
    pub fn insert_range(&mut self, first: Epoch, last: Epoch) {
        if self.oldest_map == 0 || first < self.oldest_map {
            self.oldest_map = first;
        }
        if last > self.newest_map {
            self.newest_map = last;
        }
    }

    /// Whether an epoch is inside the retained range.
    pub fn retains(&self, epoch: Epoch) -> bool {
        !self.is_empty() && epoch >= self.oldest_map && epoch <= self.newest_map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_range_extends_bounds() {
        let mut sb = Superblock::new(Uuid::nil(), 0);
        assert!(sb.is_empty());
        sb.insert_range(5, 6);
        assert_eq!((sb.oldest_map, sb.newest_map), (5, 6));
        sb.insert_range(7, 9);
        assert_eq!((sb.oldest_map, sb.newest_map), (5, 9));
        assert!(sb.retains(5));
        assert!(!sb.retains(10));
    }
}
