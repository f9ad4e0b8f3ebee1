//! Configuration for the map and placement-group core.

use crate::error::{Error, Result};
use crate::types::{CoreId, OsdId};

/// Config key for the backfill/recovery reservation ceiling.
pub const KEY_MAX_BACKFILLS: &str = "osd_max_backfills";

/// Config key for the minimum priority admitted by the recovery ledgers.
pub const KEY_MIN_RECOVERY_PRIORITY: &str = "osd_min_recovery_priority";

/// Config key for the snapshot-trim reservation ceiling.
pub const KEY_MAX_TRIMMING_PGS: &str = "osd_max_trimming_pgs";

/// Main configuration for a storage daemon's map/PG core.
#[derive(Debug, Clone)]
pub struct OsdConfig {
    /// This daemon's id in the cluster map.
    pub osd_id: OsdId,

    /// Number of execution cores (shards).
    pub num_cores: u32,

    /// Core that owns the cluster map authority.
    pub authority_core: CoreId,

    /// Concurrent local and remote backfill/recovery reservations.
    pub max_backfills: usize,

    /// Requests below this priority are never granted a recovery slot.
    pub min_recovery_priority: u32,

    /// Concurrent snapshot-trim reservations.
    pub max_trimming_pgs: usize,

    /// Operation budget for a single trim transaction.
    pub target_transaction_size: usize,

    /// Maximum number of epochs in one outgoing map update.
    pub map_message_max: usize,

    /// Maximum encoded bytes in one outgoing map update.
    pub map_message_max_bytes: usize,

    /// How far behind the newest epoch an unsolicited share may start.
    pub map_share_max_epochs: u32,

    /// Decoded map cache capacity.
    pub map_cache_size: usize,

    /// Encoded map cache capacity (each of full and incremental).
    pub map_bl_cache_size: u64,
}

impl Default for OsdConfig {
    fn default() -> Self {
        Self {
            osd_id: 0,
            num_cores: 1,
            authority_core: 0,
            max_backfills: 1,
            min_recovery_priority: 0,
            max_trimming_pgs: 2,
            target_transaction_size: 30,
            map_message_max: 40,
            map_message_max_bytes: 10 * 1024 * 1024, // 10MB
            map_share_max_epochs: 40,
            map_cache_size: 50,
            map_bl_cache_size: 50,
        }
    }
}

impl OsdConfig {
    /// Create a new configuration for the given daemon id.
    pub fn new(osd_id: OsdId) -> Self {
        Self {
            osd_id,
            ..Default::default()
        }
    }

    /// Set the number of execution cores.
    pub fn with_num_cores(mut self, num_cores: u32) -> Self {
        self.num_cores = num_cores;
        self
    }

    /// Set the core that owns the map authority.
    pub fn with_authority_core(mut self, core: CoreId) -> Self {
        self.authority_core = core;
        self
    }

    /// Set the backfill/recovery reservation ceiling.
    pub fn with_max_backfills(mut self, max: usize) -> Self {
        self.max_backfills = max;
        self
    }

    /// Set the minimum recovery priority.
    pub fn with_min_recovery_priority(mut self, priority: u32) -> Self {
        self.min_recovery_priority = priority;
        self
    }

    /// Set the snapshot-trim reservation ceiling.
    pub fn with_max_trimming_pgs(mut self, max: usize) -> Self {
        self.max_trimming_pgs = max;
        self
    }

    /// Set the trim transaction operation budget.
    pub fn with_target_transaction_size(mut self, ops: usize) -> Self {
        self.target_transaction_size = ops;
        self
    }

    /// Set the epoch count bound for outgoing map updates.
    pub fn with_map_message_max(mut self, epochs: usize) -> Self {
        self.map_message_max = epochs;
        self
    }

    /// Set the byte bound for outgoing map updates.
    pub fn with_map_message_max_bytes(mut self, bytes: usize) -> Self {
        self.map_message_max_bytes = bytes;
        self
    }

    /// Set the maximum epochs shared with a peer in one go.
    pub fn with_map_share_max_epochs(mut self, epochs: u32) -> Self {
        self.map_share_max_epochs = epochs;
        self
    }

    /// Set the decoded map cache capacity.
    pub fn with_map_cache_size(mut self, size: usize) -> Self {
        self.map_cache_size = size;
        self
    }

    /// Keys that can be changed on a running daemon.
    pub fn tracked_keys() -> &'static [&'static str] {
        &[
            KEY_MAX_BACKFILLS,
            KEY_MIN_RECOVERY_PRIORITY,
            KEY_MAX_TRIMMING_PGS,
        ]
    }

    /// Check the configuration for values the core cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.num_cores == 0 {
            return Err(Error::Config("num_cores must be at least 1".into()));
        }
        if self.authority_core >= self.num_cores {
            return Err(Error::Config(format!(
                "authority_core {} out of range for {} cores",
                self.authority_core, self.num_cores
            )));
        }
        if self.map_message_max == 0 {
            return Err(Error::Config("map_message_max must be at least 1".into()));
        }
        if self.map_message_max_bytes == 0 {
            return Err(Error::Config(
                "map_message_max_bytes must be at least 1".into(),
            ));
        }
        if self.target_transaction_size == 0 {
            return Err(Error::Config(
                "target_transaction_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OsdConfig::default();
        assert_eq!(config.num_cores, 1);
        assert_eq!(config.max_backfills, 1);
        assert_eq!(config.target_transaction_size, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = OsdConfig::new(7)
            .with_num_cores(4)
            .with_authority_core(2)
            .with_max_backfills(3)
            .with_map_message_max(5);

        assert_eq!(config.osd_id, 7);
        assert_eq!(config.num_cores, 4);
        assert_eq!(config.authority_core, 2);
        assert_eq!(config.max_backfills, 3);
        assert_eq!(config.map_message_max, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_authority_core() {
        let config = OsdConfig::new(1).with_num_cores(2).with_authority_core(2);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_budgets() {
        assert!(OsdConfig::new(1).with_num_cores(0).validate().is_err());
        assert!(OsdConfig::new(1).with_map_message_max(0).validate().is_err());
        assert!(OsdConfig::new(1)
            .with_target_transaction_size(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_tracked_keys() {
        let keys = OsdConfig::tracked_keys();
        assert!(keys.contains(&KEY_MAX_BACKFILLS));
        assert!(keys.contains(&KEY_MIN_RECOVERY_PRIORITY));
        assert!(keys.contains(&KEY_MAX_TRIMMING_PGS));
    }
}
