//! Cluster-map epoch tracking and placement-group lifecycle for a sharded
//! storage daemon.
//!
//! This crate is the core every storage daemon runs between its monitor
//! client and its object store:
//! - **Map authority**: applies map epochs from the monitor or peers,
//!   persists them, trims old ones and builds incremental updates for peers
//! - **Per-core PG services**: create, load, advance and stop placement
//!   groups on the core that owns them
//! - **Reservation ledgers** bounding concurrent background work
//!
//! # Example
//!
//! ```rust,no_run
//! use mapkeeper::testing::{MapHistory, RecordingMessenger, RecordingMonClient};
//! use mapkeeper::{MemStore, OsdConfig, OsdNode, PgCreateInfo, PgId, SpgId};
//! use std::sync::Arc;
//! use uuid::Uuid;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let history = MapHistory::with_cluster(Uuid::new_v4(), 3, 3, 8)?;
//!     let node = OsdNode::start(
//!         OsdConfig::new(0).with_num_cores(4),
//!         Arc::new(MemStore::new()),
//!         Arc::new(RecordingMessenger::new()),
//!         Arc::new(RecordingMonClient::new(history.fsid())),
//!     )
//!     .await?;
//!
//!     // Map batches go through the authority, then to every core
//!     node.handle_map_update(history.mixed_update(1, 1)?).await?;
//!
//!     // PG creation is coalesced per PG
//!     let pgid = SpgId::new(PgId::new(1, 0));
//!     let pg = node
//!         .get_or_create_pg(pgid, Some(PgCreateInfo::new(pgid, 1, true)))
//!         .await?;
//!     println!("created: {:?}", pg);
//!
//!     node.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │        Monitor client / peer transport       │
//! └─────────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │                  OsdNode                     │
//! │  • handle_map_update(update)                 │
//! │  • get_or_create_pg(pgid, info)              │
//! │  • trim(floor) / send_alive / pg_temp        │
//! └─────────────────────────────────────────────┘
//!                     │
//!     ┌───────────────┼───────────────┐
//!     ▼               ▼               ▼
//! ┌──────────┐  ┌────────────┐  ┌───────────┐
//! │Authority │  │Coordinator │  │  Object   │
//! │(one core)│  │ (per core) │  │  store    │
//! └──────────┘  └────────────┘  └───────────┘
//! ```
//!
//! # Execution model
//!
//! State lives on exactly one core. The authority's maps, superblock and
//! pg_temp queue belong to `authority_core`; each PG and its placement
//! table entry belong to the core it was assigned to. Cross-core access
//! goes through [`ShardRuntime::invoke_on`], and every core-affine
//! operation checks its caller with [`shard::ensure_core`].

pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod network;
pub mod osd;
pub mod osdmap;
pub mod pg;
pub mod reservation;
pub mod scrub;
pub mod shard;
pub mod storage;
pub mod testing;
pub mod types;

// Re-export main types for convenience
pub use config::OsdConfig;
pub use error::{Error, MapError, NetworkError, Result, StorageError};
pub use types::{CoreId, Epoch, OsdId, PgId, PgShard, PoolId, SpgId};

// Re-export the daemon
pub use osd::{ClusterMapAuthority, MapUpdateOutcome, OsdNode, ShardCoordinator, Superblock};

// Re-export map types
pub use osdmap::{ClusterMap, Incremental, PoolInfo};

// Re-export PG types
pub use pg::{PgCreateInfo, PgState, PgStats, PlacementGroup};

// Re-export collaborator contracts
pub use network::{Connection, MapUpdate, Message, Messenger, MonClient};
pub use scrub::{ScrubBackend, ScrubEvent};
pub use shard::ShardRuntime;
pub use storage::{MemStore, ObjectStore, Transaction};

// Re-export caches, ledgers and metrics
pub use cache::{EncodedMapCache, EpochCache};
pub use metrics::{Counter, Gauge, LabeledCounter, MetricsSnapshot, OsdMetrics};
pub use reservation::{Reservation, Reserver, Reservers};
