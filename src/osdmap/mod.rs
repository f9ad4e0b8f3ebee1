//! Cluster map epochs: the decoded map, incremental deltas and their encodings.

pub mod codec;
mod incremental;
mod map;

pub use codec::{decode_full, decode_incremental, encode_full, encode_incremental};
pub use incremental::Incremental;
pub use map::{
    ClusterMap, OsdInfo, PoolInfo, PoolKind, UpActing, FLAG_CREATING, FLAG_SHARDED_BACKEND,
};
