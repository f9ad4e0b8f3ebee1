//! Caches of decoded and encoded map epochs.

mod encoded;
mod epoch_cache;

pub use encoded::EncodedMapCache;
pub use epoch_cache::EpochCache;
