//! Error types for the map and placement-group core.

use crate::types::{CoreId, Epoch, SpgId};
use std::io;
use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Storage backend errors.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Transport and monitor errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Map decoding or incremental application errors.
    #[error("map error: {0}")]
    Map(#[from] MapError),

    /// A map batch claimed an epoch range but carried no encoding for an epoch inside it.
    #[error("map update claimed [{first}, {last}] but has no encoding for epoch {epoch}")]
    ProtocolViolation { epoch: Epoch, first: Epoch, last: Epoch },

    /// A map batch belongs to another cluster.
    #[error("fsid mismatch: expected {expected}, got {got}")]
    FsidMismatch { expected: uuid::Uuid, got: uuid::Uuid },

    /// An owner-only operation ran on the wrong execution core.
    #[error("operation owned by core {expected} ran on {actual:?}")]
    WrongCore { expected: CoreId, actual: Option<CoreId> },

    /// The target execution core is not running.
    #[error("core {0} is stopped")]
    CoreStopped(CoreId),

    /// The target execution core does not exist.
    #[error("unknown core {0}")]
    UnknownCore(CoreId),

    /// PG creation failed; every waiter observes the same reason.
    #[error("creation of pg {pgid} failed: {reason}")]
    PgCreationFailed { pgid: SpgId, reason: String },

    /// A queued reservation was cancelled before it was granted.
    #[error("reservation cancelled")]
    ReservationCancelled,

    /// The item already holds or waits for a reservation.
    #[error("item already reserved or queued")]
    AlreadyReserved,

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Storage layer errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Full map bytes for this epoch are not stored.
    #[error("map for epoch {0} not found")]
    MapNotFound(Epoch),

    /// Collection does not exist.
    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    /// Persisted record is missing.
    #[error("record not found: {0}")]
    RecordNotFound(String),

    /// Commit failed.
    #[error("commit failed: {0}")]
    CommitFailed(String),

    /// I/O error.
    #[error("storage io error: {0}")]
    Io(String),
}

/// Transport and monitor errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection failed.
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// The peer connection is gone.
    #[error("peer {0} disconnected")]
    Disconnected(String),

    /// Failed to send message.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Map codec and application errors.
#[derive(Error, Debug)]
pub enum MapError {
    /// Encoded blob does not start with the expected magic.
    #[error("bad magic: {0:?}")]
    BadMagic([u8; 4]),

    /// Encoding version is newer than this build understands.
    #[error("unsupported encoding version {0}")]
    UnsupportedVersion(u16),

    /// Blob shorter than its header claims.
    #[error("truncated encoding: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// CRC mismatch.
    #[error("checksum mismatch: expected {expected:#x}, computed {computed:#x}")]
    ChecksumMismatch { expected: u32, computed: u32 },

    /// Incremental does not follow the map it is applied to.
    #[error("incremental for epoch {got} cannot follow epoch {current}")]
    EpochMismatch { current: Epoch, got: Epoch },

    /// Encoded epoch differs from the epoch it was filed under.
    #[error("encoded epoch {encoded} stored as epoch {expected}")]
    MisfiledEpoch { expected: Epoch, encoded: Epoch },

    /// Incremental targets another cluster.
    #[error("incremental fsid does not match map fsid")]
    FsidMismatch,

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Map(MapError::Serialization(e.to_string()))
    }
}

impl From<bincode::Error> for MapError {
    fn from(e: bincode::Error) -> Self {
        MapError::Serialization(e.to_string())
    }
}

impl Error {
    /// Whether this error came from the storage backend.
    pub fn is_storage(&self) -> bool {
        matches!(self, Error::Storage(_))
    }
}
