//! Hand-off to the per-PG scrub collaborator.
//!
//! The core only asks for a range of objects to be scanned; the scan runs
//! elsewhere and reports back with a [`ScrubEvent`].

use crate::error::Result;
use crate::types::{Epoch, SpgId};
use serde::{Deserialize, Serialize};

/// Request to scan `[start, end)` of a PG's objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRequest {
    pub pgid: SpgId,
    /// Map epoch the request was issued at.
    pub version: Epoch,
    pub deep: bool,
    pub start: String,
    pub end: String,
}

/// Outcome of one range scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    pub objects: u64,
    pub errors: u64,
}

/// Events delivered back by the scrub collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScrubEvent {
    ScanComplete {
        pgid: SpgId,
        start: String,
        end: String,
        result: ScanResult,
    },
}

/// Scrub collaborator contract.
pub trait ScrubBackend: Send + Sync + std::fmt::Debug {
    /// Start a scan. Returns once the request is accepted, not when it finishes.
    fn scan_range(&self, request: ScanRequest) -> Result<()>;
}
