//! Coalescing queue of pg_temp requests.

use crate::types::{OsdId, PgId};
use std::collections::BTreeMap;
use tracing::debug;

/// A wanted acting-set override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgTempEntry {
    pub acting: Vec<OsdId>,
    pub forced: bool,
}

/// pg_temp requests split into not-yet-sent (`wanted`) and sent but not
/// acknowledged (`pending`). A PG id is in at most one of the two.
#[derive(Debug, Default)]
pub struct PgTempQueue {
    wanted: BTreeMap<PgId, PgTempEntry>,
    pending: BTreeMap<PgId, PgTempEntry>,
}

/// Entries drained by [`PgTempQueue::take_wanted`], split by the forced flag.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PgTempBatch {
    pub unforced: BTreeMap<PgId, Vec<OsdId>>,
    pub forced: BTreeMap<PgId, Vec<OsdId>>,
}

impl PgTempBatch {
    pub fn is_empty(&self) -> bool {
        self.unforced.is_empty() && self.forced.is_empty()
    }
}

impl PgTempQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Want `acting` for `pgid`.
    ///
    /// A request identical to one already in flight is dropped unless
    /// `forced`; anything else replaces both the wanted and the in-flight
    /// entry.
    pub fn queue_want(&mut self, pgid: PgId, acting: Vec<OsdId>, forced: bool) {
        let in_flight = self
            .pending
            .get(&pgid)
            .map(|entry| entry.acting == acting)
            .unwrap_or(false);
        if in_flight && !forced {
            debug!(pgid = %pgid, "pg_temp already in flight");
            return;
        }
        self.pending.remove(&pgid);
        self.wanted.insert(pgid, PgTempEntry { acting, forced });
    }

    /// Forget `pgid` in both maps.
    pub fn remove_want(&mut self, pgid: &PgId) {
        self.wanted.remove(pgid);
        self.pending.remove(pgid);
    }

    /// Move in-flight entries back to wanted without overriding newer wants.
    pub fn requeue(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        let requeued = pending.len();
        for (pgid, entry) in pending {
            self.wanted.entry(pgid).or_insert(entry);
        }
        debug!(requeued, wanted = self.wanted.len(), "Requeued pg_temp");
    }

    /// Drain wanted into pending and return what must be sent.
    pub fn take_wanted(&mut self) -> PgTempBatch {
        let mut batch = PgTempBatch::default();
        for (pgid, entry) in std::mem::take(&mut self.wanted) {
            if entry.forced {
                batch.forced.insert(pgid, entry.acting.clone());
            } else {
                batch.unforced.insert(pgid, entry.acting.clone());
            }
            self.pending.insert(pgid, entry);
        }
        batch
    }

    pub fn wanted(&self) -> &BTreeMap<PgId, PgTempEntry> {
        &self.wanted
    }

    pub fn pending(&self) -> &BTreeMap<PgId, PgTempEntry> {
        &self.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pg(seed: u32) -> PgId {
        PgId::new(1, seed)
    }

    #[test]
    fn test_repeated_want_coalesces() {
        let mut queue = PgTempQueue::new();
        queue.queue_want(pg(0), vec![1, 2], false);
        queue.queue_want(pg(0), vec![1, 2], false);
        assert_eq!(queue.wanted().len(), 1);

        queue.queue_want(pg(0), vec![2, 1], false);
        assert_eq!(queue.wanted()[&pg(0)].acting, vec![2, 1]);
    }

    #[test]
    fn test_take_wanted_moves_to_pending() {
        let mut queue = PgTempQueue::new();
        queue.queue_want(pg(0), vec![1], false);
        queue.queue_want(pg(1), vec![2], true);

        let batch = queue.take_wanted();
        assert_eq!(batch.unforced.len(), 1);
        assert_eq!(batch.forced.len(), 1);
        assert!(queue.wanted().is_empty());
        assert_eq!(queue.pending().len(), 2);
    }

    #[test]
    fn test_in_flight_duplicate_is_dropped_unless_forced() {
        let mut queue = PgTempQueue::new();
        queue.queue_want(pg(0), vec![1, 2], false);
        queue.take_wanted();

        queue.queue_want(pg(0), vec![1, 2], false);
        assert!(queue.wanted().is_empty());
        assert!(queue.pending().contains_key(&pg(0)));

        queue.queue_want(pg(0), vec![1, 2], true);
        assert!(queue.wanted().contains_key(&pg(0)));
        assert!(!queue.pending().contains_key(&pg(0)));
    }

    #[test]
    fn test_requeue_keeps_newer_wants() {
        let mut queue = PgTempQueue::new();
        queue.queue_want(pg(0), vec![1], false);
        queue.queue_want(pg(1), vec![3], false);
        queue.take_wanted();

        queue.queue_want(pg(1), vec![4], false);
        queue.requeue();
        queue.requeue();

        assert!(queue.pending().is_empty());
        assert_eq!(queue.wanted()[&pg(0)].acting, vec![1]);
        assert_eq!(queue.wanted()[&pg(1)].acting, vec![4]);
    }

    #[test]
    fn test_remove_want_clears_both() {
        let mut queue = PgTempQueue::new();
        queue.queue_want(pg(0), vec![1], false);
        queue.take_wanted();
        queue.queue_want(pg(1), vec![1], false);

        queue.remove_want(&pg(0));
        queue.remove_want(&pg(1));
        assert!(queue.wanted().is_empty());
        assert!(queue.pending().is_empty());
    }
}
