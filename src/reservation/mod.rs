//! Admission control for background work.
//!
//! A [`Reserver`] bounds how many items may run a class of background work
//! (backfill, recovery, snapshot trimming) at once. Requests beyond the
//! ceiling queue by priority, highest first and FIFO within a priority.
//! Granted items are never preempted; a higher-priority request only jumps
//! ahead of requests that are still queued.

use crate::config::{
    OsdConfig, KEY_MAX_BACKFILLS, KEY_MAX_TRIMMING_PGS, KEY_MIN_RECOVERY_PRIORITY,
};
use crate::error::{Error, Result};
use crate::types::SpgId;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use tokio::sync::oneshot;
use tracing::debug;

/// Outcome of a reservation request.
#[derive(Debug)]
pub enum Reservation {
    /// A slot was free; the item holds it now.
    Granted,
    /// The item is queued; the waiter resolves when it is granted.
    Queued(GrantWaiter),
}

impl Reservation {
    pub fn is_granted(&self) -> bool {
        matches!(self, Reservation::Granted)
    }
}

/// Resolves once a queued reservation is granted.
#[derive(Debug)]
pub struct GrantWaiter {
    rx: oneshot::Receiver<()>,
}

impl GrantWaiter {
    /// Wait for the grant. Fails if the request is cancelled first.
    pub async fn granted(self) -> Result<()> {
        self.rx.await.map_err(|_| Error::ReservationCancelled)
    }
}

struct Queued<K> {
    item: K,
    tx: oneshot::Sender<()>,
}

struct State<K> {
    max_allowed: usize,
    min_priority: u32,
    granted: HashMap<K, u32>,
    queues: BTreeMap<u32, VecDeque<Queued<K>>>,
    queued_prio: HashMap<K, u32>,
}

/// A single admission-control ledger.
pub struct Reserver<K> {
    name: &'static str,
    state: Mutex<State<K>>,
}

impl<K> Reserver<K>
where
    K: Clone + Eq + Hash + Debug,
{
    /// Create a ledger admitting `max_allowed` items at priority `min_priority` or above.
    pub fn new(name: &'static str, max_allowed: usize, min_priority: u32) -> Self {
        Self {
            name,
            state: Mutex::new(State {
                max_allowed,
                min_priority,
                granted: HashMap::new(),
                queues: BTreeMap::new(),
                queued_prio: HashMap::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Request a slot for `item`.
    pub fn reserve(&self, item: K, priority: u32) -> Result<Reservation> {
        let mut state = self.state.lock();
        if state.granted.contains_key(&item) || state.queued_prio.contains_key(&item) {
            return Err(Error::AlreadyReserved);
        }

        let (tx, rx) = oneshot::channel();
        state
            .queues
            .entry(priority)
            .or_default()
            .push_back(Queued {
                item: item.clone(),
                tx,
            });
        state.queued_prio.insert(item.clone(), priority);
        self.do_queues(&mut state);

        if state.granted.contains_key(&item) {
            Ok(Reservation::Granted)
        } else {
            debug!(reserver = self.name, item = ?item, priority, "Reservation queued");
            Ok(Reservation::Queued(GrantWaiter { rx }))
        }
    }

    /// Release a granted slot or withdraw a queued request.
    ///
    /// Returns false if the item was unknown.
    pub fn cancel(&self, item: &K) -> bool {
        let mut state = self.state.lock();

        if state.granted.remove(item).is_some() {
            debug!(reserver = self.name, item = ?item, "Reservation released");
            self.do_queues(&mut state);
            return true;
        }

        if let Some(priority) = state.queued_prio.remove(item) {
            remove_queued(&mut state.queues, priority, item);
            debug!(reserver = self.name, item = ?item, "Queued reservation cancelled");
            return true;
        }

        false
    }

    /// Change the priority of a queued request. Granted items are unaffected.
    pub fn update_priority(&self, item: &K, priority: u32) -> bool {
        let mut state = self.state.lock();
        let Some(old) = state.queued_prio.get(item).copied() else {
            return false;
        };
        if old == priority {
            return true;
        }

        let Some(entry) = remove_queued(&mut state.queues, old, item) else {
            return false;
        };
        state.queues.entry(priority).or_default().push_back(entry);
        state.queued_prio.insert(item.clone(), priority);
        self.do_queues(&mut state);
        true
    }

    /// Change the concurrency ceiling.
    pub fn set_max(&self, max_allowed: usize) {
        let mut state = self.state.lock();
        state.max_allowed = max_allowed;
        self.do_queues(&mut state);
    }

    /// Change the minimum grantable priority.
    pub fn set_min_priority(&self, min_priority: u32) {
        let mut state = self.state.lock();
        state.min_priority = min_priority;
        self.do_queues(&mut state);
    }

    pub fn max_allowed(&self) -> usize {
        self.state.lock().max_allowed
    }

    pub fn min_priority(&self) -> u32 {
        self.state.lock().min_priority
    }

    pub fn granted_count(&self) -> usize {
        self.state.lock().granted.len()
    }

    pub fn queued_count(&self) -> usize {
        self.state.lock().queued_prio.len()
    }

    /// Whether the item holds or waits for a slot.
    pub fn has_reservation(&self, item: &K) -> bool {
        let state = self.state.lock();
        state.granted.contains_key(item) || state.queued_prio.contains_key(item)
    }

    /// Whether the item holds a slot.
    pub fn is_granted(&self, item: &K) -> bool {
        self.state.lock().granted.contains_key(item)
    }

    fn do_queues(&self, state: &mut State<K>) {
        while state.granted.len() < state.max_allowed {
            let min_priority = state.min_priority;
            let Some((&priority, queue)) = state
                .queues
                .range_mut(min_priority..)
                .next_back()
            else {
                break;
            };

            let next = queue.pop_front();
            if queue.is_empty() {
                state.queues.remove(&priority);
            }
            let Some(next) = next else {
                continue;
            };

            state.queued_prio.remove(&next.item);
            if next.tx.send(()).is_err() {
                // Waiter dropped; the request is abandoned.
                continue;
            }
            debug!(reserver = self.name, item = ?next.item, priority, "Reservation granted");
            state.granted.insert(next.item, priority);
        }
    }
}

fn remove_queued<K: Eq>(
    queues: &mut BTreeMap<u32, VecDeque<Queued<K>>>,
    priority: u32,
    item: &K,
) -> Option<Queued<K>> {
    let queue = queues.get_mut(&priority)?;
    let pos = queue.iter().position(|q| &q.item == item)?;
    let entry = queue.remove(pos);
    if queue.is_empty() {
        queues.remove(&priority);
    }
    entry
}

impl<K> Debug for Reserver<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Reserver")
            .field("name", &self.name)
            .field("max_allowed", &state.max_allowed)
            .field("min_priority", &state.min_priority)
            .field("granted", &state.granted.len())
            .field("queued", &state.queued_prio.len())
            .finish()
    }
}

/// The three independent ledgers of a daemon.
#[derive(Debug)]
pub struct Reservers {
    /// Backfill/recovery work this daemon drives as primary.
    pub local: Reserver<SpgId>,
    /// Backfill/recovery work requested by remote primaries.
    pub remote: Reserver<SpgId>,
    /// Snapshot trimming.
    pub snap_trim: Reserver<SpgId>,
}

impl Reservers {
    pub fn new(config: &OsdConfig) -> Self {
        Self {
            local: Reserver::new(
                "local",
                config.max_backfills,
                config.min_recovery_priority,
            ),
            remote: Reserver::new(
                "remote",
                config.max_backfills,
                config.min_recovery_priority,
            ),
            snap_trim: Reserver::new("snap_trim", config.max_trimming_pgs, 0),
        }
    }

    /// Apply the changed tracked keys from `config`.
    pub fn handle_conf_change(&self, config: &OsdConfig, changed: &HashSet<String>) {
        if changed.contains(KEY_MAX_BACKFILLS) {
            self.local.set_max(config.max_backfills);
            self.remote.set_max(config.max_backfills);
        }
        if changed.contains(KEY_MIN_RECOVERY_PRIORITY) {
            self.local.set_min_priority(config.min_recovery_priority);
            self.remote.set_min_priority(config.min_recovery_priority);
        }
        if changed.contains(KEY_MAX_TRIMMING_PGS) {
            self.snap_trim.set_max(config.max_trimming_pgs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PgId;

    fn pg(seed: u32) -> SpgId {
        SpgId::new(PgId::new(1, seed))
    }

    #[test]
    fn test_grant_within_ceiling() {
        let reserver = Reserver::new("test", 2, 0);
        assert!(reserver.reserve(pg(1), 10).unwrap().is_granted());
        assert!(reserver.reserve(pg(2), 10).unwrap().is_granted());
        assert!(!reserver.reserve(pg(3), 10).unwrap().is_granted());
        assert_eq!(reserver.granted_count(), 2);
        assert_eq!(reserver.queued_count(), 1);
    }

    #[test]
    fn test_duplicate_reservation_rejected() {
        let reserver = Reserver::new("test", 1, 0);
        reserver.reserve(pg(1), 1).unwrap();
        assert!(matches!(
            reserver.reserve(pg(1), 1),
            Err(Error::AlreadyReserved)
        ));
    }

    #[tokio::test]
    async fn test_higher_priority_jumps_queue() {
        let reserver = Reserver::new("test", 1, 0);
        reserver.reserve(pg(1), 1).unwrap();

        let low = match reserver.reserve(pg(2), 1).unwrap() {
            Reservation::Queued(w) => w,
            Reservation::Granted => panic!("expected queued"),
        };
        let high = match reserver.reserve(pg(3), 200).unwrap() {
            Reservation::Queued(w) => w,
            Reservation::Granted => panic!("expected queued"),
        };

        assert!(reserver.cancel(&pg(1)));
        high.granted().await.unwrap();
        assert!(reserver.is_granted(&pg(3)));
        assert!(!reserver.is_granted(&pg(2)));

        assert!(reserver.cancel(&pg(3)));
        low.granted().await.unwrap();
        assert!(reserver.is_granted(&pg(2)));
    }

    #[tokio::test]
    async fn test_granted_items_are_not_preempted() {
        let reserver = Reserver::new("test", 1, 0);
        reserver.reserve(pg(1), 1).unwrap();
        let _waiter = reserver.reserve(pg(2), 255).unwrap();
        assert!(reserver.is_granted(&pg(1)));
        assert!(!reserver.is_granted(&pg(2)));
    }

    #[tokio::test]
    async fn test_cancel_queued_fails_waiter() {
        let reserver = Reserver::new("test", 1, 0);
        reserver.reserve(pg(1), 1).unwrap();
        let waiter = match reserver.reserve(pg(2), 1).unwrap() {
            Reservation::Queued(w) => w,
            Reservation::Granted => panic!("expected queued"),
        };

        assert!(reserver.cancel(&pg(2)));
        assert!(matches!(
            waiter.granted().await,
            Err(Error::ReservationCancelled)
        ));
        assert!(!reserver.cancel(&pg(2)));
    }

    #[tokio::test]
    async fn test_min_priority_blocks_low_requests() {
        let reserver = Reserver::new("test", 4, 50);
        let low = reserver.reserve(pg(1), 10).unwrap();
        assert!(!low.is_granted());
        assert!(reserver.reserve(pg(2), 60).unwrap().is_granted());

        reserver.set_min_priority(0);
        assert!(reserver.is_granted(&pg(1)));
        if let Reservation::Queued(w) = low {
            w.granted().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_raising_max_drains_queue() {
        let reserver = Reserver::new("test", 0, 0);
        let waiter = reserver.reserve(pg(1), 5).unwrap();
        assert_eq!(reserver.granted_count(), 0);

        reserver.set_max(1);
        assert_eq!(reserver.granted_count(), 1);
        if let Reservation::Queued(w) = waiter {
            w.granted().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_update_priority_reorders_queue() {
        let reserver = Reserver::new("test", 1, 0);
        reserver.reserve(pg(1), 1).unwrap();
        let _a = reserver.reserve(pg(2), 5).unwrap();
        let _b = reserver.reserve(pg(3), 1).unwrap();

        assert!(reserver.update_priority(&pg(3), 9));
        assert!(!reserver.update_priority(&pg(1), 9));
        reserver.cancel(&pg(1));
        assert!(reserver.is_granted(&pg(3)));
    }

    #[test]
    fn test_handle_conf_change_touches_only_changed_keys() {
        let config = OsdConfig::default();
        let reservers = Reservers::new(&config);

        let updated = config
            .clone()
            .with_max_backfills(4)
            .with_max_trimming_pgs(7);
        let changed: HashSet<String> = [KEY_MAX_BACKFILLS.to_string()].into();
        reservers.handle_conf_change(&updated, &changed);

        assert_eq!(reservers.local.max_allowed(), 4);
        assert_eq!(reservers.remote.max_allowed(), 4);
        assert_eq!(reservers.snap_trim.max_allowed(), 2);
    }
}
