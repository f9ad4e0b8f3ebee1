//! Metrics for the map and PG lifecycle core.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                        OsdMetrics                          │
//! │  ┌────────────────────────┐  ┌──────────────────────────┐  │
//! │  │ Counters               │  │ Gauges                   │  │
//! │  │ - maps received/applied│  │ - oldest_map             │  │
//! │  │ - epochs trimmed       │  │ - newest_map             │  │
//! │  │ - pgs created/canceled │  │ - pg_count               │  │
//! │  │ - peer sends/skips     │  │                          │  │
//! │  └────────────────────────┘  └──────────────────────────┘  │
//! └───────────────────────────────────────────────────────────┘
//! ```

mod counters;
mod gauges;

pub use counters::{Counter, LabeledCounter};
pub use gauges::Gauge;

use crate::types::Epoch;

/// Metrics of one daemon.
#[derive(Debug)]
pub struct OsdMetrics {
    /// Full encodings received from the monitor or peers.
    pub maps_received_full: Counter,
    /// Incremental encodings received.
    pub maps_received_incremental: Counter,
    /// Epochs applied and committed.
    pub maps_applied: Counter,
    /// Map batches rejected.
    pub map_batches_rejected: Counter,
    /// Epochs removed from disk.
    pub epochs_trimmed: Counter,
    /// Decoded map lookups served from the cache.
    pub map_cache_hits: Counter,
    /// Decoded map lookups that went to storage.
    pub map_cache_misses: Counter,

    /// PGs created.
    pub pgs_created: Counter,
    /// PG creations cancelled by validation.
    pub pgs_canceled: Counter,
    /// PG creations that failed.
    pub pg_creation_failures: Counter,
    /// PGs loaded from disk.
    pub pgs_loaded: Counter,

    /// pg_temp messages sent to the monitor.
    pub pg_temp_sent: Counter,
    /// Liveness claims sent.
    pub alive_sent: Counter,
    /// Messages sent to peers, by kind.
    pub peer_messages_sent: LabeledCounter,
    /// Peer sends skipped, by reason.
    pub peer_messages_skipped: LabeledCounter,

    /// Oldest retained epoch.
    pub oldest_map: Gauge,
    /// Newest retained epoch.
    pub newest_map: Gauge,
    /// Hosted PGs.
    pub pg_count: Gauge,
}

impl OsdMetrics {
    pub fn new() -> Self {
        Self {
            maps_received_full: Counter::new(
                "osd_maps_received_full_total",
                "Full map encodings received",
            ),
            maps_received_incremental: Counter::new(
                "osd_maps_received_incremental_total",
                "Incremental map encodings received",
            ),
            maps_applied: Counter::new("osd_maps_applied_total", "Map epochs applied"),
            map_batches_rejected: Counter::new(
                "osd_map_batches_rejected_total",
                "Map batches rejected",
            ),
            epochs_trimmed: Counter::new("osd_epochs_trimmed_total", "Map epochs trimmed"),
            map_cache_hits: Counter::new("osd_map_cache_hits_total", "Map cache hits"),
            map_cache_misses: Counter::new("osd_map_cache_misses_total", "Map cache misses"),
            pgs_created: Counter::new("osd_pgs_created_total", "PGs created"),
            pgs_canceled: Counter::new("osd_pgs_canceled_total", "PG creations cancelled"),
            pg_creation_failures: Counter::new(
                "osd_pg_creation_failures_total",
                "PG creations failed",
            ),
            pgs_loaded: Counter::new("osd_pgs_loaded_total", "PGs loaded from disk"),
            pg_temp_sent: Counter::new("osd_pg_temp_sent_total", "pg_temp messages sent"),
            alive_sent: Counter::new("osd_alive_sent_total", "Alive claims sent"),
            peer_messages_sent: LabeledCounter::new(
                "osd_peer_messages_sent_total",
                "Messages sent to peers",
                "kind",
            ),
            peer_messages_skipped: LabeledCounter::new(
                "osd_peer_messages_skipped_total",
                "Peer sends skipped",
                "reason",
            ),
            oldest_map: Gauge::new("osd_oldest_map", "Oldest retained epoch"),
            newest_map: Gauge::new("osd_newest_map", "Newest retained epoch"),
            pg_count: Gauge::new("osd_pg_count", "Hosted PGs"),
        }
    }

    /// Record the retained epoch range.
    pub fn set_map_range(&self, oldest: Epoch, newest: Epoch) {
        self.oldest_map.set(oldest as i64);
        self.newest_map.set(newest as i64);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            maps_received_full: self.maps_received_full.get(),
            maps_received_incremental: self.maps_received_incremental.get(),
            maps_applied: self.maps_applied.get(),
            map_batches_rejected: self.map_batches_rejected.get(),
            epochs_trimmed: self.epochs_trimmed.get(),
            map_cache_hits: self.map_cache_hits.get(),
            map_cache_misses: self.map_cache_misses.get(),
            pgs_created: self.pgs_created.get(),
            pgs_canceled: self.pgs_canceled.get(),
            pg_creation_failures: self.pg_creation_failures.get(),
            pgs_loaded: self.pgs_loaded.get(),
            pg_temp_sent: self.pg_temp_sent.get(),
            alive_sent: self.alive_sent.get(),
            peer_messages_sent: self.peer_messages_sent.total(),
            peer_messages_skipped: self.peer_messages_skipped.total(),
            oldest_map: self.oldest_map.get(),
            newest_map: self.newest_map.get(),
            pg_count: self.pg_count.get(),
        }
    }

    /// Format in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        macro_rules! add_metric {
            ($kind:literal, $metric:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $metric.name(),
                    $metric.help(),
                    $metric.name(),
                    $kind,
                    $metric.name(),
                    $metric.get()
                ));
            };
        }

        add_metric!("counter", self.maps_received_full);
        add_metric!("counter", self.maps_received_incremental);
        add_metric!("counter", self.maps_applied);
        add_metric!("counter", self.map_batches_rejected);
        add_metric!("counter", self.epochs_trimmed);
        add_metric!("counter", self.map_cache_hits);
        add_metric!("counter", self.map_cache_misses);
        add_metric!("counter", self.pgs_created);
        add_metric!("counter", self.pgs_canceled);
        add_metric!("counter", self.pg_creation_failures);
        add_metric!("counter", self.pgs_loaded);
        add_metric!("counter", self.pg_temp_sent);
        add_metric!("counter", self.alive_sent);

        for labeled in [&self.peer_messages_sent, &self.peer_messages_skipped] {
            output.push_str(&format!(
                "# HELP {} {}\n# TYPE {} counter\n",
                labeled.name(),
                labeled.help(),
                labeled.name()
            ));
            for (value, count) in labeled.get_all() {
                output.push_str(&format!(
                    "{}{{{}=\"{}\"}} {}\n",
                    labeled.name(),
                    labeled.label(),
                    value,
                    count
                ));
            }
        }

        add_metric!("gauge", self.oldest_map);
        add_metric!("gauge", self.newest_map);
        add_metric!("gauge", self.pg_count);

        output
    }
}

impl Default for OsdMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`OsdMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub maps_received_full: u64,
    pub maps_received_incremental: u64,
    pub maps_applied: u64,
    pub map_batches_rejected: u64,
    pub epochs_trimmed: u64,
    pub map_cache_hits: u64,
    pub map_cache_misses: u64,
    pub pgs_created: u64,
    pub pgs_canceled: u64,
    pub pg_creation_failures: u64,
    pub pgs_loaded: u64,
    pub pg_temp_sent: u64,
    pub alive_sent: u64,
    pub peer_messages_sent: u64,
    pub peer_messages_skipped: u64,
    pub oldest_map: i64,
    pub newest_map: i64,
    pub pg_count: i64,
}

impl MetricsSnapshot {
    /// Fraction of decoded map lookups served from the cache.
    pub fn map_cache_hit_rate(&self) -> f64 {
        let total = self.map_cache_hits + self.map_cache_misses;
        if total == 0 {
            0.0
        } else {
            self.map_cache_hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let metrics = OsdMetrics::new();
        metrics.maps_applied.inc_by(2);
        metrics.map_cache_hits.inc_by(3);
        metrics.map_cache_misses.inc();
        metrics.peer_messages_skipped.inc("down");
        metrics.set_map_range(5, 9);

        let snap = metrics.snapshot();
        assert_eq!(snap.maps_applied, 2);
        assert_eq!(snap.peer_messages_skipped, 1);
        assert_eq!((snap.oldest_map, snap.newest_map), (5, 9));
        assert!((snap.map_cache_hit_rate() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = OsdMetrics::new();
        metrics.peer_messages_sent.inc("map_update");
        let output = metrics.to_prometheus();
        assert!(output.contains("# TYPE osd_maps_applied_total counter"));
        assert!(output.contains("osd_peer_messages_sent_total{kind=\"map_update\"} 1"));
        assert!(output.contains("# TYPE osd_pg_count gauge"));
    }
}
