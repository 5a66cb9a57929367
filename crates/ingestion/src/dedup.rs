//! Duplicate tick suppression and ingestion statistics.
//!
//! Reconnecting sources replay recent trades. A tick is a duplicate when
//! `(timestamp, price, quantity)` matches one already ingested for the same
//! symbol. Keys are only kept while some timeframe could still accept the
//! tick, i.e. not older than the oldest open bar.

use ordered_float::OrderedFloat;
use pairs_core::{Tick, TickKey, TimestampMs};
use serde::Serialize;
use std::collections::BTreeSet;

/// Statistics about ingestion quality.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestStats {
    /// Total ticks offered.
    pub total_ticks: u64,
    /// Ticks accepted by at least one timeframe.
    pub accepted_ticks: u64,
    /// Exact duplicates ignored.
    pub duplicate_ticks: u64,
    /// Ticks with non-finite/non-positive price or negative quantity.
    pub invalid_ticks: u64,
    /// Ticks late for every timeframe.
    pub late_ticks: u64,
    /// Per-timeframe late drops (a tick can count once per timeframe).
    pub late_drops: u64,
    /// Finalized bars with at least one tick.
    pub bars_emitted: u64,
    /// Zero-volume bars emitted by fill-forward.
    pub gap_fill_bars: u64,
}

impl IngestStats {
    /// Fraction of offered ticks that were not accepted anywhere.
    pub fn drop_frac(&self) -> f64 {
        if self.total_ticks > 0 {
            (self.total_ticks - self.accepted_ticks) as f64 / self.total_ticks as f64
        } else {
            0.0
        }
    }
}

/// Remembers recently ingested tick identities.
pub struct TickDeduplicator {
    seen: BTreeSet<TickKey>,
    /// Hard cap; oldest keys go first when exceeded.
    max_keys: usize,
}

impl TickDeduplicator {
    /// Create a new deduplicator.
    pub fn new(max_keys: usize) -> Self {
        Self {
            seen: BTreeSet::new(),
            max_keys,
        }
    }

    /// Whether this exact tick was already recorded.
    pub fn is_duplicate(&self, tick: &Tick) -> bool {
        self.seen.contains(&tick.key())
    }

    /// Record an ingested tick.
    pub fn record(&mut self, tick: &Tick) {
        self.seen.insert(tick.key());
        while self.seen.len() > self.max_keys {
            self.seen.pop_first();
        }
    }

    /// Forget keys older than `watermark`; such ticks are late everywhere.
    pub fn prune_before(&mut self, watermark: TimestampMs) {
        let bound = TickKey {
            ts_ms: watermark,
            price: OrderedFloat(f64::NEG_INFINITY),
            quantity: OrderedFloat(f64::NEG_INFINITY),
        };
        self.seen = self.seen.split_off(&bound);
    }

    /// Number of remembered keys.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn tick(ts_ms: i64, price: f64, quantity: f64) -> Tick {
        Tick::new("BTCUSDT", ts_ms, price, quantity)
    }

    #[test]
    fn test_detects_exact_duplicate() {
        let mut dedup = TickDeduplicator::new(1_000);
        let t = tick(100, 50000.0, 0.1);
        assert!(!dedup.is_duplicate(&t));
        dedup.record(&t);
        assert!(dedup.is_duplicate(&t));
        // Same time and price, different size: a distinct trade.
        assert!(!dedup.is_duplicate(&tick(100, 50000.0, 0.2)));
    }

    #[test]
    fn test_prune_before_watermark() {
        let mut dedup = TickDeduplicator::new(1_000);
        dedup.record(&tick(100, 1.0, 1.0));
        dedup.record(&tick(900, 1.0, 1.0));
        dedup.record(&tick(1_000, 1.0, 1.0));
        dedup.record(&tick(1_500, 1.0, 1.0));

        dedup.prune_before(1_000);
        assert_eq!(dedup.len(), 2);
        assert!(!dedup.is_duplicate(&tick(900, 1.0, 1.0)));
        assert!(dedup.is_duplicate(&tick(1_000, 1.0, 1.0)));
    }

    #[test]
    fn test_cap_evicts_oldest() {
        let mut dedup = TickDeduplicator::new(2);
        dedup.record(&tick(1, 1.0, 1.0));
        dedup.record(&tick(2, 1.0, 1.0));
        dedup.record(&tick(3, 1.0, 1.0));
        assert_eq!(dedup.len(), 2);
        assert!(!dedup.is_duplicate(&tick(1, 1.0, 1.0)));
        assert!(dedup.is_duplicate(&tick(3, 1.0, 1.0)));
    }

    #[test]
    fn test_stats_drop_frac() {
        let stats = IngestStats {
            total_ticks: 10,
            accepted_ticks: 8,
            ..Default::default()
        };
        assert_relative_eq!(stats.drop_frac(), 0.2, epsilon = 1e-12);
        assert_eq!(IngestStats::default().drop_frac(), 0.0);
    }
}
