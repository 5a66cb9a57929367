//! Multi-timeframe resampling for one symbol.
//!
//! Fans each tick out to one [`BarBuilder`] per timeframe. Lateness is
//! judged per timeframe, so a tick too old for the 1s bar may still land in
//! the open 5m bar.

use crate::bar_builder::{BarBuilder, TickFit};
use crate::dedup::{IngestStats, TickDeduplicator};
use pairs_core::{config::MarketConfig, Bar, Tick, Timeframe, TimestampMs};
use tracing::debug;

/// Result of offering a tick to the resampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Added to at least one open bar; `late_timeframes` rejected it.
    Accepted { late_timeframes: usize },
    /// Exact duplicate of an ingested tick.
    Duplicate,
    /// Malformed or for another symbol.
    Invalid,
    /// Older than every open bar.
    Late,
}

impl IngestOutcome {
    pub fn is_accepted(self) -> bool {
        matches!(self, IngestOutcome::Accepted { .. })
    }
}

/// Resampler turning one symbol's ticks into bars at every timeframe.
pub struct Resampler {
    symbol: String,
    /// Builders ordered by timeframe.
    builders: Vec<BarBuilder>,
    dedup: TickDeduplicator,
    /// Watermark the deduplicator was last pruned to.
    pruned_to: Option<TimestampMs>,
    stats: IngestStats,
}

impl Resampler {
    /// Create a resampler from market configuration.
    pub fn new(symbol: impl Into<String>, market: &MarketConfig) -> Self {
        let symbol = symbol.into();
        let mut timeframes = market.timeframes.clone();
        timeframes.sort();
        timeframes.dedup();

        let builders = timeframes
            .into_iter()
            .map(|tf| BarBuilder::new(symbol.clone(), tf, market.gap_policy, market.max_gap_fill_bars))
            .collect();

        Self {
            symbol,
            builders,
            dedup: TickDeduplicator::new(market.max_dedup_keys),
            pruned_to: None,
            stats: IngestStats::default(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn timeframes(&self) -> impl Iterator<Item = Timeframe> + '_ {
        self.builders.iter().map(|b| b.timeframe())
    }

    /// Offer a tick to every timeframe.
    pub fn ingest(&mut self, tick: &Tick) -> IngestOutcome {
        self.stats.total_ticks += 1;

        if tick.symbol != self.symbol || !tick.is_valid() {
            self.stats.invalid_ticks += 1;
            debug!(symbol = %self.symbol, ?tick, "invalid tick dropped");
            return IngestOutcome::Invalid;
        }

        if self.dedup.is_duplicate(tick) {
            self.stats.duplicate_ticks += 1;
            debug!(symbol = %self.symbol, ts_ms = tick.ts_ms, "duplicate tick ignored");
            return IngestOutcome::Duplicate;
        }

        let mut late = 0;
        for builder in &mut self.builders {
            if builder.add_trade(tick.ts_ms, tick.price, tick.quantity) == TickFit::Late {
                late += 1;
            }
        }
        self.stats.late_drops += late as u64;

        if late == self.builders.len() {
            self.stats.late_ticks += 1;
            debug!(symbol = %self.symbol, ts_ms = tick.ts_ms, "late tick dropped for all timeframes");
            return IngestOutcome::Late;
        }
        if late > 0 {
            debug!(symbol = %self.symbol, ts_ms = tick.ts_ms, late, "late tick dropped for finer timeframes");
        }

        self.stats.accepted_ticks += 1;
        self.dedup.record(tick);
        self.prune_dedup();
        IngestOutcome::Accepted { late_timeframes: late }
    }

    /// Finalize every interval that ended at or before `now`.
    ///
    /// Bars are ordered by timeframe, then open time.
    pub fn advance(&mut self, now: TimestampMs) -> Vec<Bar> {
        let mut bars = Vec::new();
        for builder in &mut self.builders {
            bars.extend(builder.advance(now));
        }
        for bar in &bars {
            if bar.is_gap_fill() {
                self.stats.gap_fill_bars += 1;
            } else {
                self.stats.bars_emitted += 1;
            }
        }
        self.prune_dedup();
        bars
    }

    /// Start of the open bar at `timeframe`.
    pub fn watermark(&self, timeframe: Timeframe) -> Option<TimestampMs> {
        self.builder(timeframe).and_then(|b| b.watermark())
    }

    /// Snapshot of the open bar at `timeframe`.
    pub fn open_bar(&self, timeframe: Timeframe) -> Option<Bar> {
        self.builder(timeframe).and_then(|b| b.open_bar())
    }

    /// Get ingestion statistics.
    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    fn builder(&self, timeframe: Timeframe) -> Option<&BarBuilder> {
        self.builders.iter().find(|b| b.timeframe() == timeframe)
    }

    /// Oldest open-bar start across timeframes.
    fn oldest_watermark(&self) -> Option<TimestampMs> {
        self.builders.iter().filter_map(|b| b.watermark()).min()
    }

    fn prune_dedup(&mut self) {
        let Some(watermark) = self.oldest_watermark() else {
            return;
        };
        if self.pruned_to.map_or(true, |p| watermark > p) {
            self.dedup.prune_before(watermark);
            self.pruned_to = Some(watermark);
        }
    }
}
