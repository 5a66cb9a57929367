//! Bar building for a single symbol and timeframe.
//!
//! A builder owns exactly one open interval. Ticks inside it update OHLCV in
//! O(1); ticks before it are late; ticks after it roll the builder forward,
//! finalizing the open bar into the ready queue.

use pairs_core::{config::GapPolicy, Bar, Size, Timeframe, TimestampMs};
use tracing::{debug, warn};

/// Where a tick landed relative to the open interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickFit {
    /// Added to the open bar.
    Accepted,
    /// Precedes the open bar's start; dropped.
    Late,
}

/// A bar that's currently being built.
#[derive(Debug, Clone, Default)]
struct BarInProgress {
    open: Option<f64>,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    vwap_numerator: f64,
    trade_count: u32,
}

impl BarInProgress {
    fn add_trade(&mut self, price: f64, size: Size) {
        match self.open {
            None => {
                self.open = Some(price);
                self.high = price;
                self.low = price;
            }
            Some(_) => {
                self.high = self.high.max(price);
                self.low = self.low.min(price);
            }
        }
        self.close = price;
        self.volume += size;
        self.vwap_numerator += price * size;
        self.trade_count += 1;
    }

    fn vwap(&self) -> Option<f64> {
        if self.volume > 0.0 {
            Some(self.vwap_numerator / self.volume)
        } else {
            None
        }
    }

    fn to_bar(&self, symbol: &str, timeframe: Timeframe, open_time: TimestampMs) -> Option<Bar> {
        let open = self.open?;
        Some(Bar {
            symbol: symbol.to_string(),
            timeframe,
            open_time,
            open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            vwap: self.vwap(),
            trade_count: self.trade_count,
        })
    }
}

/// Builder for bars of one symbol at one timeframe.
pub struct BarBuilder {
    symbol: String,
    timeframe: Timeframe,
    gap_policy: GapPolicy,
    max_gap_fill_bars: u32,
    /// Start of the open interval; `None` until the first tick.
    open_time: Option<TimestampMs>,
    current: BarInProgress,
    /// Close of the last real bar, carried by gap fills.
    last_close: Option<f64>,
    /// Gap-fill bars emitted since the last real bar.
    consecutive_fills: u32,
    /// Whether the current gap already hit the fill cap.
    fill_cut_logged: bool,
    /// Bars finalized but not yet handed out.
    ready: Vec<Bar>,
    last_emitted: Option<TimestampMs>,
}

impl BarBuilder {
    /// Create a new bar builder.
    pub fn new(
        symbol: impl Into<String>,
        timeframe: Timeframe,
        gap_policy: GapPolicy,
        max_gap_fill_bars: u32,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
            gap_policy,
            max_gap_fill_bars,
            open_time: None,
            current: BarInProgress::default(),
            last_close: None,
            consecutive_fills: 0,
            fill_cut_logged: false,
            ready: Vec::new(),
            last_emitted: None,
        }
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    /// Start of the open interval. Ticks before it are late.
    pub fn watermark(&self) -> Option<TimestampMs> {
        self.open_time
    }

    /// Add a trade.
    pub fn add_trade(&mut self, ts_ms: TimestampMs, price: f64, size: Size) -> TickFit {
        match self.open_time {
            None => self.open_time = Some(self.timeframe.floor(ts_ms)),
            Some(open) if ts_ms < open => return TickFit::Late,
            Some(open) if ts_ms >= self.timeframe.end_of(open) => self.roll_to(ts_ms),
            Some(_) => {}
        }
        self.current.add_trade(price, size);
        TickFit::Accepted
    }

    /// Finalize every interval that ended at or before `now` and hand out
    /// all finalized bars in open-time order.
    pub fn advance(&mut self, now: TimestampMs) -> Vec<Bar> {
        if let Some(open) = self.open_time {
            if now >= self.timeframe.end_of(open) {
                self.roll_to(now);
            }
        }
        std::mem::take(&mut self.ready)
    }

    /// Snapshot of the open bar, if it has received any tick.
    pub fn open_bar(&self) -> Option<Bar> {
        let open_time = self.open_time?;
        self.current.to_bar(&self.symbol, self.timeframe, open_time)
    }

    /// Number of finalized bars waiting to be handed out.
    pub fn pending_bar_count(&self) -> usize {
        self.ready.len()
    }

    /// Close the open interval and every empty interval up to the one
    /// containing `now`, which becomes the new open interval.
    fn roll_to(&mut self, now: TimestampMs) {
        let Some(open) = self.open_time else {
            return;
        };
        let target = self.timeframe.floor(now);
        if target <= open {
            return;
        }
        let step = self.timeframe.as_millis();

        let mut gap_start = open;
        if let Some(bar) = self.current.to_bar(&self.symbol, self.timeframe, open) {
            self.last_close = Some(bar.close);
            self.consecutive_fills = 0;
            self.fill_cut_logged = false;
            self.push_ready(bar);
            gap_start = open + step;
        }

        if self.gap_policy == GapPolicy::FillForward && gap_start < target {
            self.fill_gap(gap_start, target);
        }

        self.open_time = Some(target);
        self.current = BarInProgress::default();
    }

    fn fill_gap(&mut self, from: TimestampMs, until: TimestampMs) {
        let Some(close) = self.last_close else {
            return;
        };
        let step = self.timeframe.as_millis();
        let empty = ((until - from) / step) as u64;
        let budget = self.max_gap_fill_bars.saturating_sub(self.consecutive_fills) as u64;
        let fills = empty.min(budget);

        for k in 0..fills as i64 {
            let bar = Bar {
                symbol: self.symbol.clone(),
                timeframe: self.timeframe,
                open_time: from + k * step,
                open: close,
                high: close,
                low: close,
                close,
                volume: 0.0,
                vwap: None,
                trade_count: 0,
            };
            self.push_ready(bar);
        }
        self.consecutive_fills += fills as u32;

        if empty > fills && !self.fill_cut_logged {
            self.fill_cut_logged = true;
            warn!(
                symbol = %self.symbol,
                timeframe = %self.timeframe,
                empty_intervals = empty,
                filled = fills,
                "gap longer than max_gap_fill_bars, leaving remainder sparse"
            );
        }
    }

    fn push_ready(&mut self, bar: Bar) {
        if let Some(last) = self.last_emitted {
            if bar.open_time <= last {
                debug!(symbol = %self.symbol, open_time = bar.open_time, "bar already emitted, skipping");
                return;
            }
        }
        self.last_emitted = Some(bar.open_time);
        self.ready.push(bar);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn builder(policy: GapPolicy) -> BarBuilder {
        BarBuilder::new("BTCUSDT", Timeframe::ONE_SECOND, policy, 3)
    }

    #[test]
    fn test_single_trade() {
        let mut b = builder(GapPolicy::Sparse);
        assert_eq!(b.add_trade(1_500, 50000.5, 0.1), TickFit::Accepted);

        // Still inside [1000, 2000)
        assert!(b.advance(1_999).is_empty());

        let bars = b.advance(2_000);
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].open_time, 1_000);
        assert_relative_eq!(bars[0].open, 50000.5, epsilon = 1e-10);
        assert_relative_eq!(bars[0].close, 50000.5, epsilon = 1e-10);
        assert_relative_eq!(bars[0].volume, 0.1, epsilon = 1e-10);
        assert_eq!(bars[0].trade_count, 1);
    }

    #[test]
    fn test_multiple_trades_same_interval() {
        let mut b = builder(GapPolicy::Sparse);
        b.add_trade(1_100, 50000.0, 0.1); // Open
        b.add_trade(1_200, 50005.0, 0.2); // High
        b.add_trade(1_300, 49995.0, 0.1); // Low
        b.add_trade(1_500, 50001.0, 0.1); // Close

        let bars = b.advance(2_100);
        assert_eq!(bars.len(), 1);
        assert_relative_eq!(bars[0].open, 50000.0, epsilon = 1e-10);
        assert_relative_eq!(bars[0].high, 50005.0, epsilon = 1e-10);
        assert_relative_eq!(bars[0].low, 49995.0, epsilon = 1e-10);
        assert_relative_eq!(bars[0].close, 50001.0, epsilon = 1e-10);
        assert_relative_eq!(bars[0].volume, 0.5, epsilon = 1e-10);
        assert_eq!(bars[0].trade_count, 4);
        assert!(bars[0].is_consistent());
    }

    #[test]
    fn test_vwap_calculation() {
        let mut b = builder(GapPolicy::Sparse);
        // VWAP = (100*50000 + 200*50010) / 300
        b.add_trade(1_100, 50000.0, 100.0);
        b.add_trade(1_200, 50010.0, 200.0);

        let bars = b.advance(2_000);
        let expected_vwap = (100.0 * 50000.0 + 200.0 * 50010.0) / 300.0;
        assert_relative_eq!(bars[0].vwap.unwrap(), expected_vwap, epsilon = 1e-6);
    }

    #[test]
    fn test_tick_in_next_interval_rolls_bar() {
        let mut b = builder(GapPolicy::Sparse);
        b.add_trade(100, 100.0, 1.0);
        b.add_trade(1_200, 101.0, 1.0);

        // The first bar was finalized by the second tick and is waiting.
        assert_eq!(b.pending_bar_count(), 1);
        assert_eq!(b.watermark(), Some(1_000));

        let bars = b.advance(1_300);
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].open_time, 0);
        assert_eq!(b.open_bar().unwrap().open, 101.0);
    }

    #[test]
    fn test_late_tick_dropped() {
        let mut b = builder(GapPolicy::Sparse);
        b.add_trade(1_100, 100.0, 1.0);
        b.add_trade(1_200, 101.0, 1.0);
        let before = b.open_bar().unwrap();

        assert_eq!(b.add_trade(900, 500.0, 10.0), TickFit::Late);
        assert_eq!(b.open_bar().unwrap(), before);
    }

    #[test]
    fn test_sparse_skips_empty_intervals() {
        let mut b = builder(GapPolicy::Sparse);
        b.add_trade(100, 100.0, 1.0);
        b.add_trade(5_100, 105.0, 1.0);
        let bars = b.advance(6_000);
        let opens: Vec<_> = bars.iter().map(|b| b.open_time).collect();
        assert_eq!(opens, vec![0, 5_000]);
    }

    #[test]
    fn test_fill_forward_carries_close() {
        let mut b = builder(GapPolicy::FillForward);
        b.add_trade(100, 100.0, 1.0);
        b.add_trade(200, 99.0, 1.0);
        let bars = b.advance(3_000);

        let opens: Vec<_> = bars.iter().map(|b| b.open_time).collect();
        assert_eq!(opens, vec![0, 1_000, 2_000]);
        for fill in &bars[1..] {
            assert!(fill.is_gap_fill());
            assert_eq!(fill.volume, 0.0);
            assert_eq!(fill.vwap, None);
            assert_eq!(fill.open, 99.0);
            assert_eq!(fill.close, 99.0);
        }
    }

    #[test]
    fn test_fill_forward_caps_consecutive_fills() {
        let mut b = builder(GapPolicy::FillForward);
        b.add_trade(100, 100.0, 1.0);

        // Ten empty seconds, capped at three fills.
        let bars = b.advance(11_000);
        assert_eq!(bars.len(), 1 + 3);

        // Stepping the clock further adds nothing until a tick arrives.
        assert!(b.advance(12_000).is_empty());
        assert!(b.advance(13_000).is_empty());

        b.add_trade(13_500, 101.0, 1.0);
        let bars = b.advance(14_000);
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].open_time, 13_000);
        assert!(!bars[0].is_gap_fill());
    }

    #[test]
    fn test_fill_forward_incremental_clock() {
        let mut b = builder(GapPolicy::FillForward);
        b.add_trade(100, 100.0, 1.0);
        assert_eq!(b.advance(1_000).len(), 1);
        // Open interval [1000, 2000) is empty; each step closes one interval.
        assert_eq!(b.advance(2_000).len(), 1);
        assert_eq!(b.advance(3_000).len(), 1);
        assert_eq!(b.advance(4_000).len(), 1);
        assert_eq!(b.advance(5_000).len(), 0);
    }

    #[test]
    fn test_no_fill_before_first_tick() {
        let mut b = builder(GapPolicy::FillForward);
        assert!(b.advance(10_000).is_empty());
        assert_eq!(b.watermark(), None);
    }
}
