//! Aligns bars of two symbols into pairs with a shared open time.

use pairs_core::{Bar, Leg, PairId, Timeframe, TimestampMs};
use std::collections::BTreeMap;
use tracing::debug;

/// Two bars, one per leg, covering the same interval.
#[derive(Debug, Clone, PartialEq)]
pub struct BarPair {
    pub open_time: TimestampMs,
    pub a: Bar,
    pub b: Bar,
}

/// Joins the bar streams of a pair's legs at one timeframe.
///
/// Each leg's bars arrive in increasing open time, so once leg A has
/// reached time `t`, any pending leg-B bar before `t` can never be matched
/// and is skipped.
pub struct PairSeries {
    pair: PairId,
    timeframe: Timeframe,
    pending_a: BTreeMap<TimestampMs, Bar>,
    pending_b: BTreeMap<TimestampMs, Bar>,
    max_pending: usize,
    last_emitted: Option<TimestampMs>,
    skipped: u64,
}

impl PairSeries {
    pub fn new(pair: PairId, timeframe: Timeframe, max_pending: usize) -> Self {
        Self {
            pair,
            timeframe,
            pending_a: BTreeMap::new(),
            pending_b: BTreeMap::new(),
            max_pending: max_pending.max(1),
            last_emitted: None,
            skipped: 0,
        }
    }

    pub fn pair(&self) -> &PairId {
        &self.pair
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    /// Bars dropped without a partner.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Bars waiting for the other leg.
    pub fn pending(&self) -> usize {
        self.pending_a.len() + self.pending_b.len()
    }

    /// Offer a finalized bar. Bars of other symbols or timeframes are ignored.
    pub fn push(&mut self, bar: Bar) -> Option<BarPair> {
        if bar.timeframe != self.timeframe {
            return None;
        }
        let leg = self.pair.leg_of(&bar.symbol)?;
        let open_time = bar.open_time;

        if self.last_emitted.is_some_and(|last| open_time <= last) {
            self.skipped += 1;
            debug!(pair = %self.pair, open_time, "stale bar skipped");
            return None;
        }

        let (own, other) = match leg {
            Leg::A => (&mut self.pending_a, &mut self.pending_b),
            Leg::B => (&mut self.pending_b, &mut self.pending_a),
        };

        // The other leg's bars before this one can no longer find a partner.
        let keep = other.split_off(&open_time);
        let dropped = other.len() as u64;
        *other = keep;

        let matched = other.remove(&open_time);
        let pair = match matched {
            Some(partner) => {
                // Own bars are older than this one and never matched either.
                let dropped_own = own.len() as u64;
                own.clear();
                self.skipped += dropped + dropped_own;
                self.last_emitted = Some(open_time);
                let (a, b) = match leg {
                    Leg::A => (bar, partner),
                    Leg::B => (partner, bar),
                };
                Some(BarPair { open_time, a, b })
            }
            None => {
                own.insert(open_time, bar);
                let mut evicted = 0;
                while own.len() > self.max_pending {
                    own.pop_first();
                    evicted += 1;
                }
                self.skipped += dropped + evicted;
                None
            }
        };

        if dropped > 0 {
            debug!(pair = %self.pair, dropped, "unmatched bars skipped");
        }
        pair
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(symbol: &str, open_time: TimestampMs, close: f64) -> Bar {
        Bar {
            symbol: symbol.to_string(),
            timeframe: Timeframe::ONE_SECOND,
            open_time,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            vwap: Some(close),
            trade_count: 1,
        }
    }

    fn series() -> PairSeries {
        PairSeries::new(PairId::new("BTCUSDT", "ETHUSDT"), Timeframe::ONE_SECOND, 8)
    }

    #[test]
    fn test_matches_on_open_time() {
        let mut s = series();
        assert!(s.push(bar("BTCUSDT", 0, 100.0)).is_none());
        let pair = s.push(bar("ETHUSDT", 0, 10.0)).unwrap();
        assert_eq!(pair.open_time, 0);
        assert_eq!(pair.a.symbol, "BTCUSDT");
        assert_eq!(pair.b.symbol, "ETHUSDT");
        assert_eq!(s.pending(), 0);
    }

    #[test]
    fn test_unmatched_bars_skipped() {
        let mut s = series();
        s.push(bar("BTCUSDT", 0, 100.0));
        s.push(bar("BTCUSDT", 1_000, 101.0));
        // ETH has no bar at 0; its first bar at 1s matches and drops BTC@0.
        let pair = s.push(bar("ETHUSDT", 1_000, 10.0)).unwrap();
        assert_eq!(pair.open_time, 1_000);
        assert_eq!(s.skipped(), 1);
        assert_eq!(s.pending(), 0);

        // ETH@2s waits; BTC jumps to 3s, so ETH@2s is dropped.
        assert!(s.push(bar("ETHUSDT", 2_000, 10.0)).is_none());
        assert!(s.push(bar("BTCUSDT", 3_000, 103.0)).is_none());
        assert_eq!(s.skipped(), 2);
        assert_eq!(s.pending(), 1);
    }

    #[test]
    fn test_emitted_open_times_strictly_increase() {
        let mut s = series();
        let mut emitted = Vec::new();
        let a_times = [0, 1_000, 2_000, 4_000, 5_000, 7_000];
        let b_times = [1_000, 2_000, 3_000, 5_000, 6_000, 7_000];
        for (ta, tb) in a_times.iter().zip(b_times.iter()) {
            emitted.extend(s.push(bar("BTCUSDT", *ta, 1.0)).map(|p| p.open_time));
            emitted.extend(s.push(bar("ETHUSDT", *tb, 1.0)).map(|p| p.open_time));
        }
        assert_eq!(emitted, vec![1_000, 2_000, 5_000, 7_000]);
    }

    #[test]
    fn test_stale_bar_ignored() {
        let mut s = series();
        s.push(bar("BTCUSDT", 1_000, 1.0));
        s.push(bar("ETHUSDT", 1_000, 1.0));
        assert!(s.push(bar("ETHUSDT", 1_000, 2.0)).is_none());
        assert!(s.push(bar("BTCUSDT", 0, 2.0)).is_none());
        assert_eq!(s.skipped(), 2);
    }

    #[test]
    fn test_other_symbols_and_timeframes_ignored() {
        let mut s = series();
        assert!(s.push(bar("SOLUSDT", 0, 1.0)).is_none());
        let mut minute = bar("BTCUSDT", 0, 1.0);
        minute.timeframe = Timeframe::ONE_MINUTE;
        assert!(s.push(minute).is_none());
        assert_eq!(s.pending(), 0);
        assert_eq!(s.skipped(), 0);
    }

    #[test]
    fn test_pending_bounded() {
        let mut s = PairSeries::new(PairId::new("BTCUSDT", "ETHUSDT"), Timeframe::ONE_SECOND, 3);
        for i in 0..10 {
            s.push(bar("BTCUSDT", i * 1_000, 1.0));
        }
        assert_eq!(s.pending(), 3);
        assert_eq!(s.skipped(), 7);
        // The newest pending bars are still matchable.
        assert!(s.push(bar("ETHUSDT", 9_000, 1.0)).is_some());
    }
}
