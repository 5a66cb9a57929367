//! Recent closes per symbol and timeframe for the cross-symbol correlation matrix.

use pairs_analytics::CorrelationMatrix;
use pairs_core::{Bar, Result, Timeframe, TimestampMs};
use std::collections::{BTreeSet, HashMap, VecDeque};

/// Last `capacity` closes of every symbol/timeframe seen on the bar stream.
#[derive(Debug)]
pub struct CloseHistory {
    capacity: usize,
    series: HashMap<(String, Timeframe), VecDeque<(TimestampMs, f64)>>,
}

impl CloseHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(2),
            series: HashMap::new(),
        }
    }

    pub fn push(&mut self, bar: &Bar) {
        let series = self.series.entry((bar.symbol.clone(), bar.timeframe)).or_default();
        if series.back().is_some_and(|&(t, _)| t >= bar.open_time) {
            return;
        }
        if series.len() == self.capacity {
            series.pop_front();
        }
        series.push_back((bar.open_time, bar.close));
    }

    pub fn len(&self, symbol: &str, timeframe: Timeframe) -> usize {
        self.series.get(&(symbol.to_string(), timeframe)).map_or(0, VecDeque::len)
    }

    /// Correlations of `symbols` over the open times they all share.
    pub fn correlation_matrix(
        &self,
        symbols: &[String],
        timeframe: Timeframe,
        epsilon: f64,
    ) -> Result<CorrelationMatrix> {
        let empty = VecDeque::new();
        let series: Vec<&VecDeque<(TimestampMs, f64)>> = symbols
            .iter()
            .map(|s| self.series.get(&(s.clone(), timeframe)).unwrap_or(&empty))
            .collect();

        let mut common: Option<BTreeSet<TimestampMs>> = None;
        for s in &series {
            let times: BTreeSet<TimestampMs> = s.iter().map(|&(t, _)| t).collect();
            common = Some(match common {
                None => times,
                Some(prev) => prev.intersection(&times).copied().collect(),
            });
        }
        let common = common.unwrap_or_default();

        let columns: Vec<(String, Vec<f64>)> = symbols
            .iter()
            .zip(&series)
            .map(|(symbol, s)| {
                let closes = s
                    .iter()
                    .filter(|(t, _)| common.contains(t))
                    .map(|&(_, close)| close)
                    .collect();
                (symbol.clone(), closes)
            })
            .collect();
        CorrelationMatrix::compute(&columns, epsilon)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn bar(symbol: &str, i: i64, close: f64) -> Bar {
        Bar {
            symbol: symbol.to_string(),
            timeframe: Timeframe::ONE_MINUTE,
            open_time: i * 60_000,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            vwap: Some(close),
            trade_count: 1,
        }
    }

    fn symbols() -> Vec<String> {
        vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
    }

    #[test]
    fn test_aligns_on_common_open_times() {
        let mut history = CloseHistory::new(10);
        for i in 0..6 {
            history.push(&bar("BTCUSDT", i, 100.0 + i as f64));
        }
        // ETH misses minute 2; the extra point breaks correlation if not dropped
        for i in [0, 1, 3, 4, 5] {
            history.push(&bar("ETHUSDT", i, 50.0 + 2.0 * i as f64));
        }
        let m = history.correlation_matrix(&symbols(), Timeframe::ONE_MINUTE, 1e-12).unwrap();
        assert_eq!(m.n_obs, 5);
        assert_relative_eq!(m.get("BTCUSDT", "ETHUSDT").unwrap(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_capacity_and_stale_bars() {
        let mut history = CloseHistory::new(3);
        for i in 0..5 {
            history.push(&bar("BTCUSDT", i, 1.0 + i as f64));
        }
        history.push(&bar("BTCUSDT", 2, 99.0));
        assert_eq!(history.len("BTCUSDT", Timeframe::ONE_MINUTE), 3);
    }

    #[test]
    fn test_unknown_symbol_gives_empty_matrix() {
        let mut history = CloseHistory::new(5);
        history.push(&bar("BTCUSDT", 0, 1.0));
        let m = history.correlation_matrix(&symbols(), Timeframe::ONE_MINUTE, 1e-12).unwrap();
        assert_eq!(m.n_obs, 0);
        assert_eq!(m.get("BTCUSDT", "ETHUSDT"), None);
    }
}
