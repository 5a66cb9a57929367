//! Z-score mean-reversion backtest over a snapshot stream.
//!
//! Enters long the spread when `z < -entry_z`, short when `z > entry_z`, and
//! exits once z crosses `exit_z` back toward the mean. One position at a
//! time; entry and exit never happen on the same snapshot.

use crate::metrics::{BacktestMetrics, MetricsCalculator};
use crate::position::{ClosedTrade, SpreadPosition, SpreadSide};
use pairs_core::{config::BacktestConfig, AnalyticsSnapshot, Error, PairId, Result, Timeframe};
use serde::Serialize;
use tracing::{debug, info};

/// Position still open after the last snapshot, marked to its spread.
#[derive(Debug, Clone, Serialize)]
pub struct OpenPositionMark {
    pub position: SpreadPosition,
    pub mark_spread: f64,
    pub unrealized_pnl: f64,
}

/// Backtest output.
#[derive(Debug, Clone, Serialize)]
pub struct BacktestReport {
    pub pair: Option<PairId>,
    pub timeframe: Option<Timeframe>,
    pub trades: Vec<ClosedTrade>,
    pub open_position: Option<OpenPositionMark>,
    /// Exposure after each evaluated snapshot: 1 long, -1 short, 0 flat.
    pub exposure: Vec<i8>,
    /// Snapshots without a defined z-score or spread.
    pub skipped_snapshots: usize,
    pub metrics: BacktestMetrics,
}

/// Mean-reversion backtest.
#[derive(Debug, Clone)]
pub struct MeanReversionBacktest {
    entry_z: f64,
    exit_z: f64,
    calculator: MetricsCalculator,
}

impl MeanReversionBacktest {
    /// Create a backtest with explicit thresholds.
    pub fn new(entry_z: f64, exit_z: f64) -> Result<Self> {
        if !(entry_z > 0.0) || !(exit_z.abs() < entry_z) {
            return Err(Error::config(format!(
                "backtest requires entry_z > 0 and |exit_z| < entry_z, got {entry_z}/{exit_z}"
            )));
        }
        Ok(Self {
            entry_z,
            exit_z,
            calculator: MetricsCalculator::default(),
        })
    }

    pub fn from_config(config: &BacktestConfig) -> Result<Self> {
        Self::new(config.entry_z, config.exit_z)
    }

    /// Replay snapshots of a single pair and timeframe in order.
    pub fn run(&self, snapshots: &[AnalyticsSnapshot]) -> Result<BacktestReport> {
        let first = snapshots.first();
        if let Some(first) = first {
            if let Some(other) = snapshots
                .iter()
                .find(|s| s.pair != first.pair || s.timeframe != first.timeframe)
            {
                return Err(Error::data(format!(
                    "backtest input mixes {} @ {} with {} @ {}",
                    first.pair, first.timeframe, other.pair, other.timeframe
                )));
            }
        }

        let mut trades = Vec::new();
        let mut exposure = Vec::with_capacity(snapshots.len());
        let mut skipped = 0;
        let mut position: Option<SpreadPosition> = None;
        let mut last_spread = None;

        for snap in snapshots {
            let (Some(z), Some(spread)) = (snap.z_score, snap.spread) else {
                skipped += 1;
                continue;
            };
            last_spread = Some(spread);

            position = match position.take() {
                None => {
                    let side = if z < -self.entry_z {
                        Some(SpreadSide::Long)
                    } else if z > self.entry_z {
                        Some(SpreadSide::Short)
                    } else {
                        None
                    };
                    side.map(|side| {
                        debug!(pair = %snap.pair, open_time = snap.open_time, ?side, z, "enter spread position");
                        SpreadPosition {
                            side,
                            entry_time: snap.open_time,
                            entry_spread: spread,
                            entry_z: z,
                        }
                    })
                }
                Some(open) if open.should_exit(z, self.exit_z) => {
                    let trade = open.close(snap.open_time, spread, z);
                    debug!(pair = %snap.pair, open_time = snap.open_time, pnl = trade.pnl, "exit spread position");
                    trades.push(trade);
                    None
                }
                held => held,
            };

            exposure.push(match position.as_ref().map(|p| p.side) {
                Some(SpreadSide::Long) => 1,
                Some(SpreadSide::Short) => -1,
                None => 0,
            });
        }

        let open_position = match (position, last_spread) {
            (Some(position), Some(mark_spread)) => Some(OpenPositionMark {
                unrealized_pnl: position.unrealized_pnl(mark_spread),
                position,
                mark_spread,
            }),
            _ => None,
        };

        let metrics = self.calculator.calculate(&trades);
        info!(
            snapshots = snapshots.len(),
            skipped,
            trades = metrics.total_trades,
            total_pnl = metrics.total_pnl,
            "backtest finished"
        );

        Ok(BacktestReport {
            pair: first.map(|s| s.pair.clone()),
            timeframe: first.map(|s| s.timeframe),
            trades,
            open_position,
            exposure,
            skipped_snapshots: skipped,
            metrics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn snap(i: i64, z: Option<f64>, spread: f64) -> AnalyticsSnapshot {
        AnalyticsSnapshot {
            pair: PairId::new("BTCUSDT", "ETHUSDT"),
            timeframe: Timeframe::ONE_MINUTE,
            open_time: i * 60_000,
            close_a: 0.0,
            close_b: 0.0,
            window_len: 20,
            hedge_ratio: z.map(|_| 1.0),
            spread: z.map(|_| spread),
            z_score: z,
            correlation: None,
            adf_stat: None,
            adf_pvalue: None,
            adf_computed_at: None,
            computed_at: (i + 1) * 60_000,
        }
    }

    fn backtest() -> MeanReversionBacktest {
        MeanReversionBacktest::new(2.0, 0.0).unwrap()
    }

    #[test]
    fn test_long_round_trip() {
        let snaps = vec![
            snap(0, None, 0.0),
            snap(1, Some(-1.0), -1.0),
            snap(2, Some(-2.5), -5.0), // enter long
            snap(3, Some(-1.2), -3.0),
            snap(4, Some(0.3), 1.0), // exit
        ];
        let report = backtest().run(&snaps).unwrap();
        assert_eq!(report.skipped_snapshots, 1);
        assert_eq!(report.trades.len(), 1);
        let trade = &report.trades[0];
        assert_eq!(trade.side, SpreadSide::Long);
        assert_eq!(trade.entry_time, 120_000);
        assert_eq!(trade.exit_time, 240_000);
        assert_relative_eq!(trade.pnl, 6.0);
        assert_eq!(report.exposure, vec![0, 1, 1, 0]);
        assert!(report.open_position.is_none());
    }

    #[test]
    fn test_short_round_trip_and_reentry() {
        let snaps = vec![
            snap(0, Some(2.4), 8.0), // enter short
            snap(1, Some(0.5), 5.0),
            snap(2, Some(-0.1), 2.0), // exit
            snap(3, Some(-2.1), -4.0), // enter long
            snap(4, Some(-3.0), -6.0),
            snap(5, Some(0.0), 0.0), // exit at exactly exit_z
        ];
        let report = backtest().run(&snaps).unwrap();
        assert_eq!(report.trades.len(), 2);
        assert_eq!(report.trades[0].side, SpreadSide::Short);
        assert_relative_eq!(report.trades[0].pnl, 6.0);
        assert_relative_eq!(report.trades[1].pnl, 4.0);
        assert_eq!(report.metrics.winning_trades, 2);
        assert_relative_eq!(report.metrics.total_pnl, 10.0);
    }

    #[test]
    fn test_open_position_marked_not_counted() {
        let snaps = vec![snap(0, Some(2.5), 10.0), snap(1, Some(1.0), 7.0)];
        let report = backtest().run(&snaps).unwrap();
        assert!(report.trades.is_empty());
        assert_eq!(report.metrics.total_trades, 0);
        let open = report.open_position.unwrap();
        assert_eq!(open.position.side, SpreadSide::Short);
        assert_relative_eq!(open.unrealized_pnl, 3.0);
    }

    #[test]
    fn test_rejects_mixed_pairs_and_bad_thresholds() {
        let mut other = snap(1, Some(0.0), 0.0);
        other.pair = PairId::new("BNBUSDT", "SOLUSDT");
        assert!(backtest().run(&[snap(0, Some(0.0), 0.0), other]).is_err());

        assert!(MeanReversionBacktest::new(0.0, 0.0).is_err());
        assert!(MeanReversionBacktest::new(2.0, 2.0).is_err());
    }

    #[test]
    fn test_empty_input() {
        let report = backtest().run(&[]).unwrap();
        assert!(report.pair.is_none());
        assert_eq!(report.metrics.total_trades, 0);
    }
}
