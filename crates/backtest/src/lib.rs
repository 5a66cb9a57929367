//! Backtesting for spread mean-reversion.
//!
//! This crate provides:
//! - Z-score entry/exit simulation over analytics snapshots
//! - Spread position tracking and P&L in spread points
//! - Performance metrics

pub mod metrics;
pub mod position;
pub mod simulator;

pub use metrics::{BacktestMetrics, EquityPoint, MetricsCalculator};
pub use position::{ClosedTrade, SpreadPosition, SpreadSide};
pub use simulator::{BacktestReport, MeanReversionBacktest, OpenPositionMark};
