//! Backtest performance metrics.
//!
//! Calculates performance metrics from closed spread trades. P&L is in
//! spread points, so there is no capital base and no percentage returns.

use crate::position::ClosedTrade;
use serde::Serialize;

/// Backtest performance metrics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BacktestMetrics {
    /// Total number of closed trades.
    pub total_trades: u32,
    /// Trades with positive P&L.
    pub winning_trades: u32,
    /// Trades with negative P&L.
    pub losing_trades: u32,
    /// Win rate (0-1).
    pub win_rate: f64,
    /// Sum of trade P&L.
    pub total_pnl: f64,
    /// Mean trade P&L.
    pub avg_pnl: f64,
    /// Average winning trade P&L.
    pub avg_win: f64,
    /// Average losing trade P&L.
    pub avg_loss: f64,
    /// Profit factor (gross wins / gross losses).
    pub profit_factor: f64,
    /// Mean over sample std of trade P&L, scaled by √252.
    pub sharpe_ratio: f64,
    /// Largest peak-to-trough decline of cumulative P&L (positive number).
    pub max_drawdown: f64,
    /// Average holding time in milliseconds.
    pub avg_trade_duration_ms: f64,
    /// Largest winning trade.
    pub largest_win: f64,
    /// Largest losing trade.
    pub largest_loss: f64,
    /// Consecutive wins (max).
    pub max_consecutive_wins: u32,
    /// Consecutive losses (max).
    pub max_consecutive_losses: u32,
}

/// Cumulative P&L after a trade.
#[derive(Debug, Clone, Serialize)]
pub struct EquityPoint {
    pub ts_ms: i64,
    pub cumulative_pnl: f64,
    pub drawdown: f64,
}

/// Metrics calculator.
#[derive(Debug, Clone)]
pub struct MetricsCalculator {
    periods_per_year: f64,
}

impl Default for MetricsCalculator {
    fn default() -> Self {
        Self::new(252.0)
    }
}

impl MetricsCalculator {
    /// Create a calculator annualizing the Sharpe ratio over `periods_per_year` trades.
    pub fn new(periods_per_year: f64) -> Self {
        Self { periods_per_year }
    }

    /// Calculate metrics from closed trades.
    pub fn calculate(&self, trades: &[ClosedTrade]) -> BacktestMetrics {
        if trades.is_empty() {
            return BacktestMetrics::default();
        }

        let mut metrics = BacktestMetrics {
            total_trades: trades.len() as u32,
            ..Default::default()
        };

        let mut gross_wins = 0.0;
        let mut gross_losses = 0.0;
        let mut total_duration = 0i64;

        // Consecutive tracking
        let mut current_wins = 0u32;
        let mut current_losses = 0u32;

        for trade in trades {
            metrics.total_pnl += trade.pnl;
            total_duration += trade.duration_ms();

            if trade.pnl > 0.0 {
                metrics.winning_trades += 1;
                gross_wins += trade.pnl;
                metrics.largest_win = metrics.largest_win.max(trade.pnl);

                current_wins += 1;
                current_losses = 0;
                metrics.max_consecutive_wins = metrics.max_consecutive_wins.max(current_wins);
            } else if trade.pnl < 0.0 {
                metrics.losing_trades += 1;
                gross_losses += trade.pnl.abs();
                metrics.largest_loss = metrics.largest_loss.min(trade.pnl);

                current_losses += 1;
                current_wins = 0;
                metrics.max_consecutive_losses = metrics.max_consecutive_losses.max(current_losses);
            } else {
                current_wins = 0;
                current_losses = 0;
            }
        }

        let n = metrics.total_trades as f64;
        metrics.win_rate = metrics.winning_trades as f64 / n;
        metrics.avg_pnl = metrics.total_pnl / n;
        metrics.avg_trade_duration_ms = total_duration as f64 / n;

        metrics.avg_win = if metrics.winning_trades > 0 {
            gross_wins / metrics.winning_trades as f64
        } else {
            0.0
        };

        metrics.avg_loss = if metrics.losing_trades > 0 {
            -gross_losses / metrics.losing_trades as f64
        } else {
            0.0
        };

        metrics.profit_factor = if gross_losses > 0.0 {
            gross_wins / gross_losses
        } else if gross_wins > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        metrics.max_drawdown = self
            .build_equity_curve(trades)
            .iter()
            .map(|p| p.drawdown)
            .fold(0.0, f64::max);

        let pnls: Vec<f64> = trades.iter().map(|t| t.pnl).collect();
        metrics.sharpe_ratio = self.calculate_sharpe(&pnls);

        metrics
    }

    /// Build the cumulative P&L curve, starting flat.
    pub fn build_equity_curve(&self, trades: &[ClosedTrade]) -> Vec<EquityPoint> {
        let mut curve = Vec::with_capacity(trades.len());
        let mut cumulative = 0.0;
        let mut peak = 0.0_f64;

        for trade in trades {
            cumulative += trade.pnl;
            peak = peak.max(cumulative);
            curve.push(EquityPoint {
                ts_ms: trade.exit_time,
                cumulative_pnl: cumulative,
                drawdown: peak - cumulative,
            });
        }

        curve
    }

    /// Calculate Sharpe ratio from per-trade P&L.
    fn calculate_sharpe(&self, pnls: &[f64]) -> f64 {
        if pnls.len() < 2 {
            return 0.0;
        }

        let n = pnls.len() as f64;
        let mean = pnls.iter().sum::<f64>() / n;
        let variance = pnls.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
        let std_dev = variance.sqrt();

        if std_dev > 0.0 {
            mean / std_dev * self.periods_per_year.sqrt()
        } else {
            0.0
        }
    }
}
