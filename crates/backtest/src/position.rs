//! Spread position tracking for backtesting.

use pairs_core::TimestampMs;
use serde::Serialize;

/// Direction of a spread position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpreadSide {
    /// Long A, short β·B; profits when the spread rises.
    Long,
    /// Short A, long β·B; profits when the spread falls.
    Short,
}

impl SpreadSide {
    #[inline]
    pub fn sign(self) -> f64 {
        match self {
            SpreadSide::Long => 1.0,
            SpreadSide::Short => -1.0,
        }
    }
}

/// An open spread position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpreadPosition {
    pub side: SpreadSide,
    /// Open time of the entry bar.
    pub entry_time: TimestampMs,
    pub entry_spread: f64,
    pub entry_z: f64,
}

impl SpreadPosition {
    /// P&L in spread points if closed at `spread`.
    pub fn unrealized_pnl(&self, spread: f64) -> f64 {
        self.side.sign() * (spread - self.entry_spread)
    }

    /// Whether the z-score has reverted past `exit_z`.
    pub fn should_exit(&self, z: f64, exit_z: f64) -> bool {
        match self.side {
            SpreadSide::Long => z >= exit_z,
            SpreadSide::Short => z <= exit_z,
        }
    }

    /// Close at the given bar.
    pub fn close(self, exit_time: TimestampMs, exit_spread: f64, exit_z: f64) -> ClosedTrade {
        ClosedTrade {
            pnl: self.unrealized_pnl(exit_spread),
            side: self.side,
            entry_time: self.entry_time,
            exit_time,
            entry_spread: self.entry_spread,
            exit_spread,
            entry_z: self.entry_z,
            exit_z,
        }
    }
}

/// Closed trade record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClosedTrade {
    pub side: SpreadSide,
    pub entry_time: TimestampMs,
    pub exit_time: TimestampMs,
    pub entry_spread: f64,
    pub exit_spread: f64,
    pub entry_z: f64,
    pub exit_z: f64,
    /// Realized P&L in spread points.
    pub pnl: f64,
}

impl ClosedTrade {
    /// Holding time in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        self.exit_time - self.entry_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_long_and_short_pnl() {
        let long = SpreadPosition {
            side: SpreadSide::Long,
            entry_time: 0,
            entry_spread: -3.0,
            entry_z: -2.5,
        };
        assert!((long.unrealized_pnl(1.0) - 4.0).abs() < 1e-12);

        let short = SpreadPosition {
            side: SpreadSide::Short,
            ..long.clone()
        };
        assert!((short.unrealized_pnl(1.0) + 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_exit_rule() {
        let long = SpreadPosition {
            side: SpreadSide::Long,
            entry_time: 0,
            entry_spread: 0.0,
            entry_z: -2.5,
        };
        assert!(!long.should_exit(-0.5, 0.0));
        assert!(long.should_exit(0.0, 0.0));

        let short = SpreadPosition {
            side: SpreadSide::Short,
            entry_z: 2.5,
            ..long
        };
        assert!(!short.should_exit(0.5, 0.0));
        assert!(short.should_exit(-0.1, 0.0));
    }

    #[test]
    fn test_close_records_trade() {
        let pos = SpreadPosition {
            side: SpreadSide::Short,
            entry_time: 60_000,
            entry_spread: 10.0,
            entry_z: 2.2,
        };
        let trade = pos.close(300_000, 7.5, -0.1);
        assert!((trade.pnl - 2.5).abs() < 1e-12);
        assert_eq!(trade.duration_ms(), 240_000);
    }
}
