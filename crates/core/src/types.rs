//! Core data types for the pairs pipeline.

use crate::error::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Timestamp in milliseconds since Unix epoch (UTC).
pub type TimestampMs = i64;

/// Size/quantity type.
pub type Size = f64;

/// Latest accepted tick timestamp, 9999-12-31T23:59:59.999Z.
pub const MAX_TIMESTAMP_MS: TimestampMs = 253_402_300_799_999;

/// Convert a millisecond timestamp to a UTC datetime.
#[inline]
pub fn ts_to_datetime(ts_ms: TimestampMs) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ts_ms).single()
}

/// Current wall-clock time in milliseconds.
#[inline]
pub fn now_ms() -> TimestampMs {
    Utc::now().timestamp_millis()
}

/// Fixed bar interval, stored in milliseconds.
///
/// Serialized as a compact string such as `"1s"`, `"1m"`, `"5m"` or `"1h"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timeframe(i64);

impl Timeframe {
    pub const ONE_SECOND: Timeframe = Timeframe(1_000);
    pub const ONE_MINUTE: Timeframe = Timeframe(60_000);
    pub const FIVE_MINUTES: Timeframe = Timeframe(300_000);

    /// Create a timeframe from a length in milliseconds.
    pub fn from_millis(ms: i64) -> Result<Self> {
        if ms <= 0 {
            return Err(Error::config(format!("timeframe must be positive, got {ms}ms")));
        }
        Ok(Timeframe(ms))
    }

    /// Length in milliseconds.
    #[inline]
    pub fn as_millis(self) -> i64 {
        self.0
    }

    /// Start of the interval containing `ts_ms`.
    ///
    /// Saturates at the ends of the `i64` range.
    #[inline]
    pub fn floor(self, ts_ms: TimestampMs) -> TimestampMs {
        ts_ms.div_euclid(self.0).saturating_mul(self.0)
    }

    /// Exclusive end of the interval opening at `open_time`.
    #[inline]
    pub fn end_of(self, open_time: TimestampMs) -> TimestampMs {
        open_time.saturating_add(self.0)
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [(i64, &str); 4] = [
            (86_400_000, "d"),
            (3_600_000, "h"),
            (60_000, "m"),
            (1_000, "s"),
        ];
        for (unit_ms, suffix) in UNITS {
            if self.0 % unit_ms == 0 {
                return write!(f, "{}{}", self.0 / unit_ms, suffix);
            }
        }
        write!(f, "{}ms", self.0)
    }
}

impl FromStr for Timeframe {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| Error::config(format!("timeframe '{s}' has no unit")))?;
        let (digits, unit) = s.split_at(split);
        let value: i64 = digits
            .parse()
            .map_err(|_| Error::config(format!("timeframe '{s}' has no numeric length")))?;
        let unit_ms = match unit {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            other => return Err(Error::config(format!("unknown timeframe unit '{other}'"))),
        };
        let ms = value
            .checked_mul(unit_ms)
            .ok_or_else(|| Error::config(format!("timeframe '{s}' overflows")))?;
        Timeframe::from_millis(ms)
    }
}

impl TryFrom<String> for Timeframe {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.to_string()
    }
}

/// A single trade print from the tick source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// Instrument symbol (e.g., "BTCUSDT").
    pub symbol: String,
    /// Timestamp in milliseconds.
    pub ts_ms: TimestampMs,
    /// Trade price.
    pub price: f64,
    /// Trade quantity.
    pub quantity: Size,
}

impl Tick {
    pub fn new(symbol: impl Into<String>, ts_ms: TimestampMs, price: f64, quantity: Size) -> Self {
        Self {
            symbol: symbol.into(),
            ts_ms,
            price,
            quantity,
        }
    }

    /// Price must be finite and positive, quantity finite and non-negative,
    /// and the timestamp within `0..=MAX_TIMESTAMP_MS`.
    #[inline]
    pub fn is_valid(&self) -> bool {
        (0..=MAX_TIMESTAMP_MS).contains(&self.ts_ms)
            && self.price.is_finite()
            && self.price > 0.0
            && self.quantity.is_finite()
            && self.quantity >= 0.0
    }

    /// Identity used for duplicate detection within one symbol.
    #[inline]
    pub fn key(&self) -> TickKey {
        TickKey {
            ts_ms: self.ts_ms,
            price: OrderedFloat(self.price),
            quantity: OrderedFloat(self.quantity),
        }
    }
}

/// Hashable `(timestamp, price, quantity)` identity of a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TickKey {
    pub ts_ms: TimestampMs,
    pub price: OrderedFloat<f64>,
    pub quantity: OrderedFloat<f64>,
}

/// Finalized OHLCV bar for one symbol and timeframe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Instrument symbol.
    pub symbol: String,
    /// Bar interval.
    pub timeframe: Timeframe,
    /// Interval start (inclusive), ms.
    pub open_time: TimestampMs,
    /// Open price.
    pub open: f64,
    /// High price.
    pub high: f64,
    /// Low price.
    pub low: f64,
    /// Close price.
    pub close: f64,
    /// Total volume.
    pub volume: Size,
    /// VWAP, `None` for zero-volume bars.
    pub vwap: Option<f64>,
    /// Number of ticks aggregated.
    pub trade_count: u32,
}

impl Bar {
    /// Exclusive end of the bar interval.
    #[inline]
    pub fn close_time(&self) -> TimestampMs {
        self.timeframe.end_of(self.open_time)
    }

    /// Whether this bar was synthesized for an interval without ticks.
    #[inline]
    pub fn is_gap_fill(&self) -> bool {
        self.trade_count == 0
    }

    /// OHLC ordering holds: low <= open, close <= high.
    pub fn is_consistent(&self) -> bool {
        self.low <= self.open
            && self.low <= self.close
            && self.high >= self.open
            && self.high >= self.close
            && self.low <= self.high
    }
}

/// Which side of a pair a symbol belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Leg {
    A,
    B,
}

/// Ordered symbol pair: spread is `A - hedge_ratio * B`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairId {
    pub leg_a: String,
    pub leg_b: String,
}

impl PairId {
    pub fn new(leg_a: impl Into<String>, leg_b: impl Into<String>) -> Self {
        Self {
            leg_a: leg_a.into(),
            leg_b: leg_b.into(),
        }
    }

    /// Leg the symbol plays in this pair, if any.
    pub fn leg_of(&self, symbol: &str) -> Option<Leg> {
        if self.leg_a == symbol {
            Some(Leg::A)
        } else if self.leg_b == symbol {
            Some(Leg::B)
        } else {
            None
        }
    }
}

impl fmt::Display for PairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.leg_a, self.leg_b)
    }
}

/// Augmented Dickey-Fuller test output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdfResult {
    /// Test statistic (t-ratio of the lagged level coefficient).
    pub statistic: f64,
    /// MacKinnon approximate p-value.
    pub p_value: f64,
    /// Number of lagged differences used.
    pub used_lag: usize,
    /// Observations in the test regression.
    pub n_obs: usize,
    pub critical_1pct: f64,
    pub critical_5pct: f64,
    pub critical_10pct: f64,
}

impl AdfResult {
    /// Unit root rejected at the given significance level.
    pub fn is_stationary(&self, significance: f64) -> bool {
        self.p_value < significance
    }
}

/// Analytics output for one aligned bar pair.
///
/// Every statistic is `None` while undefined (warm-up, zero variance,
/// numerical failure).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsSnapshot {
    pub pair: PairId,
    pub timeframe: Timeframe,
    /// Shared open time of the two bars.
    pub open_time: TimestampMs,
    pub close_a: f64,
    pub close_b: f64,
    /// Bar pairs in the rolling window.
    pub window_len: usize,
    pub hedge_ratio: Option<f64>,
    pub spread: Option<f64>,
    pub z_score: Option<f64>,
    pub correlation: Option<f64>,
    pub adf_stat: Option<f64>,
    pub adf_pvalue: Option<f64>,
    /// Open time of the bar at which the carried ADF result was scheduled.
    pub adf_computed_at: Option<TimestampMs>,
    /// Time the snapshot was produced (close of the bar interval).
    pub computed_at: TimestampMs,
}
