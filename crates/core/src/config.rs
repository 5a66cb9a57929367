//! Configuration structures for the pairs pipeline.
//!
//! Every section has a `Default` so a JSON file only needs to name the
//! values it overrides.

use crate::error::{Error, Result};
use crate::types::{PairId, Timeframe};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Main configuration for the pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Symbols, timeframes and resampling policy.
    pub market: MarketConfig,
    /// Pairs to analyse.
    pub pairs: Vec<PairConfig>,
    /// Rolling analytics configuration.
    pub analytics: AnalyticsConfig,
    /// Stationarity test configuration.
    pub stationarity: StationarityConfig,
    /// Alert rules.
    pub alerts: AlertConfig,
    /// Channel sizing and clocking of the runtime.
    pub pipeline: PipelineConfig,
    /// Tick persistence.
    pub storage: StorageConfig,
    /// Mean-reversion backtest thresholds.
    pub backtest: BacktestConfig,
}

impl Config {
    /// Parse a configuration from JSON text.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    /// Effective rolling window for a pair.
    pub fn window_size(&self, pair: &PairConfig) -> usize {
        pair.window_size.unwrap_or(self.analytics.window_size)
    }

    /// Effective warm-up length for a window of `window_size`.
    pub fn min_periods(&self, window_size: usize) -> usize {
        self.analytics.min_periods.unwrap_or(window_size).min(window_size)
    }

    /// Check cross-field invariants.
    pub fn validate(&self) -> Result<()> {
        let market = &self.market;
        if market.symbols.is_empty() {
            return Err(Error::config("market.symbols must not be empty"));
        }
        let mut seen = HashSet::new();
        for symbol in &market.symbols {
            if symbol.trim().is_empty() {
                return Err(Error::config("market.symbols contains an empty symbol"));
            }
            if !seen.insert(symbol.as_str()) {
                return Err(Error::config(format!("duplicate symbol '{symbol}'")));
            }
        }

        if market.max_dedup_keys == 0 {
            return Err(Error::config("market.max_dedup_keys must be positive"));
        }

        if market.timeframes.is_empty() {
            return Err(Error::config("market.timeframes must not be empty"));
        }
        let timeframes: HashSet<Timeframe> = market.timeframes.iter().copied().collect();
        if timeframes.len() != market.timeframes.len() {
            return Err(Error::config("market.timeframes contains duplicates"));
        }

        let mut pair_slots = HashSet::new();
        for pair in &self.pairs {
            if pair.leg_a == pair.leg_b {
                return Err(Error::config(format!("pair {} uses the same symbol twice", pair.pair_id())));
            }
            for leg in [&pair.leg_a, &pair.leg_b] {
                if !seen.contains(leg.as_str()) {
                    return Err(Error::config(format!(
                        "pair {} references unknown symbol '{leg}'",
                        pair.pair_id()
                    )));
                }
            }
            if !timeframes.contains(&pair.timeframe) {
                return Err(Error::config(format!(
                    "pair {} uses timeframe {} which is not in market.timeframes",
                    pair.pair_id(),
                    pair.timeframe
                )));
            }
            if !pair_slots.insert((pair.pair_id(), pair.timeframe)) {
                return Err(Error::config(format!(
                    "pair {} @ {} configured twice",
                    pair.pair_id(),
                    pair.timeframe
                )));
            }

            let window = self.window_size(pair);
            if window < 2 {
                return Err(Error::config(format!(
                    "pair {} window_size must be >= 2, got {window}",
                    pair.pair_id()
                )));
            }
            if let Some(min) = self.analytics.min_periods {
                if min < 2 || min > window {
                    return Err(Error::config(format!(
                        "analytics.min_periods must lie in [2, {window}] for pair {}, got {min}",
                        pair.pair_id()
                    )));
                }
            }
            if self.stationarity.enabled && window < self.stationarity.max_lag * 2 + 6 {
                return Err(Error::config(format!(
                    "pair {} window {window} is too short for an ADF test with max_lag {}",
                    pair.pair_id(),
                    self.stationarity.max_lag
                )));
            }
        }

        if self.analytics.max_pending_bars == 0 {
            return Err(Error::config("analytics.max_pending_bars must be positive"));
        }
        let kalman = &self.analytics.kalman;
        if !(kalman.delta > 0.0 && kalman.delta < 1.0) {
            return Err(Error::config("analytics.kalman.delta must lie in (0, 1)"));
        }
        if kalman.observation_cov <= 0.0 {
            return Err(Error::config("analytics.kalman.observation_cov must be positive"));
        }
        if self.stationarity.every_n_bars == 0 {
            return Err(Error::config("stationarity.every_n_bars must be >= 1"));
        }

        let p = &self.pipeline;
        if p.tick_channel_capacity == 0
            || p.bar_channel_capacity == 0
            || p.snapshot_channel_capacity == 0
            || p.alert_channel_capacity == 0
            || p.store_channel_capacity == 0
            || p.store_batch_size == 0
        {
            return Err(Error::config("pipeline channel capacities must be positive"));
        }
        if p.wall_clock_interval_ms <= 0 {
            return Err(Error::config("pipeline.wall_clock_interval_ms must be positive"));
        }

        if self.alerts.cooldown_ms < 0 {
            return Err(Error::config("alerts.cooldown_ms must not be negative"));
        }
        let mut rule_ids = HashSet::new();
        for rule in &self.alerts.rules {
            if !rule_ids.insert(rule.id.as_str()) {
                return Err(Error::config(format!("duplicate alert id '{}'", rule.id)));
            }
            if !pair_slots.contains(&(rule.pair_id(), rule.timeframe)) {
                return Err(Error::config(format!(
                    "alert '{}' references {} @ {} which is not a configured pair",
                    rule.id,
                    rule.pair_id(),
                    rule.timeframe
                )));
            }
        }

        if self.backtest.entry_z <= 0.0 || self.backtest.exit_z.abs() >= self.backtest.entry_z {
            return Err(Error::config("backtest requires entry_z > 0 and |exit_z| < entry_z"));
        }

        Ok(())
    }
}

/// What to emit for an interval in which no tick arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapPolicy {
    /// Emit nothing.
    #[default]
    Sparse,
    /// Emit a zero-volume bar carrying the prior close.
    FillForward,
}

/// What drives bar finalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockMode {
    /// Tick timestamps advance time.
    #[default]
    EventTime,
    /// A wall-clock timer advances time (tick timestamps still roll bars forward).
    WallClock,
}

/// Market data configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    /// Symbols to resample.
    pub symbols: Vec<String>,
    /// Bar timeframes produced for every symbol.
    pub timeframes: Vec<Timeframe>,
    /// Empty-interval policy.
    pub gap_policy: GapPolicy,
    /// Longest run of gap-fill bars; longer gaps stay sparse.
    pub max_gap_fill_bars: u32,
    /// Time source for finalization.
    pub clock: ClockMode,
    /// Tick identities remembered per symbol for duplicate detection.
    pub max_dedup_keys: usize,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            symbols: vec![
                "BTCUSDT".to_string(),
                "ETHUSDT".to_string(),
                "BNBUSDT".to_string(),
                "SOLUSDT".to_string(),
            ],
            timeframes: vec![Timeframe::ONE_SECOND, Timeframe::ONE_MINUTE, Timeframe::FIVE_MINUTES],
            gap_policy: GapPolicy::Sparse,
            max_gap_fill_bars: 60,
            clock: ClockMode::EventTime,
            max_dedup_keys: 1_000_000,
        }
    }
}

/// One analysed pair at one timeframe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairConfig {
    /// Dependent leg (regressand).
    pub leg_a: String,
    /// Independent leg (regressor).
    pub leg_b: String,
    /// Bar timeframe used for alignment.
    pub timeframe: Timeframe,
    /// Overrides `analytics.window_size`.
    #[serde(default)]
    pub window_size: Option<usize>,
}

impl PairConfig {
    pub fn pair_id(&self) -> PairId {
        PairId::new(&self.leg_a, &self.leg_b)
    }
}

/// Hedge ratio estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HedgeMode {
    /// Static OLS slope over the window, recomputed per bar.
    #[default]
    Ols,
    /// Median of pairwise slopes over the window; resists outlier bars.
    TheilSen,
    /// Recursive Kalman filter on (slope, intercept).
    Kalman,
}

/// Kalman filter tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KalmanConfig {
    /// State drift; transition covariance is `delta / (1 - delta) * I`.
    pub delta: f64,
    /// Observation noise variance.
    pub observation_cov: f64,
}

impl Default for KalmanConfig {
    fn default() -> Self {
        Self {
            delta: 1e-5,
            observation_cov: 1.0,
        }
    }
}

/// Rolling analytics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    /// Bar pairs kept in the rolling window.
    pub window_size: usize,
    /// Bar pairs required before statistics are defined (defaults to window_size).
    pub min_periods: Option<usize>,
    /// Hedge ratio estimator.
    pub hedge_mode: HedgeMode,
    /// Kalman parameters (adaptive mode only).
    pub kalman: KalmanConfig,
    /// Bars buffered per leg while waiting for the other leg.
    pub max_pending_bars: usize,
    /// Relative variance below which a series counts as constant.
    pub variance_epsilon: f64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            window_size: 50,
            min_periods: None,
            hedge_mode: HedgeMode::Ols,
            kalman: KalmanConfig::default(),
            max_pending_bars: 256,
            variance_epsilon: 1e-12,
        }
    }
}

/// Augmented Dickey-Fuller test configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StationarityConfig {
    /// Whether to schedule ADF tests at all.
    pub enabled: bool,
    /// Run the test once every N aligned bars.
    pub every_n_bars: u32,
    /// Maximum lagged differences in the test regression.
    pub max_lag: usize,
    /// Select the lag by AIC in `0..=max_lag` instead of using `max_lag`.
    pub autolag: bool,
}

impl Default for StationarityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            every_n_bars: 10,
            max_lag: 1,
            autolag: true,
        }
    }
}

/// Snapshot field an alert compares against its threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCondition {
    ZScoreAbove,
    ZScoreBelow,
    ZScoreAbsAbove,
    SpreadAbove,
    SpreadBelow,
    CorrelationBelow,
    AdfPValueBelow,
}

/// A single alert rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRuleConfig {
    pub id: String,
    pub leg_a: String,
    pub leg_b: String,
    pub timeframe: Timeframe,
    pub condition: AlertCondition,
    pub threshold: f64,
}

impl AlertRuleConfig {
    pub fn pair_id(&self) -> PairId {
        PairId::new(&self.leg_a, &self.leg_b)
    }
}

/// Alert evaluation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Minimum time between two triggers of the same rule (event time, ms).
    pub cooldown_ms: i64,
    /// Triggered alerts kept in history.
    pub history_limit: usize,
    pub rules: Vec<AlertRuleConfig>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: 60_000,
            history_limit: 1_000,
            rules: Vec::new(),
        }
    }
}

/// Runtime sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Per-symbol tick queue.
    pub tick_channel_capacity: usize,
    /// Finalized bar broadcast buffer.
    pub bar_channel_capacity: usize,
    /// Snapshot broadcast buffer.
    pub snapshot_channel_capacity: usize,
    /// Alert broadcast buffer.
    pub alert_channel_capacity: usize,
    /// Tick store queue.
    pub store_channel_capacity: usize,
    /// Ticks written per store transaction.
    pub store_batch_size: usize,
    /// Timer period in wall-clock mode.
    pub wall_clock_interval_ms: i64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tick_channel_capacity: 10_000,
            bar_channel_capacity: 4_096,
            snapshot_channel_capacity: 1_024,
            alert_channel_capacity: 256,
            store_channel_capacity: 50_000,
            store_batch_size: 500,
            wall_clock_interval_ms: 250,
        }
    }
}

/// Tick persistence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database path; persistence is off when unset.
    pub db_path: Option<PathBuf>,
    /// Ticks older than this (relative to the newest stored tick) are pruned.
    pub retention_ms: Option<i64>,
}

/// Mean-reversion backtest thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    /// Enter when |z| exceeds this.
    pub entry_z: f64,
    /// Exit when z crosses this level back toward the mean.
    pub exit_z: f64,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            entry_z: 2.0,
            exit_z: 0.0,
        }
    }
}
