//! Per-pair rolling analytics engine.
//!
//! Combines the rolling window, hedge ratio estimators and deferred
//! stationarity testing into one snapshot per aligned bar pair.

use crate::{
    kalman::KalmanHedgeRatio,
    regression::{correlation, is_negligible, ols_fit, spread_moments, theil_sen_slope},
    stationarity::{StationarityJob, StationarityOutcome},
    window::{RollingPairWindow, RollingStats},
};
use pairs_core::{
    config::{HedgeMode, KalmanConfig, PairConfig, StationarityConfig},
    AdfResult, AnalyticsSnapshot, Bar, Config, Error, PairId, Result, Timeframe, TimestampMs,
};
use tracing::debug;

/// Tuning for one engine.
#[derive(Debug, Clone)]
pub struct EngineParams {
    pub window_size: usize,
    pub min_periods: usize,
    pub hedge_mode: HedgeMode,
    pub kalman: KalmanConfig,
    pub variance_epsilon: f64,
    pub stationarity: StationarityConfig,
}

impl EngineParams {
    /// Resolve the effective parameters of a configured pair.
    pub fn from_config(config: &Config, pair: &PairConfig) -> Self {
        let window_size = config.window_size(pair);
        Self {
            window_size,
            min_periods: config.min_periods(window_size),
            hedge_mode: config.analytics.hedge_mode,
            kalman: config.analytics.kalman.clone(),
            variance_epsilon: config.analytics.variance_epsilon,
            stationarity: config.stationarity.clone(),
        }
    }
}

/// Rolling analytics for one pair at one timeframe.
pub struct AnalyticsEngine {
    pair: PairId,
    timeframe: Timeframe,
    params: EngineParams,
    window: RollingPairWindow,
    /// Adaptive mode only.
    kalman: Option<KalmanHedgeRatio>,
    /// Adaptive mode: spreads recorded with the slope current at each bar.
    kalman_spreads: RollingStats,
    last_open_time: Option<TimestampMs>,
    /// Ready bars since the last scheduled stationarity job.
    bars_since_adf: u32,
    next_seq: u64,
    pending_job: Option<StationarityJob>,
    last_applied_seq: Option<u64>,
    adf: Option<AdfResult>,
    adf_computed_at: Option<TimestampMs>,
}

impl AnalyticsEngine {
    /// Create a new analytics engine.
    pub fn new(pair: PairId, timeframe: Timeframe, params: EngineParams) -> Self {
        let min_periods = params.min_periods.clamp(2, params.window_size.max(2));
        let params = EngineParams { min_periods, ..params };
        let kalman = (params.hedge_mode == HedgeMode::Kalman).then(|| KalmanHedgeRatio::new(&params.kalman));
        Self {
            pair,
            timeframe,
            window: RollingPairWindow::new(params.window_size),
            kalman,
            kalman_spreads: RollingStats::new(params.window_size),
            params,
            last_open_time: None,
            bars_since_adf: 0,
            next_seq: 0,
            pending_job: None,
            last_applied_seq: None,
            adf: None,
            adf_computed_at: None,
        }
    }

    /// Create an engine for a configured pair.
    pub fn from_config(config: &Config, pair: &PairConfig) -> Self {
        Self::new(pair.pair_id(), pair.timeframe, EngineParams::from_config(config, pair))
    }

    pub fn pair(&self) -> &PairId {
        &self.pair
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    /// Bar pairs currently in the window.
    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// Whether statistics are defined (window holds `min_periods` pairs).
    pub fn is_ready(&self) -> bool {
        self.window.len() >= self.params.min_periods
    }

    /// Last applied stationarity result.
    pub fn latest_adf(&self) -> Option<&AdfResult> {
        self.adf.as_ref()
    }

    /// Absorb one aligned bar pair and produce its snapshot.
    ///
    /// Bars that do not describe this pair's next interval are rejected
    /// without touching state.
    pub fn on_bar_pair(&mut self, bar_a: &Bar, bar_b: &Bar) -> Result<AnalyticsSnapshot> {
        self.check_alignment(bar_a, bar_b)?;
        let (a, b) = (bar_a.close, bar_b.close);
        if !(a.is_finite() && b.is_finite()) {
            return Err(Error::data(format!("{} @ {}: non-finite close", self.pair, bar_a.open_time)));
        }

        self.window.push(a, b);
        self.last_open_time = Some(bar_a.open_time);
        let ready = self.is_ready();
        let eps = self.params.variance_epsilon;
        let moments = self.window.moments();

        let correlation = match (ready, moments.as_ref()) {
            (true, Some(m)) => correlation(m, eps),
            _ => None,
        };

        // Static estimators share the OLS degeneracy check on the regressor.
        let static_fit = match self.params.hedge_mode {
            HedgeMode::Kalman => None,
            mode => moments.as_ref().filter(|_| ready).and_then(|m| {
                let ols = ols_fit(m, eps)?;
                let beta = match mode {
                    HedgeMode::TheilSen => theil_sen_slope(self.window.iter())?,
                    _ => ols.slope,
                };
                Some((m, beta))
            }),
        };

        let (hedge_ratio, z_score) = match self.kalman.as_mut() {
            None => match static_fit {
                Some((m, beta)) => {
                    let (mean, var) = spread_moments(m, beta);
                    let scale = m.var_a + beta * beta * m.var_b;
                    let z = if is_negligible(var, scale, eps) {
                        debug!(pair = %self.pair, "spread variance negligible, z-score undefined");
                        None
                    } else {
                        Some((a - beta * b - mean) / var.sqrt())
                    };
                    (Some(beta), z)
                }
                None => (None, None),
            },
            Some(kalman) => match kalman.update(a, b) {
                Some(beta) => {
                    let spread = a - beta * b;
                    self.kalman_spreads.push(spread);
                    let z = if ready && self.kalman_spreads.len() >= self.params.min_periods {
                        match (self.kalman_spreads.mean(), self.kalman_spreads.variance()) {
                            (Some(mean), Some(var)) if !is_negligible(var, mean * mean, eps) => {
                                Some((spread - mean) / var.sqrt())
                            }
                            _ => None,
                        }
                    } else {
                        None
                    };
                    (ready.then_some(beta), z)
                }
                None => {
                    self.kalman_spreads.clear();
                    (None, None)
                }
            },
        };
        let spread = hedge_ratio.map(|beta| a - beta * b);
        let z_score = z_score.filter(|z| z.is_finite());

        if let Some(beta) = hedge_ratio {
            self.maybe_schedule_stationarity(beta, bar_a.open_time);
        }

        Ok(AnalyticsSnapshot {
            pair: self.pair.clone(),
            timeframe: self.timeframe,
            open_time: bar_a.open_time,
            close_a: a,
            close_b: b,
            window_len: self.window.len(),
            hedge_ratio,
            spread,
            z_score,
            correlation,
            adf_stat: self.adf.as_ref().map(|r| r.statistic),
            adf_pvalue: self.adf.as_ref().map(|r| r.p_value),
            adf_computed_at: self.adf_computed_at,
            computed_at: bar_a.close_time(),
        })
    }

    fn check_alignment(&self, bar_a: &Bar, bar_b: &Bar) -> Result<()> {
        if bar_a.symbol != self.pair.leg_a || bar_b.symbol != self.pair.leg_b {
            return Err(Error::misaligned(format!(
                "expected {}, got {}/{}",
                self.pair, bar_a.symbol, bar_b.symbol
            )));
        }
        if bar_a.timeframe != self.timeframe || bar_b.timeframe != self.timeframe {
            return Err(Error::misaligned(format!(
                "{}: expected timeframe {}, got {}/{}",
                self.pair, self.timeframe, bar_a.timeframe, bar_b.timeframe
            )));
        }
        if bar_a.open_time != bar_b.open_time {
            return Err(Error::misaligned(format!(
                "{}: open times differ ({} vs {})",
                self.pair, bar_a.open_time, bar_b.open_time
            )));
        }
        if let Some(last) = self.last_open_time {
            if bar_a.open_time <= last {
                return Err(Error::misaligned(format!(
                    "{}: open time {} not after {last}",
                    self.pair, bar_a.open_time
                )));
            }
        }
        Ok(())
    }

    /// Queue a job on the first ready bar and then every `every_n_bars`.
    fn maybe_schedule_stationarity(&mut self, beta: f64, open_time: TimestampMs) {
        let cfg = &self.params.stationarity;
        if !cfg.enabled {
            return;
        }
        let due = self.bars_since_adf == 0;
        self.bars_since_adf = (self.bars_since_adf + 1) % cfg.every_n_bars.max(1);
        if !due {
            return;
        }

        let spread: Vec<f64> = match self.kalman {
            Some(_) => self.kalman_spreads.values().collect(),
            None => self.window.iter().map(|&(a, b)| a - beta * b).collect(),
        };
        let job = StationarityJob {
            seq: self.next_seq,
            spread,
            max_lag: cfg.max_lag,
            autolag: cfg.autolag,
            scheduled_at: open_time,
        };
        self.next_seq += 1;
        if let Some(replaced) = self.pending_job.replace(job) {
            debug!(pair = %self.pair, seq = replaced.seq, "stationarity job superseded before pickup");
        }
    }

    /// Hand out the pending stationarity job, if any.
    pub fn take_stationarity_job(&mut self) -> Option<StationarityJob> {
        self.pending_job.take()
    }

    /// Apply a finished job. Outcomes older than the last applied one are
    /// ignored; returns whether it was applied.
    pub fn apply_stationarity(&mut self, outcome: StationarityOutcome) -> bool {
        if self.last_applied_seq.is_some_and(|seq| outcome.seq <= seq) {
            debug!(pair = %self.pair, seq = outcome.seq, "stale stationarity outcome ignored");
            return false;
        }
        self.last_applied_seq = Some(outcome.seq);
        self.adf = outcome.result;
        self.adf_computed_at = Some(outcome.scheduled_at);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn params(window_size: usize) -> EngineParams {
        EngineParams {
            window_size,
            min_periods: window_size,
            hedge_mode: HedgeMode::Ols,
            kalman: KalmanConfig::default(),
            variance_epsilon: 1e-12,
            stationarity: StationarityConfig {
                every_n_bars: 5,
                ..StationarityConfig::default()
            },
        }
    }

    fn engine(window_size: usize) -> AnalyticsEngine {
        AnalyticsEngine::new(PairId::new("BTCUSDT", "ETHUSDT"), Timeframe::ONE_MINUTE, params(window_size))
    }

    fn bar(symbol: &str, open_time: TimestampMs, close: f64) -> Bar {
        Bar {
            symbol: symbol.to_string(),
            timeframe: Timeframe::ONE_MINUTE,
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

    /// Deterministic closes with a noisy linear relation a ≈ 15 * b.
    fn closes(i: i64) -> (f64, f64) {
        let t = i as f64;
        let b = 3_000.0 + 20.0 * (t * 0.3).sin() + 0.7 * t;
        let noise = ((i * 37 % 11) as f64 - 5.0) * 2.0;
        (15.0 * b + 1_000.0 + noise, b)
    }

    fn feed(engine: &mut AnalyticsEngine, i: i64) -> AnalyticsSnapshot {
        let (a, b) = closes(i);
        let t = i * 60_000;
        engine.on_bar_pair(&bar("BTCUSDT", t, a), &bar("ETHUSDT", t, b)).unwrap()
    }

    #[test]
    fn test_undefined_until_window_full() {
        let mut e = engine(20);
        for i in 0..19 {
            let snap = feed(&mut e, i);
            assert!(snap.hedge_ratio.is_none());
            assert!(snap.spread.is_none());
            assert!(snap.z_score.is_none());
            assert!(snap.correlation.is_none());
        }
        let snap = feed(&mut e, 19);
        assert_eq!(snap.window_len, 20);
        assert!(snap.hedge_ratio.is_some());
        assert!(snap.spread.is_some());
        assert!(snap.z_score.is_some());
        assert!(snap.correlation.unwrap() > 0.99);
        assert_relative_eq!(snap.hedge_ratio.unwrap(), 15.0, epsilon = 0.2);
    }

    #[test]
    fn test_window_never_exceeds_size() {
        let mut e = engine(20);
        for i in 0..45 {
            let snap = feed(&mut e, i);
            assert!(snap.window_len <= 20);
        }
        assert_eq!(e.window_len(), 20);
    }

    #[test]
    fn test_statistics_match_direct_computation() {
        let mut e = engine(20);
        let mut last = None;
        for i in 0..30 {
            last = Some(feed(&mut e, i));
        }
        let snap = last.unwrap();

        // Only the last 20 pairs count.
        let pts: Vec<_> = (10..30).map(closes).collect();
        let n = pts.len() as f64;
        let ma = pts.iter().map(|p| p.0).sum::<f64>() / n;
        let mb = pts.iter().map(|p| p.1).sum::<f64>() / n;
        let cov = pts.iter().map(|p| (p.0 - ma) * (p.1 - mb)).sum::<f64>();
        let vb = pts.iter().map(|p| (p.1 - mb).powi(2)).sum::<f64>();
        let beta = cov / vb;
        let spreads: Vec<f64> = pts.iter().map(|p| p.0 - beta * p.1).collect();
        let ms = spreads.iter().sum::<f64>() / n;
        let sd = (spreads.iter().map(|s| (s - ms).powi(2)).sum::<f64>() / (n - 1.0)).sqrt();
        let z = (spreads[19] - ms) / sd;

        assert_relative_eq!(snap.hedge_ratio.unwrap(), beta, max_relative = 1e-8);
        assert_relative_eq!(snap.spread.unwrap(), spreads[19], max_relative = 1e-6);
        assert_relative_eq!(snap.z_score.unwrap(), z, max_relative = 1e-6);
    }

    #[test]
    fn test_identical_prices_are_undefined_not_errors() {
        let mut e = engine(20);
        for i in 0..25 {
            let t = i * 60_000;
            let snap = e.on_bar_pair(&bar("BTCUSDT", t, 60_000.0), &bar("ETHUSDT", t, 3_000.0)).unwrap();
            assert!(snap.correlation.is_none());
            assert!(snap.z_score.is_none());
            assert!(snap.hedge_ratio.is_none());
        }
    }

    #[test]
    fn test_misaligned_bars_rejected_without_state_change() {
        let mut e = engine(20);
        feed(&mut e, 0);

        let err = e.on_bar_pair(&bar("BTCUSDT", 60_000, 1.0), &bar("ETHUSDT", 120_000, 1.0));
        assert!(matches!(err, Err(Error::Misaligned(_))));
        let err = e.on_bar_pair(&bar("ETHUSDT", 60_000, 1.0), &bar("BTCUSDT", 60_000, 1.0));
        assert!(matches!(err, Err(Error::Misaligned(_))));
        // Not after the last accepted open time.
        let err = e.on_bar_pair(&bar("BTCUSDT", 0, 1.0), &bar("ETHUSDT", 0, 1.0));
        assert!(matches!(err, Err(Error::Misaligned(_))));
        assert_eq!(e.window_len(), 1);

        assert!(e.on_bar_pair(&bar("BTCUSDT", 60_000, 1.0), &bar("ETHUSDT", 60_000, 1.0)).is_ok());
    }

    #[test]
    fn test_stationarity_cadence_and_carry() {
        let mut e = engine(20);
        for i in 0..19 {
            feed(&mut e, i);
            assert!(e.take_stationarity_job().is_none());
        }
        feed(&mut e, 19);
        let job = e.take_stationarity_job().unwrap();
        assert_eq!(job.seq, 0);
        assert_eq!(job.spread.len(), 20);
        assert_eq!(job.scheduled_at, 19 * 60_000);

        // Next job only after every_n_bars more bars.
        for i in 20..24 {
            feed(&mut e, i);
            assert!(e.take_stationarity_job().is_none());
        }
        feed(&mut e, 24);
        let newer = e.take_stationarity_job().unwrap();
        assert_eq!(newer.seq, 1);

        assert!(e.apply_stationarity(newer.run()));
        let carried = feed(&mut e, 25);
        assert_eq!(carried.adf_computed_at, Some(24 * 60_000));
        assert_eq!(carried.adf_pvalue, e.latest_adf().map(|r| r.p_value));

        // The older job finishing late does not overwrite.
        assert!(!e.apply_stationarity(job.run()));
        assert_eq!(feed(&mut e, 26).adf_computed_at, Some(24 * 60_000));
    }

    #[test]
    fn test_pending_job_replaced_by_newer() {
        let mut e = engine(20);
        for i in 0..30 {
            feed(&mut e, i);
        }
        // Jobs were due at 19, 24 and 29; only the latest is pending.
        let job = e.take_stationarity_job().unwrap();
        assert_eq!(job.seq, 2);
        assert!(e.take_stationarity_job().is_none());
    }

    #[test]
    fn test_theil_sen_mode() {
        let mut p = params(20);
        p.hedge_mode = HedgeMode::TheilSen;
        let mut e = AnalyticsEngine::new(PairId::new("BTCUSDT", "ETHUSDT"), Timeframe::ONE_MINUTE, p);
        let mut last = None;
        for i in 0..30 {
            let snap = feed(&mut e, i);
            if i < 19 {
                assert!(snap.hedge_ratio.is_none());
            }
            last = Some(snap);
        }
        let snap = last.unwrap();

        let pts: Vec<_> = (10..30).map(closes).collect();
        let beta = theil_sen_slope(&pts).unwrap();
        assert_eq!(snap.hedge_ratio, Some(beta));
        assert_relative_eq!(beta, 15.0, epsilon = 0.5);
        assert_relative_eq!(snap.spread.unwrap(), pts[19].0 - beta * pts[19].1);

        let spreads: Vec<f64> = pts.iter().map(|p| p.0 - beta * p.1).collect();
        let n = spreads.len() as f64;
        let ms = spreads.iter().sum::<f64>() / n;
        let sd = (spreads.iter().map(|s| (s - ms).powi(2)).sum::<f64>() / (n - 1.0)).sqrt();
        assert_relative_eq!(snap.z_score.unwrap(), (spreads[19] - ms) / sd, max_relative = 1e-6);

        let job = e.take_stationarity_job().unwrap();
        assert_relative_eq!(job.spread[19], spreads[19], max_relative = 1e-9);
    }

    #[test]
    fn test_kalman_mode() {
        let mut p = params(20);
        p.hedge_mode = HedgeMode::Kalman;
        let mut e = AnalyticsEngine::new(PairId::new("BTCUSDT", "ETHUSDT"), Timeframe::ONE_MINUTE, p);
        let mut snap = None;
        for i in 0..60 {
            let s = feed(&mut e, i);
            if i < 19 {
                assert!(s.hedge_ratio.is_none());
            }
            snap = Some(s);
        }
        let snap = snap.unwrap();
        let beta = snap.hedge_ratio.unwrap();
        assert!(beta.is_finite() && beta > 0.0);
        assert!(snap.z_score.unwrap().is_finite());
        assert_relative_eq!(snap.spread.unwrap(), snap.close_a - beta * snap.close_b);
    }
}
