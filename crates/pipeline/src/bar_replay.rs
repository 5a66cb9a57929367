//! Analytics over pre-built bars, e.g. OHLCV files loaded with
//! [`read_bars_csv`](crate::export::read_bars_csv).
//!
//! Runs the same alignment and engine as the live pipeline, synchronously,
//! with stationarity jobs executed inline as soon as they are scheduled.

use pairs_analytics::AnalyticsEngine;
use pairs_core::{AnalyticsSnapshot, Bar, Config, Result};
use pairs_ingestion::PairSeries;
use tracing::{info, warn};

/// Feed `bars` through every configured pair and collect the snapshots.
///
/// Bars are processed in open-time order (stable for equal times); bars of
/// symbols or timeframes no pair uses are ignored. Snapshots come out in
/// processing order, interleaving pairs.
pub fn analyze_bars(config: &Config, mut bars: Vec<Bar>) -> Result<Vec<AnalyticsSnapshot>> {
    config.validate()?;
    bars.sort_by_key(|b| b.open_time);

    let mut pairs: Vec<(PairSeries, AnalyticsEngine)> = config
        .pairs
        .iter()
        .map(|pair| {
            (
                PairSeries::new(pair.pair_id(), pair.timeframe, config.analytics.max_pending_bars),
                AnalyticsEngine::from_config(config, pair),
            )
        })
        .collect();

    let mut snapshots = Vec::new();
    for bar in &bars {
        for (series, engine) in pairs.iter_mut() {
            let Some(pair) = series.push(bar.clone()) else {
                continue;
            };
            match engine.on_bar_pair(&pair.a, &pair.b) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => {
                    warn!(pair = %engine.pair(), open_time = pair.open_time, error = %e, "bar pair rejected");
                    continue;
                }
            }
            if let Some(job) = engine.take_stationarity_job() {
                engine.apply_stationarity(job.run());
            }
        }
    }

    for (series, engine) in &pairs {
        info!(
            pair = %engine.pair(),
            timeframe = %engine.timeframe(),
            window = engine.window_len(),
            skipped_bars = series.skipped(),
            "bar replay finished"
        );
    }
    Ok(snapshots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::read_bars_csv;
    use approx::assert_relative_eq;
    use pairs_core::config::PairConfig;
    use pairs_core::Timeframe;

    fn config(window: usize) -> Config {
        let mut config = Config::default();
        config.market.symbols = vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()];
        config.market.timeframes = vec![Timeframe::ONE_MINUTE];
        config.stationarity.every_n_bars = 3;
        config.pairs = vec![PairConfig {
            leg_a: "BTCUSDT".to_string(),
            leg_b: "ETHUSDT".to_string(),
            timeframe: Timeframe::ONE_MINUTE,
            window_size: Some(window),
        }];
        config
    }

    fn csv(rows: impl Iterator<Item = (i64, f64)>) -> String {
        let mut text = String::from("timestamp,open,high,low,close,volume\n");
        for (ts, close) in rows {
            text.push_str(&format!("{ts},{close},{close},{close},{close},1\n"));
        }
        text
    }

    fn close_b(i: i64) -> f64 {
        100.0 + 5.0 * (i as f64 * 0.7).sin() + 0.1 * i as f64
    }

    fn close_a(i: i64) -> f64 {
        2.0 * close_b(i) + 10.0 + ((i * 7 % 5) - 2) as f64 * 0.3
    }

    #[test]
    fn test_bars_from_files_produce_snapshots() {
        // ETH is missing minute 5; that interval yields no snapshot
        let btc = csv((0..40).map(|i| (i * 60_000, close_a(i))));
        let eth = csv((0..40).filter(|&i| i != 5).map(|i| (i * 60_000, close_b(i))));

        let mut bars = read_bars_csv(btc.as_bytes(), "BTCUSDT", Timeframe::ONE_MINUTE).unwrap();
        bars.extend(read_bars_csv(eth.as_bytes(), "ETHUSDT", Timeframe::ONE_MINUTE).unwrap());

        let snapshots = analyze_bars(&config(20), bars).unwrap();
        assert_eq!(snapshots.len(), 39);
        assert!(snapshots.iter().all(|s| s.open_time != 5 * 60_000));
        assert!(snapshots.windows(2).all(|w| w[0].open_time < w[1].open_time));

        assert!(snapshots[..19].iter().all(|s| s.hedge_ratio.is_none()));
        let last = snapshots.last().unwrap();
        assert_relative_eq!(last.hedge_ratio.unwrap(), 2.0, epsilon = 0.1);
        assert!(last.z_score.is_some());
        // stationarity ran inline and is carried on later snapshots
        assert!(last.adf_pvalue.is_some());
        assert!(last.adf_computed_at.is_some());
    }

    #[test]
    fn test_unused_symbols_ignored_and_config_checked() {
        let doge = csv((0..5).map(|i| (i * 60_000, 0.1)));
        let bars = read_bars_csv(doge.as_bytes(), "DOGEUSDT", Timeframe::ONE_MINUTE).unwrap();
        assert!(analyze_bars(&config(20), bars.clone()).unwrap().is_empty());

        assert!(analyze_bars(&config(1), bars).is_err());
    }
}
