//! Augmented Dickey-Fuller unit root test with a constant term.
//!
//! Regresses `Δy_t` on `[y_{t-1}, Δy_{t-1}, ..., Δy_{t-p}, 1]` and reports
//! the t-ratio of the `y_{t-1}` coefficient. P-values come from MacKinnon's
//! (1994) approximate asymptotic distribution, critical values from
//! MacKinnon's (2010) finite-sample response surface.

use pairs_core::{AdfResult, TimestampMs};
use statrs::distribution::{ContinuousCDF, Normal};
use tracing::debug;

// MacKinnon (1994), constant only, one variable.
const TAU_MAX: f64 = 2.74;
const TAU_MIN: f64 = -18.83;
const TAU_STAR: f64 = -1.61;
const TAU_SMALLP: [f64; 3] = [2.1659, 1.4412, 0.038269];
const TAU_LARGEP: [f64; 4] = [1.7339, 0.93202, -0.12745, -0.010368];

// MacKinnon (2010), constant only, one variable: coefficients on powers of 1/n.
const CRIT_1PCT: [f64; 4] = [-3.43035, -6.5393, -16.786, -79.433];
const CRIT_5PCT: [f64; 4] = [-2.86154, -2.8903, -4.234, -40.040];
const CRIT_10PCT: [f64; 4] = [-2.56677, -1.5384, -2.809, 0.0];

/// Evaluate `c[0] + c[1] x + c[2] x² + ...`.
fn poly(coefs: &[f64], x: f64) -> f64 {
    coefs.iter().rev().fold(0.0, |acc, c| acc * x + c)
}

/// Approximate p-value of an ADF statistic.
pub fn mackinnon_pvalue(statistic: f64) -> f64 {
    if statistic > TAU_MAX {
        return 1.0;
    }
    if statistic < TAU_MIN {
        return 0.0;
    }
    let coefs: &[f64] = if statistic <= TAU_STAR {
        &TAU_SMALLP
    } else {
        &TAU_LARGEP
    };
    match Normal::new(0.0, 1.0) {
        Ok(normal) => normal.cdf(poly(coefs, statistic)),
        Err(_) => f64::NAN,
    }
}

/// 1%, 5% and 10% critical values for a regression with `n_obs` rows.
pub fn mackinnon_critical_values(n_obs: usize) -> [f64; 3] {
    let inv = 1.0 / n_obs as f64;
    [poly(&CRIT_1PCT, inv), poly(&CRIT_5PCT, inv), poly(&CRIT_10PCT, inv)]
}

/// Least squares fit used by the test.
struct OlsSolution {
    coefs: Vec<f64>,
    /// Diagonal of `(X'X)^-1`.
    inv_diag: Vec<f64>,
    ssr: f64,
    n: usize,
}

impl OlsSolution {
    /// Gaussian log-likelihood based AIC, `2k - 2 ln L`.
    fn aic(&self) -> f64 {
        let n = self.n as f64;
        let llf = -n / 2.0 * ((2.0 * std::f64::consts::PI).ln() + (self.ssr / n).ln() + 1.0);
        2.0 * self.coefs.len() as f64 - 2.0 * llf
    }

    fn t_value(&self, idx: usize) -> Option<f64> {
        let dof = self.n.checked_sub(self.coefs.len()).filter(|d| *d > 0)? as f64;
        let sigma2 = self.ssr / dof;
        let se = (sigma2 * self.inv_diag[idx]).sqrt();
        let t = self.coefs[idx] / se;
        (se > 0.0 && t.is_finite()).then_some(t)
    }
}

/// Invert a symmetric positive matrix by Gauss-Jordan elimination with
/// partial pivoting.
fn invert(mut a: Vec<Vec<f64>>) -> Option<Vec<Vec<f64>>> {
    let k = a.len();
    let scale = a
        .iter()
        .flatten()
        .fold(0.0_f64, |m, v| m.max(v.abs()))
        .max(f64::MIN_POSITIVE);
    let mut inv: Vec<Vec<f64>> = (0..k)
        .map(|i| (0..k).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
        .collect();

    for col in 0..k {
        let pivot_row = (col..k).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot_row][col].abs() <= scale * 1e-13 {
            return None;
        }
        a.swap(col, pivot_row);
        inv.swap(col, pivot_row);

        let pivot = a[col][col];
        for j in 0..k {
            a[col][j] /= pivot;
            inv[col][j] /= pivot;
        }
        for row in 0..k {
            if row == col {
                continue;
            }
            let factor = a[row][col];
            if factor == 0.0 {
                continue;
            }
            for j in 0..k {
                a[row][j] -= factor * a[col][j];
                inv[row][j] -= factor * inv[col][j];
            }
        }
    }
    Some(inv)
}

/// Solve `min ||y - X b||²` through the normal equations.
fn ols(rows: &[Vec<f64>], y: &[f64]) -> Option<OlsSolution> {
    let n = rows.len();
    let k = rows.first()?.len();
    if n <= k {
        return None;
    }

    let mut xtx = vec![vec![0.0; k]; k];
    let mut xty = vec![0.0; k];
    for (row, &yi) in rows.iter().zip(y) {
        for i in 0..k {
            xty[i] += row[i] * yi;
            for j in i..k {
                xtx[i][j] += row[i] * row[j];
            }
        }
    }
    for i in 0..k {
        for j in 0..i {
            xtx[i][j] = xtx[j][i];
        }
    }

    let inv = invert(xtx)?;
    let coefs: Vec<f64> = (0..k).map(|i| (0..k).map(|j| inv[i][j] * xty[j]).sum()).collect();
    let ssr: f64 = rows
        .iter()
        .zip(y)
        .map(|(row, &yi)| {
            let fitted: f64 = row.iter().zip(&coefs).map(|(x, b)| x * b).sum();
            (yi - fitted).powi(2)
        })
        .sum();
    if !(ssr.is_finite() && ssr > 0.0) {
        return None;
    }

    Some(OlsSolution {
        inv_diag: (0..k).map(|i| inv[i][i]).collect(),
        coefs,
        ssr,
        n,
    })
}

/// Regression rows for `lags` lagged differences, using the sample that a
/// `sample_lag` regression would use so that AIC values are comparable.
fn design(level: &[f64], diff: &[f64], lags: usize, sample_lag: usize) -> (Vec<Vec<f64>>, Vec<f64>) {
    let mut rows = Vec::with_capacity(diff.len().saturating_sub(sample_lag));
    let mut y = Vec::with_capacity(rows.capacity());
    for t in sample_lag..diff.len() {
        let mut row = Vec::with_capacity(lags + 2);
        row.push(level[t]);
        for j in 1..=lags {
            row.push(diff[t - j]);
        }
        row.push(1.0);
        rows.push(row);
        y.push(diff[t]);
    }
    (rows, y)
}

/// Run the ADF test on `series`.
///
/// With `autolag` the number of lagged differences is chosen by AIC over
/// `0..=max_lag` on a common sample, then the test regression is refit on
/// the longest sample for that lag. Returns `None` for degenerate input.
pub fn adf_test(series: &[f64], max_lag: usize, autolag: bool) -> Option<AdfResult> {
    if series.iter().any(|v| !v.is_finite()) {
        debug!("adf skipped: non-finite input");
        return None;
    }
    // Demeaning only moves the constant; it keeps the normal equations well scaled.
    let mean = series.iter().sum::<f64>() / series.len().max(1) as f64;
    let level: Vec<f64> = series.iter().map(|v| v - mean).collect();
    let diff: Vec<f64> = level.windows(2).map(|w| w[1] - w[0]).collect();
    // level[t] is y_{t-1} for diff[t].
    let min_obs = max_lag + 3;
    if diff.len() <= max_lag + min_obs {
        debug!(len = series.len(), max_lag, "adf skipped: series too short");
        return None;
    }

    let used_lag = if autolag {
        let mut best: Option<(usize, f64)> = None;
        for lags in 0..=max_lag {
            let (rows, y) = design(&level, &diff, lags, max_lag);
            if let Some(fit) = ols(&rows, &y) {
                let aic = fit.aic();
                if best.map_or(true, |(_, b)| aic < b) {
                    best = Some((lags, aic));
                }
            }
        }
        best?.0
    } else {
        max_lag
    };

    let (rows, y) = design(&level, &diff, used_lag, used_lag);
    let Some(fit) = ols(&rows, &y) else {
        debug!(used_lag, "adf skipped: singular regression");
        return None;
    };
    let statistic = fit.t_value(0)?;
    let n_obs = rows.len();
    let [critical_1pct, critical_5pct, critical_10pct] = mackinnon_critical_values(n_obs);

    Some(AdfResult {
        statistic,
        p_value: mackinnon_pvalue(statistic),
        used_lag,
        n_obs,
        critical_1pct,
        critical_5pct,
        critical_10pct,
    })
}

/// Owned input for one deferred ADF run.
#[derive(Debug, Clone)]
pub struct StationarityJob {
    /// Monotonic per engine; newer outcomes supersede older ones.
    pub seq: u64,
    /// Spread series over the window, oldest first.
    pub spread: Vec<f64>,
    pub max_lag: usize,
    pub autolag: bool,
    /// Open time of the bar pair that triggered the job.
    pub scheduled_at: TimestampMs,
}

impl StationarityJob {
    /// Run the test. CPU bound; meant for a blocking worker.
    pub fn run(self) -> StationarityOutcome {
        let result = adf_test(&self.spread, self.max_lag, self.autolag);
        StationarityOutcome {
            seq: self.seq,
            scheduled_at: self.scheduled_at,
            result,
        }
    }
}

/// Result of a [`StationarityJob`].
#[derive(Debug, Clone)]
pub struct StationarityOutcome {
    pub seq: u64,
    pub scheduled_at: TimestampMs,
    pub result: Option<AdfResult>,
}
