//! Cross-symbol correlation matrix.

use crate::regression::pearson;
use pairs_core::{Error, Result};
use serde::Serialize;

/// Pearson correlations between every pair of close series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorrelationMatrix {
    pub symbols: Vec<String>,
    /// Row-major, `values[i][j]` is corr(symbol i, symbol j).
    pub values: Vec<Vec<Option<f64>>>,
    /// Observations per series.
    pub n_obs: usize,
}

impl CorrelationMatrix {
    /// Compute from equally long, time-aligned close series.
    pub fn compute(columns: &[(String, Vec<f64>)], epsilon: f64) -> Result<Self> {
        let n_obs = columns.first().map_or(0, |(_, c)| c.len());
        if let Some((symbol, col)) = columns.iter().find(|(_, c)| c.len() != n_obs) {
            return Err(Error::data(format!(
                "series for {symbol} has {} points, expected {n_obs}",
                col.len()
            )));
        }

        let k = columns.len();
        let mut values = vec![vec![None; k]; k];
        for i in 0..k {
            // A constant series has no defined correlation, even with itself.
            values[i][i] = pearson(&columns[i].1, &columns[i].1, epsilon).map(|_| 1.0);
            for j in (i + 1)..k {
                let r = pearson(&columns[i].1, &columns[j].1, epsilon);
                values[i][j] = r;
                values[j][i] = r;
            }
        }

        Ok(Self {
            symbols: columns.iter().map(|(s, _)| s.clone()).collect(),
            values,
            n_obs,
        })
    }

    /// Correlation between two symbols.
    pub fn get(&self, a: &str, b: &str) -> Option<f64> {
        let i = self.symbols.iter().position(|s| s == a)?;
        let j = self.symbols.iter().position(|s| s == b)?;
        self.values[i][j]
    }
}
