//! Adaptive hedge ratio via a two-state Kalman filter.
//!
//! State `x = [slope, intercept]` follows a random walk with covariance
//! `delta / (1 - delta) * I`; each bar observes `a = slope * b + intercept`
//! with noise variance `observation_cov`.

use pairs_core::config::KalmanConfig;
use tracing::warn;

/// Recursive estimator of `(slope, intercept)`.
#[derive(Debug, Clone)]
pub struct KalmanHedgeRatio {
    transition_var: f64,
    observation_cov: f64,
    state: [f64; 2],
    cov: [[f64; 2]; 2],
    updates: u64,
}

impl KalmanHedgeRatio {
    pub fn new(config: &KalmanConfig) -> Self {
        Self {
            transition_var: config.delta / (1.0 - config.delta),
            observation_cov: config.observation_cov,
            state: [0.0, 0.0],
            cov: Self::initial_cov(),
            updates: 0,
        }
    }

    fn initial_cov() -> [[f64; 2]; 2] {
        [[1.0, 1.0], [1.0, 1.0]]
    }

    /// Filter one observation and return the updated slope.
    ///
    /// Returns `None` and resets the filter if the state stops being finite.
    pub fn update(&mut self, a: f64, b: f64) -> Option<f64> {
        // Predict; the first observation uses the prior directly.
        let mut p = self.cov;
        if self.updates > 0 {
            p[0][0] += self.transition_var;
            p[1][1] += self.transition_var;
        }

        let h = [b, 1.0];
        let ph = [p[0][0] * h[0] + p[0][1] * h[1], p[1][0] * h[0] + p[1][1] * h[1]];
        let s = h[0] * ph[0] + h[1] * ph[1] + self.observation_cov;
        let k = [ph[0] / s, ph[1] / s];
        let innovation = a - (h[0] * self.state[0] + h[1] * self.state[1]);

        let state = [self.state[0] + k[0] * innovation, self.state[1] + k[1] * innovation];
        // P - K H P, where H P is the transpose of P H for symmetric P.
        let cov = [
            [p[0][0] - k[0] * ph[0], p[0][1] - k[0] * ph[1]],
            [p[1][0] - k[1] * ph[0], p[1][1] - k[1] * ph[1]],
        ];

        let finite = s.is_finite()
            && s > 0.0
            && state.iter().all(|v| v.is_finite())
            && cov.iter().flatten().all(|v| v.is_finite());
        if !finite {
            warn!(updates = self.updates, a, b, "kalman filter diverged, resetting");
            self.reset();
            return None;
        }

        self.state = state;
        self.cov = cov;
        self.updates += 1;
        Some(state[0])
    }

    pub fn slope(&self) -> Option<f64> {
        (self.updates > 0).then_some(self.state[0])
    }

    /// Observations absorbed since the last reset.
    pub fn updates(&self) -> u64 {
        self.updates
    }

    pub fn reset(&mut self) {
        self.state = [0.0, 0.0];
        self.cov = Self::initial_cov();
        self.updates = 0;
    }
}
