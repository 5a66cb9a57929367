//! Rolling pair analytics.
//!
//! This crate provides:
//! - Fixed-size rolling windows with O(1) moments
//! - OLS, Theil-Sen and Kalman hedge ratio estimation
//! - Spread z-score and correlation
//! - Augmented Dickey-Fuller stationarity testing
//! - Cross-symbol correlation matrices

pub mod correlation;
pub mod engine;
pub mod kalman;
pub mod regression;
pub mod stationarity;
pub mod window;

pub use correlation::CorrelationMatrix;
pub use engine::{AnalyticsEngine, EngineParams};
pub use kalman::KalmanHedgeRatio;
pub use regression::{ols_fit, theil_sen_slope, OlsFit};
pub use stationarity::{adf_test, StationarityJob, StationarityOutcome};
pub use window::{PairMoments, RollingPairWindow, RollingStats};
