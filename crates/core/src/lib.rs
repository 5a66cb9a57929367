//! Core types and configuration for the pairs pipeline.
//!
//! This crate provides shared types used across all other crates:
//! - Market data types (ticks, bars, timeframes)
//! - Pair analytics output (snapshots, ADF results)
//! - Configuration structures
//! - Common error types

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
