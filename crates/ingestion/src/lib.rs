//! Tick ingestion and multi-timeframe bar resampling.
//!
//! This crate handles:
//! - Duplicate tick suppression
//! - Bar building per symbol and timeframe
//! - Fan-out of one symbol's ticks to every timeframe
//! - Alignment of two symbols' bars into pairs

pub mod aligner;
pub mod bar_builder;
pub mod dedup;
pub mod resampler;

pub use aligner::{BarPair, PairSeries};
pub use bar_builder::{BarBuilder, TickFit};
pub use dedup::{IngestStats, TickDeduplicator};
pub use resampler::{IngestOutcome, Resampler};
