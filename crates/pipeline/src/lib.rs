//! Tokio runtime wiring for the pairs analytics pipeline.
//!
//! This crate provides:
//! - Tick dispatch, per-symbol resampling and per-pair analytics tasks
//! - Threshold alerts over analytics snapshots
//! - CSV export of snapshots and bars, CSV tick and OHLCV bar input
//! - Offline analytics over loaded bars
//! - SQLite tick persistence and replay
//! - Cross-symbol correlation over recent closes

pub mod alerts;
pub mod bar_replay;
pub mod export;
pub mod history;
pub mod pipeline;
pub mod source;
pub mod store;

pub use alerts::{AlertEvaluator, AlertEvent, AlertRule};
pub use bar_replay::analyze_bars;
pub use export::{read_bars_csv, read_ticks_csv, BarCsvWriter, SnapshotCsvWriter};
pub use history::CloseHistory;
pub use pipeline::{Pipeline, PipelineHandle};
pub use source::{spawn_replay, SourceEvent};
pub use store::TickStore;
