//! Task wiring of the live pipeline.
//!
//! ```text
//! feed ─► dispatcher ─► symbol task (Resampler) ──► bar broadcast ─┬─► pair task (PairSeries + AnalyticsEngine)
//!                               │                                  ├─► history task (CloseHistory)
//!                               └─► store writer (blocking)        └─► bar CSV sink
//! pair task ─► snapshot broadcast + watch ─┬─► alert task ─► alert broadcast
//!                                          └─► snapshot CSV sink
//! ```
//!
//! Every stage owns its state and talks to the others over bounded
//! channels only. When the feed closes, each stage drains and exits once
//! its upstream senders are gone.

use crate::alerts::{AlertEvaluator, AlertEvent};
use crate::export::{BarCsvWriter, SnapshotCsvWriter};
use crate::history::CloseHistory;
use crate::source::SourceEvent;
use crate::store::TickStore;
use anyhow::{anyhow, Context};
use pairs_analytics::{AnalyticsEngine, CorrelationMatrix, StationarityJob, StationarityOutcome};
use pairs_core::config::ClockMode;
use pairs_core::{now_ms, AnalyticsSnapshot, Bar, Config, PairId, Tick, Timeframe};
use pairs_ingestion::{PairSeries, Resampler};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Store batches between two retention sweeps.
const PRUNE_EVERY_BATCHES: u64 = 100;

struct CorrelationQuery {
    timeframe: Timeframe,
    reply: oneshot::Sender<pairs_core::Result<CorrelationMatrix>>,
}

/// A configured, not yet running pipeline.
///
/// Receivers taken from `subscribe_*` before [`Pipeline::start`] see every
/// item from the first one on.
pub struct Pipeline {
    config: Config,
    bars_tx: broadcast::Sender<Bar>,
    snapshots_tx: broadcast::Sender<AnalyticsSnapshot>,
    alerts_tx: broadcast::Sender<AlertEvent>,
    snapshot_csv: Option<PathBuf>,
    bar_csv: Option<PathBuf>,
}

impl Pipeline {
    /// Validate the configuration and create the output channels.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        config.validate().context("invalid pipeline configuration")?;
        let p = &config.pipeline;
        let (bars_tx, _) = broadcast::channel(p.bar_channel_capacity);
        let (snapshots_tx, _) = broadcast::channel(p.snapshot_channel_capacity);
        let (alerts_tx, _) = broadcast::channel(p.alert_channel_capacity);
        Ok(Self {
            config,
            bars_tx,
            snapshots_tx,
            alerts_tx,
            snapshot_csv: None,
            bar_csv: None,
        })
    }

    /// Validate, build and start in one step.
    pub fn spawn(config: Config, feed: mpsc::Receiver<SourceEvent>) -> anyhow::Result<PipelineHandle> {
        Self::new(config)?.start(feed)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Write every snapshot to a CSV file.
    pub fn export_snapshots(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_csv = Some(path.into());
        self
    }

    /// Write every finalized bar to a CSV file.
    pub fn export_bars(mut self, path: impl Into<PathBuf>) -> Self {
        self.bar_csv = Some(path.into());
        self
    }

    pub fn subscribe_bars(&self) -> broadcast::Receiver<Bar> {
        self.bars_tx.subscribe()
    }

    pub fn subscribe_snapshots(&self) -> broadcast::Receiver<AnalyticsSnapshot> {
        self.snapshots_tx.subscribe()
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<AlertEvent> {
        self.alerts_tx.subscribe()
    }

    /// Spawn every task. Must be called from within a tokio runtime.
    pub fn start(self, feed: mpsc::Receiver<SourceEvent>) -> anyhow::Result<PipelineHandle> {
        let Pipeline {
            config,
            bars_tx,
            snapshots_tx,
            alerts_tx,
            snapshot_csv,
            bar_csv,
        } = self;
        let p = &config.pipeline;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();

        // Receivers kept by the handle for later subscriptions.
        let bars_rx = bars_tx.subscribe();
        let snapshots_rx = snapshots_tx.subscribe();
        let alerts_rx = alerts_tx.subscribe();

        // Sinks first, so they see everything.
        if let Some(path) = bar_csv {
            let file = File::create(&path).with_context(|| format!("creating bar export {}", path.display()))?;
            let writer = BarCsvWriter::new(BufWriter::new(file)).context("writing bar export header")?;
            let rx = bars_tx.subscribe();
            tasks.spawn_blocking(move || run_bar_sink(writer, rx));
        }
        if let Some(path) = snapshot_csv {
            let file =
                File::create(&path).with_context(|| format!("creating snapshot export {}", path.display()))?;
            let writer = SnapshotCsvWriter::new(BufWriter::new(file)).context("writing snapshot export header")?;
            let rx = snapshots_tx.subscribe();
            tasks.spawn_blocking(move || run_snapshot_sink(writer, rx));
        }

        let store_tx = match &config.storage.db_path {
            Some(path) => {
                let store =
                    TickStore::open(path).with_context(|| format!("opening tick store {}", path.display()))?;
                let (tx, rx) = mpsc::channel(p.store_channel_capacity);
                let batch_size = p.store_batch_size;
                let retention_ms = config.storage.retention_ms;
                tasks.spawn_blocking(move || run_store_writer(store, rx, batch_size, retention_ms));
                Some(tx)
            }
            None => None,
        };

        // Pair tasks subscribe before any bar can be produced.
        let mut latest = HashMap::new();
        for pair_config in &config.pairs {
            let pair = pair_config.pair_id();
            let timeframe = pair_config.timeframe;
            let (latest_tx, latest_rx) = watch::channel(None);
            latest.insert((pair.clone(), timeframe), latest_rx);
            let task = PairTask {
                engine: AnalyticsEngine::from_config(&config, pair_config),
                series: PairSeries::new(pair, timeframe, config.analytics.max_pending_bars),
                snapshots_tx: snapshots_tx.clone(),
                latest_tx,
                published: 0,
            };
            tasks.spawn(task.run(bars_tx.subscribe(), shutdown_rx.clone()));
        }

        let history_capacity = config
            .pairs
            .iter()
            .map(|pair| config.window_size(pair))
            .chain(std::iter::once(config.analytics.window_size))
            .max()
            .unwrap_or(config.analytics.window_size);
        let (history_tx, history_rx) = mpsc::channel(16);
        tasks.spawn(run_history(
            CloseHistory::new(history_capacity),
            config.market.symbols.clone(),
            config.analytics.variance_epsilon,
            bars_tx.subscribe(),
            history_rx,
            shutdown_rx.clone(),
        ));

        tasks.spawn(run_alerts(
            AlertEvaluator::new(&config.alerts),
            snapshots_tx.subscribe(),
            alerts_tx,
            shutdown_rx.clone(),
        ));
        drop(snapshots_tx);

        let mut routes = HashMap::new();
        for symbol in &config.market.symbols {
            let (tx, rx) = mpsc::channel(p.tick_channel_capacity);
            routes.insert(symbol.clone(), tx);
            let task = SymbolTask {
                resampler: Resampler::new(symbol.clone(), &config.market),
                bars_tx: bars_tx.clone(),
                store_tx: store_tx.clone(),
                store_dropped: 0,
                clock: config.market.clock,
            };
            let interval = Duration::from_millis(p.wall_clock_interval_ms.max(1) as u64);
            tasks.spawn(task.run(rx, interval, shutdown_rx.clone()));
        }
        drop(bars_tx);
        drop(store_tx);

        tasks.spawn(run_dispatcher(feed, routes, shutdown_rx));

        info!(
            symbols = config.market.symbols.len(),
            pairs = config.pairs.len(),
            timeframes = config.market.timeframes.len(),
            alert_rules = config.alerts.rules.len(),
            clock = ?config.market.clock,
            "pipeline started"
        );

        Ok(PipelineHandle {
            bars_rx,
            snapshots_rx,
            alerts_rx,
            latest,
            history_tx,
            shutdown_tx,
            tasks,
        })
    }
}

/// Control surface of a running pipeline.
pub struct PipelineHandle {
    bars_rx: broadcast::Receiver<Bar>,
    snapshots_rx: broadcast::Receiver<AnalyticsSnapshot>,
    alerts_rx: broadcast::Receiver<AlertEvent>,
    latest: HashMap<(PairId, Timeframe), watch::Receiver<Option<AnalyticsSnapshot>>>,
    history_tx: mpsc::Sender<CorrelationQuery>,
    shutdown_tx: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

impl PipelineHandle {
    /// Finalized bars from now on.
    pub fn subscribe_bars(&self) -> broadcast::Receiver<Bar> {
        self.bars_rx.resubscribe()
    }

    /// Snapshots from now on.
    pub fn subscribe_snapshots(&self) -> broadcast::Receiver<AnalyticsSnapshot> {
        self.snapshots_rx.resubscribe()
    }

    /// Triggered alerts from now on.
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<AlertEvent> {
        self.alerts_rx.resubscribe()
    }

    /// Most recent snapshot of a configured pair.
    pub fn latest_snapshot(&self, pair: &PairId, timeframe: Timeframe) -> Option<AnalyticsSnapshot> {
        self.latest
            .get(&(pair.clone(), timeframe))
            .and_then(|rx| rx.borrow().clone())
    }

    /// Watch a configured pair's latest snapshot.
    pub fn watch_pair(&self, pair: &PairId, timeframe: Timeframe) -> Option<watch::Receiver<Option<AnalyticsSnapshot>>> {
        self.latest.get(&(pair.clone(), timeframe)).cloned()
    }

    /// Correlation of all configured symbols over recent `timeframe` closes.
    pub async fn correlation_matrix(&self, timeframe: Timeframe) -> anyhow::Result<CorrelationMatrix> {
        let (reply, rx) = oneshot::channel();
        self.history_tx
            .send(CorrelationQuery { timeframe, reply })
            .await
            .map_err(|_| anyhow!("history task has stopped"))?;
        let matrix = rx.await.context("history task dropped the query")??;
        Ok(matrix)
    }

    /// Ask every task to stop. In-flight stationarity results are abandoned.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Wait for every task to finish.
    pub async fn join(self) {
        let PipelineHandle {
            history_tx,
            shutdown_tx,
            mut tasks,
            ..
        } = self;
        // Lets the history task finish once the bar stream has ended.
        drop(history_tx);
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "pipeline task failed");
            }
        }
        drop(shutdown_tx);
        info!("pipeline stopped");
    }
}

async fn run_dispatcher(
    mut feed: mpsc::Receiver<SourceEvent>,
    routes: HashMap<String, mpsc::Sender<Tick>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut routed = 0u64;
    let mut unknown = 0u64;
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            event = feed.recv() => match event {
                Some(SourceEvent::Tick(tick)) => match routes.get(&tick.symbol) {
                    Some(tx) => {
                        if tx.send(tick).await.is_err() {
                            warn!("symbol task stopped, dropping tick");
                        } else {
                            routed += 1;
                        }
                    }
                    None => {
                        unknown += 1;
                        debug!(symbol = %tick.symbol, "tick for unconfigured symbol ignored");
                    }
                },
                Some(SourceEvent::Disconnected { reason }) => {
                    warn!(%reason, "tick source disconnected, holding resampler state");
                }
                Some(SourceEvent::Reconnected) => info!("tick source reconnected"),
                None => {
                    info!("tick feed closed");
                    break;
                }
            },
        }
    }
    info!(routed, unknown, "dispatcher stopped");
}

struct SymbolTask {
    resampler: Resampler,
    bars_tx: broadcast::Sender<Bar>,
    store_tx: Option<mpsc::Sender<Tick>>,
    store_dropped: u64,
    clock: ClockMode,
}

impl SymbolTask {
    async fn run(mut self, mut ticks: mpsc::Receiver<Tick>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let wall_clock = self.clock == ClockMode::WallClock;
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                tick = ticks.recv() => match tick {
                    Some(tick) => self.on_tick(tick),
                    None => break,
                },
                _ = timer.tick(), if wall_clock => {
                    let bars = self.resampler.advance(now_ms());
                    self.publish(bars);
                }
            }
        }

        let stats = self.resampler.stats();
        info!(
            symbol = self.resampler.symbol(),
            total = stats.total_ticks,
            accepted = stats.accepted_ticks,
            duplicates = stats.duplicate_ticks,
            invalid = stats.invalid_ticks,
            late = stats.late_ticks,
            drop_frac = stats.drop_frac(),
            bars = stats.bars_emitted,
            gap_fills = stats.gap_fill_bars,
            store_dropped = self.store_dropped,
            "symbol task stopped"
        );
    }

    fn on_tick(&mut self, tick: Tick) {
        let ts = tick.ts_ms;
        if self.resampler.ingest(&tick).is_accepted() {
            self.persist(tick);
        }
        let bars = self.resampler.advance(ts);
        self.publish(bars);
    }

    fn persist(&mut self, tick: Tick) {
        let Some(tx) = &self.store_tx else {
            return;
        };
        match tx.try_send(tick) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.store_dropped += 1;
                if self.store_dropped == 1 || self.store_dropped % 10_000 == 0 {
                    warn!(
                        symbol = self.resampler.symbol(),
                        dropped = self.store_dropped,
                        "tick store queue full, dropping ticks"
                    );
                }
            }
            Err(TrySendError::Closed(_)) => {
                warn!(symbol = self.resampler.symbol(), "tick store writer stopped, persistence disabled");
                self.store_tx = None;
            }
        }
    }

    fn publish(&self, bars: Vec<Bar>) {
        for bar in bars {
            debug!(
                symbol = %bar.symbol,
                timeframe = %bar.timeframe,
                open_time = bar.open_time,
                close = bar.close,
                trades = bar.trade_count,
                "bar finalized"
            );
            // No receivers is not an error.
            let _ = self.bars_tx.send(bar);
        }
    }
}

struct PairTask {
    engine: AnalyticsEngine,
    series: PairSeries,
    snapshots_tx: broadcast::Sender<AnalyticsSnapshot>,
    latest_tx: watch::Sender<Option<AnalyticsSnapshot>>,
    published: u64,
}

impl PairTask {
    async fn run(mut self, mut bars: broadcast::Receiver<Bar>, mut shutdown: watch::Receiver<bool>) {
        let (done_tx, mut done_rx) = mpsc::channel::<Option<StationarityOutcome>>(1);
        let mut in_flight = false;
        let mut pending: Option<StationarityJob> = None;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                done = done_rx.recv() => {
                    in_flight = false;
                    if let Some(Some(outcome)) = done {
                        let seq = outcome.seq;
                        if self.engine.apply_stationarity(outcome) {
                            debug!(pair = %self.engine.pair(), seq, "stationarity result applied");
                        }
                    }
                    if let Some(job) = pending.take() {
                        launch_stationarity(job, done_tx.clone());
                        in_flight = true;
                    }
                }
                msg = bars.recv() => match msg {
                    Ok(bar) => {
                        self.on_bar(bar);
                        if let Some(job) = self.engine.take_stationarity_job() {
                            if in_flight {
                                if let Some(old) = pending.replace(job) {
                                    debug!(pair = %self.engine.pair(), seq = old.seq, "pending stationarity job replaced");
                                }
                            } else {
                                launch_stationarity(job, done_tx.clone());
                                in_flight = true;
                            }
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(pair = %self.engine.pair(), timeframe = %self.engine.timeframe(), skipped, "bar receiver lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        info!(
            pair = %self.engine.pair(),
            timeframe = %self.engine.timeframe(),
            snapshots = self.published,
            skipped_bars = self.series.skipped(),
            abandoned_stationarity = in_flight,
            "pair task stopped"
        );
    }

    fn on_bar(&mut self, bar: Bar) {
        let Some(pair) = self.series.push(bar) else {
            return;
        };
        match self.engine.on_bar_pair(&pair.a, &pair.b) {
            Ok(snapshot) => {
                self.published += 1;
                let _ = self.snapshots_tx.send(snapshot.clone());
                self.latest_tx.send_replace(Some(snapshot));
            }
            Err(e) => {
                warn!(pair = %self.engine.pair(), open_time = pair.open_time, error = %e, "bar pair rejected");
            }
        }
    }
}

fn launch_stationarity(job: StationarityJob, done: mpsc::Sender<Option<StationarityOutcome>>) {
    let seq = job.seq;
    tokio::spawn(async move {
        let outcome = match tokio::task::spawn_blocking(move || job.run()).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!(seq, error = %e, "stationarity job failed");
                None
            }
        };
        // The pair task may be gone; the result is then abandoned.
        let _ = done.send(outcome).await;
    });
}

async fn run_history(
    mut history: CloseHistory,
    symbols: Vec<String>,
    epsilon: f64,
    mut bars: broadcast::Receiver<Bar>,
    mut queries: mpsc::Receiver<CorrelationQuery>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut bars_open = true;
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            msg = bars.recv(), if bars_open => match msg {
                Ok(bar) => history.push(&bar),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "history bar receiver lagged"),
                Err(RecvError::Closed) => bars_open = false,
            },
            query = queries.recv() => match query {
                Some(query) => {
                    let _ = query.reply.send(history.correlation_matrix(&symbols, query.timeframe, epsilon));
                }
                None => break,
            },
        }
    }
}

async fn run_alerts(
    mut evaluator: AlertEvaluator,
    mut snapshots: broadcast::Receiver<AnalyticsSnapshot>,
    alerts_tx: broadcast::Sender<AlertEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    if evaluator.rules().is_empty() {
        debug!("no alert rules configured");
    }
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            msg = snapshots.recv() => match msg {
                Ok(snapshot) => {
                    for event in evaluator.evaluate(&snapshot) {
                        let _ = alerts_tx.send(event);
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "alert snapshot receiver lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }
}

fn run_store_writer(mut store: TickStore, mut rx: mpsc::Receiver<Tick>, batch_size: usize, retention_ms: Option<i64>) {
    let mut batch = Vec::with_capacity(batch_size);
    let mut stored = 0u64;
    let mut batches = 0u64;

    while let Some(tick) = rx.blocking_recv() {
        batch.push(tick);
        while batch.len() < batch_size {
            match rx.try_recv() {
                Ok(tick) => batch.push(tick),
                Err(_) => break,
            }
        }
        match store.insert_batch(&batch) {
            Ok(n) => stored += n as u64,
            Err(e) => error!(error = %e, batch = batch.len(), "tick store write failed"),
        }
        batch.clear();
        batches += 1;

        if let Some(retention) = retention_ms {
            if batches % PRUNE_EVERY_BATCHES == 0 {
                match store.latest_ts() {
                    Ok(Some(latest)) => match store.prune_before(latest - retention) {
                        Ok(pruned) if pruned > 0 => debug!(pruned, "tick retention applied"),
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "tick retention failed"),
                    },
                    Ok(None) => {}
                    Err(e) => error!(error = %e, "tick retention failed"),
                }
            }
        }
    }
    info!(stored, batches, "tick store writer stopped");
}

fn run_snapshot_sink(mut writer: SnapshotCsvWriter<BufWriter<File>>, mut rx: broadcast::Receiver<AnalyticsSnapshot>) {
    loop {
        match rx.blocking_recv() {
            Ok(snapshot) => {
                if let Err(e) = writer.write(&snapshot) {
                    error!(error = %e, "snapshot export failed");
                    return;
                }
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "snapshot export lagged"),
            Err(RecvError::Closed) => break,
        }
    }
    if let Err(e) = writer.flush() {
        error!(error = %e, "snapshot export flush failed");
    }
    info!(rows = writer.rows(), "snapshot export finished");
}

fn run_bar_sink(mut writer: BarCsvWriter<BufWriter<File>>, mut rx: broadcast::Receiver<Bar>) {
    loop {
        match rx.blocking_recv() {
            Ok(bar) => {
                if let Err(e) = writer.write(&bar) {
                    error!(error = %e, "bar export failed");
                    return;
                }
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "bar export lagged"),
            Err(RecvError::Closed) => break,
        }
    }
    if let Err(e) = writer.flush() {
        error!(error = %e, "bar export flush failed");
    }
    info!(rows = writer.rows(), "bar export finished");
}
