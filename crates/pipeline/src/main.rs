use anyhow::{bail, Context};
use clap::Parser;
use pairs_backtest::MeanReversionBacktest;
use pairs_core::{AnalyticsSnapshot, Config, PairId, Tick, Timeframe};
use pairs_pipeline::{analyze_bars, read_bars_csv, read_ticks_csv, spawn_replay, Pipeline, SnapshotCsvWriter, TickStore};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pairs-pipeline", version, about = "Real-time pairs analytics over a tick stream")]
struct Cli {
    /// JSON configuration file (defaults apply to omitted sections).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Replay ticks from a CSV file with columns symbol,ts_ms,price,quantity.
    #[arg(long, conflicts_with = "replay_db")]
    replay: Option<PathBuf>,

    /// Replay ticks stored in `storage.db_path`.
    #[arg(long, conflicts_with = "bars")]
    replay_db: bool,

    /// Analyse OHLCV bar files instead of ticks, as SYMBOL=PATH (repeatable).
    /// Columns: timestamp|datetime,open,high,low,close,volume[,vwap,trade_count].
    #[arg(long, value_name = "SYMBOL=PATH", conflicts_with = "replay")]
    bars: Vec<String>,

    /// Timeframe of the bar files.
    #[arg(long, default_value = "1m")]
    bars_timeframe: Timeframe,

    /// Write every analytics snapshot to this CSV file.
    #[arg(long)]
    export_snapshots: Option<PathBuf>,

    /// Write every finalized bar to this CSV file.
    #[arg(long)]
    export_bars: Option<PathBuf>,

    /// Run the mean-reversion backtest over each pair's snapshots and print the reports.
    #[arg(long)]
    backtest: bool,

    /// Print the effective configuration as JSON and exit.
    #[arg(long)]
    print_config: bool,
}

type SnapshotSeries = BTreeMap<(PairId, Timeframe), Vec<AnalyticsSnapshot>>;

fn group_snapshots(snapshots: Vec<AnalyticsSnapshot>) -> SnapshotSeries {
    let mut series = SnapshotSeries::new();
    for snapshot in snapshots {
        series
            .entry((snapshot.pair.clone(), snapshot.timeframe))
            .or_default()
            .push(snapshot);
    }
    series
}

fn print_backtests(backtester: &MeanReversionBacktest, series: &SnapshotSeries) -> anyhow::Result<()> {
    for ((pair, timeframe), snapshots) in series {
        let report = backtester
            .run(snapshots)
            .with_context(|| format!("backtest of {pair} @ {timeframe}"))?;
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}

/// Offline mode: analyse bar files and exit.
fn run_bar_files(cli: &Cli, config: &Config, backtester: &MeanReversionBacktest) -> anyhow::Result<()> {
    let mut bars = Vec::new();
    for arg in &cli.bars {
        let Some((symbol, path)) = arg.split_once('=') else {
            bail!("--bars expects SYMBOL=PATH, got '{arg}'");
        };
        let file = File::open(path).with_context(|| format!("opening {path}"))?;
        let loaded = read_bars_csv(BufReader::new(file), symbol, cli.bars_timeframe)
            .with_context(|| format!("reading {path}"))?;
        info!(symbol, path, bars = loaded.len(), "loaded bar file");
        bars.extend(loaded);
    }

    let snapshots = analyze_bars(config, bars)?;
    info!(snapshots = snapshots.len(), "bar analysis complete");

    if let Some(path) = &cli.export_snapshots {
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        let mut writer = SnapshotCsvWriter::new(std::io::BufWriter::new(file))?;
        for snapshot in &snapshots {
            writer.write(snapshot)?;
        }
        writer.flush()?;
        info!(path = %path.display(), rows = writer.rows(), "snapshots exported");
    }
    if cli.backtest {
        print_backtests(backtester, &group_snapshots(snapshots))?;
    }
    Ok(())
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

fn load_ticks(cli: &Cli, config: &mut Config) -> anyhow::Result<Vec<Tick>> {
    if let Some(path) = &cli.replay {
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        let ticks = read_ticks_csv(BufReader::new(file)).with_context(|| format!("reading {}", path.display()))?;
        info!(path = %path.display(), ticks = ticks.len(), "loaded replay ticks");
        return Ok(ticks);
    }
    if cli.replay_db {
        let Some(path) = config.storage.db_path.take() else {
            bail!("--replay-db requires storage.db_path in the configuration");
        };
        let store = TickStore::open(&path).with_context(|| format!("opening tick store {}", path.display()))?;
        let ticks = store.load_all_ordered().context("loading stored ticks")?;
        info!(path = %path.display(), ticks = ticks.len(), "loaded stored ticks");
        return Ok(ticks);
    }
    bail!("no tick source: pass --replay <csv> or --replay-db")
}

fn spawn_collector(mut rx: broadcast::Receiver<AnalyticsSnapshot>) -> JoinHandle<SnapshotSeries> {
    tokio::spawn(async move {
        let mut snapshots = Vec::new();
        loop {
            match rx.recv().await {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "backtest collector lagged, results will be incomplete");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        group_snapshots(snapshots)
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_json_file(path).with_context(|| format!("loading config {}", path.display()))?,
        None => Config::default(),
    };

    if cli.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let backtester = MeanReversionBacktest::from_config(&config.backtest)?;
    if !cli.bars.is_empty() {
        return run_bar_files(&cli, &config, &backtester);
    }

    let ticks = load_ticks(&cli, &mut config)?;
    let feed_capacity = config.pipeline.tick_channel_capacity;

    let mut pipeline = Pipeline::new(config)?;
    if let Some(path) = &cli.export_snapshots {
        pipeline = pipeline.export_snapshots(path);
    }
    if let Some(path) = &cli.export_bars {
        pipeline = pipeline.export_bars(path);
    }
    let collector = cli.backtest.then(|| spawn_collector(pipeline.subscribe_snapshots()));

    let (tx, rx) = mpsc::channel(feed_capacity);
    let handle = pipeline.start(rx)?;
    let replay = spawn_replay(ticks, tx);

    tokio::select! {
        res = replay => match res {
            Ok(sent) => info!(sent, "replay complete, draining pipeline"),
            Err(e) => error!(error = %e, "replay task failed"),
        },
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                warn!(error = %e, "failed to listen for interrupt");
            }
            info!("interrupt received, shutting down");
            handle.shutdown();
        }
    }
    handle.join().await;

    if let Some(collector) = collector {
        let series = collector.await.context("backtest collector failed")?;
        print_backtests(&backtester, &series)?;
    }

    Ok(())
}
