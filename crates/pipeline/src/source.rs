//! Tick source events and the replay producer.

use pairs_core::Tick;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Event pushed by an upstream tick source.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    Tick(Tick),
    /// Upstream connection lost; resampler state is kept.
    Disconnected { reason: String },
    Reconnected,
}

impl From<Tick> for SourceEvent {
    fn from(tick: Tick) -> Self {
        SourceEvent::Tick(tick)
    }
}

/// Push recorded ticks into the feed in order, then close it.
///
/// Resolves to the number of ticks delivered; stops early if the pipeline
/// drops its end of the channel.
pub fn spawn_replay(ticks: Vec<Tick>, tx: mpsc::Sender<SourceEvent>) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let total = ticks.len();
        let mut sent = 0;
        for tick in ticks {
            if tx.send(SourceEvent::Tick(tick)).await.is_err() {
                debug!(sent, total, "feed closed before replay finished");
                return sent;
            }
            sent += 1;
        }
        info!(sent, "replay finished");
        sent
    })
}
