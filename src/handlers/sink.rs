use super::events::HubEvent;
use crate::error::HandlerError;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// Per-message diagnostics, shared by the router, the sink and the workers
#[derive(Debug, Default)]
pub struct RouterStats {
    pub routed: AtomicU64,
    pub unroutable: AtomicU64,
    pub handler_failures: AtomicU64,
    pub sink_dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RouterStatsSnapshot {
    pub routed: u64,
    pub unroutable: u64,
    pub handler_failures: u64,
    pub sink_dropped: u64,
}

impl RouterStats {
    pub fn snapshot(&self) -> RouterStatsSnapshot {
        RouterStatsSnapshot {
            routed: self.routed.load(Ordering::Relaxed),
            unroutable: self.unroutable.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            sink_dropped: self.sink_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Non-blocking producer side of the application event channel.
///
/// A full channel drops the event and counts it; the driving loop never
/// waits on a slow consumer.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<HubEvent>,
    stats: Arc<RouterStats>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<HubEvent>, stats: Arc<RouterStats>) -> Self {
        Self { tx, stats }
    }

    /// Creates a sink together with the receiving end
    pub fn channel(capacity: usize, stats: Arc<RouterStats>) -> (Self, mpsc::Receiver<HubEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx, stats), rx)
    }

    pub fn stats(&self) -> &Arc<RouterStats> {
        &self.stats
    }

    pub fn emit(&self, event: HubEvent) -> Result<(), HandlerError> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(event)) => {
                let dropped = self.stats.sink_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    broker = %event.broker(),
                    dropped,
                    "Event sink full, dropping event"
                );
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(HandlerError::SinkClosed),
        }
    }
}
