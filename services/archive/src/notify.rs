use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

/// Emitted after every flush, whether or not the insert succeeded
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlushEvent {
    pub tenant: String,
    pub worker: usize,
    pub message_count: usize,
    pub inserted: bool,
}

/// Downstream consumer of `archive_flushed` events.
///
/// Called from a detached task; implementations must not assume the flush
/// that produced the event is still in progress.
#[cfg_attr(test, mockall::automock)]
pub trait FlushNotifier: Send + Sync {
    fn archive_flushed(&self, event: FlushEvent);
}

/// Fans flush events out to any number of subscribers.
///
/// Slow subscribers lag and lose events; nothing waits for them.
#[derive(Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<FlushEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlushEvent> {
        self.tx.subscribe()
    }
}

impl FlushNotifier for BroadcastNotifier {
    fn archive_flushed(&self, event: FlushEvent) {
        // Err only means nobody is subscribed
        if self.tx.send(event).is_err() {
            trace!("No flush event subscribers");
        }
    }
}
