//! Per-shard batch worker.
//!
//! Each worker is one tokio task that owns its accumulator outright. Records,
//! timer signals and shutdown all arrive through the worker's mailbox and are
//! handled strictly in order, so nothing inside a shard needs a lock.
//!
//! ```text
//!            record                     count == max_batch_size
//!   Idle ───────────────▶ Accumulating ─────────────────────────┐
//!    ▲    (arm timer)        │    ▲                              │
//!    │                       │    │ record                       ▼
//!    │                       │    └──────                     Flushing
//!    │                       │ timer fires                       │
//!    │                       └──────────────────────────────────▶│
//!    └───────────────── cancel timer, clear batch ◀──────────────┘
//! ```

use crate::config::TenantConfig;
use crate::flush::{BatchResult, FlushExecutor};
use crate::metrics::ArchiveMetrics;
use crate::record::WriteRequest;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// Messages handled by a worker
#[derive(Debug)]
pub(crate) enum Command {
    /// Append a record. `ack` is answered once the record has been handled,
    /// including any flush it triggered.
    Append {
        request: WriteRequest,
        ack: Option<oneshot::Sender<()>>,
    },
    /// Flush timer fired for the batch armed under `generation`
    FlushTimeout { generation: u64 },
    /// Stop accepting work, flush what is pending and exit
    Shutdown,
}

/// The worker did not take the record
#[derive(Error, Debug)]
pub enum WorkerGone {
    #[error("worker mailbox is closed")]
    MailboxClosed,

    #[error("worker dropped the acknowledgement")]
    AckDropped,
}

/// Sending side of a worker's mailbox.
///
/// Cheap to clone. Tracks how many messages are waiting so the overload
/// guard can read the backlog without touching the worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    index: usize,
    tx: mpsc::UnboundedSender<Command>,
    depth: Arc<AtomicUsize>,
}

impl WorkerHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Messages sent to the worker and not yet received by it
    pub fn pending(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    /// Queue a record without waiting for the worker
    pub fn enqueue(&self, request: WriteRequest) -> Result<(), WorkerGone> {
        self.send(Command::Append { request, ack: None })
    }

    /// Queue a record and wait until the worker has handled it
    pub async fn append_sync(&self, request: WriteRequest) -> Result<(), WorkerGone> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send(Command::Append {
            request,
            ack: Some(ack_tx),
        })?;

        ack_rx.await.map_err(|_| WorkerGone::AckDropped)
    }

    /// Ask the worker to flush and stop
    pub fn shutdown(&self) -> Result<(), WorkerGone> {
        self.send(Command::Shutdown)
    }

    fn send(&self, command: Command) -> Result<(), WorkerGone> {
        send_counted(&self.tx, &self.depth, command)
    }
}

fn send_counted(
    tx: &mpsc::UnboundedSender<Command>,
    depth: &AtomicUsize,
    command: Command,
) -> Result<(), WorkerGone> {
    depth.fetch_add(1, Ordering::AcqRel);
    tx.send(command).map_err(|_| {
        depth.fetch_sub(1, Ordering::AcqRel);
        WorkerGone::MailboxClosed
    })
}

/// Whether the worker is holding records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Idle,
    Accumulating,
}

struct FlushTimer {
    generation: u64,
    task: JoinHandle<()>,
}

/// Mutable state owned by one worker. Empty, with no timer, after every flush.
pub struct WorkerState {
    pending: Vec<WriteRequest>,
    flush_interval: Duration,
    max_batch_size: usize,
    timer: Option<FlushTimer>,
}

impl WorkerState {
    fn new(config: &TenantConfig) -> Self {
        Self {
            pending: Vec::with_capacity(config.max_batch_size),
            flush_interval: config.flush_interval(),
            max_batch_size: config.max_batch_size,
            timer: None,
        }
    }

    pub fn phase(&self) -> WorkerPhase {
        if self.pending.is_empty() {
            WorkerPhase::Idle
        } else {
            WorkerPhase::Accumulating
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn has_timer(&self) -> bool {
        self.timer.is_some()
    }
}

/// Single-task actor accumulating and flushing one shard's records
pub struct BatchWorker {
    index: usize,
    tenant: String,
    state: WorkerState,
    executor: FlushExecutor,
    metrics: Arc<ArchiveMetrics>,
    // Weak, so dropping every handle still closes the mailbox
    timer_tx: mpsc::WeakUnboundedSender<Command>,
    depth: Arc<AtomicUsize>,
    next_generation: u64,
}

impl BatchWorker {
    /// Build a worker with its mailbox, without starting it
    pub(crate) fn new(
        index: usize,
        config: &TenantConfig,
        executor: FlushExecutor,
        metrics: Arc<ArchiveMetrics>,
    ) -> (Self, WorkerHandle, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));

        let worker = Self {
            index,
            tenant: config.name.clone(),
            state: WorkerState::new(config),
            executor,
            metrics,
            timer_tx: tx.downgrade(),
            depth: Arc::clone(&depth),
            next_generation: 0,
        };
        let handle = WorkerHandle { index, tx, depth };

        (worker, handle, rx)
    }

    /// Start a worker on its own task
    pub fn spawn(
        index: usize,
        config: &TenantConfig,
        executor: FlushExecutor,
        metrics: Arc<ArchiveMetrics>,
    ) -> (WorkerHandle, JoinHandle<()>) {
        let (worker, handle, rx) = Self::new(index, config, executor, metrics);
        let task = tokio::spawn(worker.run(rx));
        (handle, task)
    }

    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    /// Main loop. Returns once the mailbox is closed and drained.
    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        debug!(tenant = %self.tenant, worker = self.index, "Archive worker started");

        while let Some(command) = rx.recv().await {
            self.depth.fetch_sub(1, Ordering::AcqRel);

            if let Command::Shutdown = command {
                // Keep draining what was queued before the shutdown
                rx.close();
                continue;
            }
            self.handle(command).await;
        }

        if !self.state.pending.is_empty() {
            info!(
                tenant = %self.tenant,
                worker = self.index,
                count = self.state.pending.len(),
                "Flushing pending records on shutdown"
            );
            self.flush().await;
        }
        self.cancel_timer();

        debug!(tenant = %self.tenant, worker = self.index, "Archive worker stopped");
    }

    pub(crate) async fn handle(&mut self, command: Command) {
        match command {
            Command::Append { request, ack } => {
                self.append(request).await;
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            Command::FlushTimeout { generation } => self.on_timeout(generation).await,
            Command::Shutdown => {}
        }
    }

    async fn append(&mut self, request: WriteRequest) {
        if self.state.pending.is_empty() {
            self.arm_timer();
        }
        self.state.pending.push(request);

        if self.state.pending.len() >= self.state.max_batch_size {
            self.flush().await;
        }
    }

    async fn on_timeout(&mut self, generation: u64) {
        match &self.state.timer {
            Some(timer) if timer.generation == generation => {
                self.state.timer = None;
                self.flush().await;
            }
            _ => {
                // Fired after its batch was already flushed
                trace!(
                    tenant = %self.tenant,
                    worker = self.index,
                    generation,
                    "Ignoring stale flush timer"
                );
                self.metrics.record_stale_timer();
            }
        }
    }

    async fn flush(&mut self) -> BatchResult {
        self.cancel_timer();

        let batch = std::mem::replace(
            &mut self.state.pending,
            Vec::with_capacity(self.state.max_batch_size),
        );

        self.executor.flush(&batch).await
    }

    fn arm_timer(&mut self) {
        self.cancel_timer();

        self.next_generation += 1;
        let generation = self.next_generation;
        let interval = self.state.flush_interval;
        let tx = self.timer_tx.clone();
        let depth = Arc::clone(&self.depth);

        let task = tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            if let Some(tx) = tx.upgrade() {
                let _ = send_counted(&tx, &depth, Command::FlushTimeout { generation });
            }
        });

        self.state.timer = Some(FlushTimer { generation, task });
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.state.timer.take() {
            timer.task.abort();
        }
    }
}
