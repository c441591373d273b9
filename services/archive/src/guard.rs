use crate::config::OVERLOAD_THRESHOLD;
use crate::error::ArchiveError;
use crate::metrics::ArchiveMetrics;
use crate::record::WriteRequest;
use crate::worker::{WorkerGone, WorkerHandle};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{instrument, warn};

/// Admission control in front of a tenant's workers.
///
/// Below the threshold a record is queued and the caller returns at once.
/// Above it the record is handed to a helper task that waits for the worker
/// to take it, and the caller waits on that helper instead of growing the
/// mailbox further. If the helper does not finish cleanly the record is
/// counted as dropped and the caller gets `Overloaded`.
pub struct OverloadGuard {
    tenant: String,
    threshold: usize,
    metrics: Arc<ArchiveMetrics>,
}

impl OverloadGuard {
    pub fn new(tenant: impl Into<String>, metrics: Arc<ArchiveMetrics>) -> Self {
        Self {
            tenant: tenant.into(),
            threshold: OVERLOAD_THRESHOLD,
            metrics,
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Admit `request` into `worker`'s mailbox
    #[instrument(skip(self, worker, request), fields(tenant = %self.tenant, worker = worker.index()))]
    pub async fn admit(
        &self,
        worker: &WorkerHandle,
        request: WriteRequest,
    ) -> Result<(), ArchiveError> {
        let depth = worker.pending();

        if depth <= self.threshold {
            return worker
                .enqueue(request)
                .map_err(|_| ArchiveError::Closed(self.tenant.clone()));
        }

        let handle = worker.clone();
        let helper = tokio::spawn(async move { handle.append_sync(request).await });

        self.await_fallback(worker.index(), depth, helper).await
    }

    /// Wait on the fallback helper; anything but a clean finish is a drop
    async fn await_fallback(
        &self,
        worker: usize,
        depth: usize,
        helper: JoinHandle<Result<(), WorkerGone>>,
    ) -> Result<(), ArchiveError> {
        let failure = match helper.await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e.to_string(),
            Err(e) => e.to_string(),
        };

        self.metrics.record_dropped_overload();
        warn!(
            depth,
            threshold = self.threshold,
            reason = %failure,
            "Archive worker overloaded, message dropped"
        );

        Err(ArchiveError::Overloaded {
            tenant: self.tenant.clone(),
            worker,
        })
    }
}
