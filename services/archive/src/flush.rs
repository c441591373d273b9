use crate::metrics::ArchiveMetrics;
use crate::notify::{FlushEvent, FlushNotifier};
use crate::record::WriteRequest;
use crate::store::ArchiveStore;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

/// Outcome of one flush
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchResult {
    Inserted(u64),
    Failed(String),
}

impl BatchResult {
    pub fn is_inserted(&self) -> bool {
        matches!(self, BatchResult::Inserted(_))
    }
}

/// Writes one shard's batches to the backing store.
///
/// A failed batch is counted, logged and discarded. There is no retry, so
/// delivery is at most once.
pub struct FlushExecutor {
    tenant: String,
    worker: usize,
    max_batch_size: usize,
    store: Arc<dyn ArchiveStore>,
    metrics: Arc<ArchiveMetrics>,
    notifier: Arc<dyn FlushNotifier>,
}

impl FlushExecutor {
    pub fn new(
        tenant: impl Into<String>,
        worker: usize,
        max_batch_size: usize,
        store: Arc<dyn ArchiveStore>,
        metrics: Arc<ArchiveMetrics>,
        notifier: Arc<dyn FlushNotifier>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            worker,
            max_batch_size,
            store,
            metrics,
            notifier,
        }
    }

    /// Persist `batch` and report the outcome.
    ///
    /// A full batch goes out as one multi-row insert; anything smaller is
    /// inserted row by row.
    pub async fn flush(&self, batch: &[WriteRequest]) -> BatchResult {
        let start = Instant::now();
        let count = batch.len();

        let result = if count == self.max_batch_size {
            self.insert_bulk(batch).await
        } else {
            self.insert_each(batch).await
        };

        match &result {
            BatchResult::Inserted(rows) => {
                self.metrics.record_flushed(count);
                debug!(
                    tenant = %self.tenant,
                    worker = self.worker,
                    count,
                    rows,
                    "Archive batch flushed"
                );
            }
            BatchResult::Failed(reason) => {
                self.metrics.record_dropped_insert_failure(count);
                error!(
                    tenant = %self.tenant,
                    worker = self.worker,
                    count,
                    reason = %reason,
                    "Archive batch insert failed, batch dropped"
                );
            }
        }

        // Runs whether or not the insert went through
        self.apply_retractions(batch).await;
        self.notify(count, result.is_inserted());

        self.metrics.record_flush(start.elapsed(), count);

        result
    }

    async fn insert_bulk(&self, batch: &[WriteRequest]) -> BatchResult {
        match self.store.insert_many(batch).await {
            Ok(rows) => BatchResult::Inserted(rows),
            Err(e) => BatchResult::Failed(e.to_string()),
        }
    }

    async fn insert_each(&self, batch: &[WriteRequest]) -> BatchResult {
        let mut results = Vec::with_capacity(batch.len());
        for record in batch {
            results.push(self.store.insert_one(record).await);
        }

        let mut rows = 0;
        for result in results {
            match result {
                Ok(n) => rows += n,
                Err(e) => return BatchResult::Failed(e.to_string()),
            }
        }

        BatchResult::Inserted(rows)
    }

    async fn apply_retractions(&self, batch: &[WriteRequest]) {
        for record in batch {
            if let Err(e) = self.store.retract(record).await {
                warn!(
                    tenant = %self.tenant,
                    room_id = record.room_id,
                    message_id = record.message_id,
                    error = %e,
                    "Failed to apply retraction"
                );
            }
        }
    }

    fn notify(&self, message_count: usize, inserted: bool) {
        let notifier = Arc::clone(&self.notifier);
        let event = FlushEvent {
            tenant: self.tenant.clone(),
            worker: self.worker,
            message_count,
            inserted,
        };

        tokio::spawn(async move {
            notifier.archive_flushed(event);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{BroadcastNotifier, MockFlushNotifier};
    use crate::record::{test_request, Retraction};
    use crate::store::testing::RecordingStore;
    use tokio::sync::mpsc;

    fn executor(
        max_batch_size: usize,
        store: Arc<RecordingStore>,
        metrics: Arc<ArchiveMetrics>,
    ) -> FlushExecutor {
        FlushExecutor::new(
            "localhost",
            0,
            max_batch_size,
            store,
            metrics,
            Arc::new(BroadcastNotifier::new(8)),
        )
    }

    fn batch(count: i64) -> Vec<WriteRequest> {
        (1..=count).map(|id| test_request(5, id)).collect()
    }

    #[tokio::test]
    async fn test_full_batch_uses_single_bulk_insert() {
        let store = Arc::new(RecordingStore::default());
        let metrics = Arc::new(ArchiveMetrics::new("localhost"));
        let executor = executor(3, store.clone(), metrics.clone());

        let result = executor.flush(&batch(3)).await;

        assert_eq!(result, BatchResult::Inserted(3));
        assert_eq!(store.bulk_calls(), vec![3]);
        assert_eq!(store.single_calls(), 0);
        assert_eq!(metrics.snapshot().messages_flushed, 3);
        assert_eq!(metrics.snapshot().flushes, 1);
    }

    #[tokio::test]
    async fn test_partial_batch_inserts_row_by_row() {
        let store = Arc::new(RecordingStore::default());
        let metrics = Arc::new(ArchiveMetrics::new("localhost"));
        let executor = executor(5, store.clone(), metrics.clone());

        let result = executor.flush(&batch(2)).await;

        assert_eq!(result, BatchResult::Inserted(2));
        assert!(store.bulk_calls().is_empty());
        assert_eq!(store.single_calls(), 2);
        assert_eq!(store.message_ids(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_failed_insert_drops_whole_batch() {
        let store = Arc::new(RecordingStore::default());
        store.set_failing(true);
        let metrics = Arc::new(ArchiveMetrics::new("localhost"));
        let executor = executor(4, store.clone(), metrics.clone());

        let bulk = executor.flush(&batch(4)).await;
        assert!(matches!(bulk, BatchResult::Failed(ref reason) if reason.contains("store unavailable")));
        assert_eq!(metrics.snapshot().dropped_insert_failure, 4);

        let partial = executor.flush(&batch(3)).await;
        assert!(!partial.is_inserted());
        assert_eq!(metrics.snapshot().dropped_insert_failure, 7);
        assert_eq!(metrics.snapshot().messages_flushed, 0);
        assert_eq!(metrics.snapshot().flushes, 2);
    }

    #[tokio::test]
    async fn test_retractions_run_even_when_insert_fails() {
        let store = Arc::new(RecordingStore::default());
        store.set_failing(true);
        let metrics = Arc::new(ArchiveMetrics::new("localhost"));
        let executor = executor(10, store.clone(), metrics);

        let mut records = batch(2);
        records[1].retraction = Some(Retraction {
            origin_id: "origin-1".to_string(),
        });

        executor.flush(&records).await;

        assert_eq!(*store.retract_calls.lock().unwrap(), 2);
        assert_eq!(*store.retractions.lock().unwrap(), vec!["origin-1".to_string()]);
    }

    #[tokio::test]
    async fn test_flush_notifies_downstream() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut notifier = MockFlushNotifier::new();
        notifier.expect_archive_flushed().returning(move |event| {
            let _ = tx.send(event);
        });

        let store = Arc::new(RecordingStore::default());
        let executor = FlushExecutor::new(
            "localhost",
            2,
            3,
            store,
            Arc::new(ArchiveMetrics::new("localhost")),
            Arc::new(notifier),
        );

        executor.flush(&batch(3)).await;

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            FlushEvent {
                tenant: "localhost".to_string(),
                worker: 2,
                message_count: 3,
                inserted: true,
            }
        );
    }
}
