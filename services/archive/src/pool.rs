use crate::config::TenantConfig;
use crate::error::ArchiveError;
use crate::flush::FlushExecutor;
use crate::guard::OverloadGuard;
use crate::metrics::{ArchiveMetrics, MetricsSnapshot};
use crate::notify::FlushNotifier;
use crate::record::WriteRequest;
use crate::router::ShardTable;
use crate::store::ArchiveStore;
use crate::worker::{BatchWorker, WorkerHandle};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

/// All archive workers of one tenant
pub struct ArchivePool {
    config: TenantConfig,
    table: ShardTable<WorkerHandle>,
    guard: OverloadGuard,
    metrics: Arc<ArchiveMetrics>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ArchivePool {
    /// Spawn `config.pool_size` workers writing to `store`
    pub fn start(
        config: TenantConfig,
        store: Arc<dyn ArchiveStore>,
        notifier: Arc<dyn FlushNotifier>,
    ) -> Self {
        let metrics = Arc::new(ArchiveMetrics::new(config.name.clone()));
        let mut handles = Vec::with_capacity(config.pool_size);
        let mut tasks = Vec::with_capacity(config.pool_size);

        for index in 0..config.pool_size {
            let executor = FlushExecutor::new(
                config.name.clone(),
                index,
                config.max_batch_size,
                Arc::clone(&store),
                Arc::clone(&metrics),
                Arc::clone(&notifier),
            );
            let (handle, task) = BatchWorker::spawn(index, &config, executor, Arc::clone(&metrics));
            handles.push(handle);
            tasks.push(task);
        }

        info!(
            tenant = %config.name,
            pool_size = config.pool_size,
            max_batch_size = config.max_batch_size,
            flush_interval_ms = config.flush_interval_ms,
            "Archive pool started"
        );

        Self {
            table: ShardTable::new(config.name.clone(), handles),
            guard: OverloadGuard::new(config.name.clone(), Arc::clone(&metrics)),
            config,
            metrics,
            tasks: Mutex::new(tasks),
            closed: AtomicBool::new(false),
        }
    }

    /// Route `request` to its room's worker and admit it
    pub async fn submit(&self, request: WriteRequest) -> Result<(), ArchiveError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ArchiveError::Closed(self.config.name.clone()));
        }

        let worker = self.table.worker_for(request.owner_key());
        self.guard.admit(worker, request).await
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Current mailbox depth of every worker, by index
    pub fn mailbox_depths(&self) -> Vec<usize> {
        self.table.workers().map(|(_, w)| w.pending()).collect()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            tenant: self.config.name.clone(),
            pool_size: self.table.pool_size(),
            max_batch_size: self.config.max_batch_size,
            flush_interval_ms: self.config.flush_interval_ms,
            overload_threshold: self.guard.threshold(),
            mailbox_depths: self.mailbox_depths(),
            metrics: self.metrics(),
        }
    }

    /// Stop admitting records, flush every worker and wait for them to exit
    #[instrument(skip(self), fields(tenant = %self.config.name))]
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        for (index, worker) in self.table.workers() {
            if worker.shutdown().is_err() {
                warn!(worker = index, "Archive worker already stopped");
            }
        }

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Archive worker task failed");
            }
        }

        info!("Archive pool stopped");
    }
}

/// Pool state reported by the stats endpoint
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub tenant: String,
    pub pool_size: usize,
    pub max_batch_size: usize,
    pub flush_interval_ms: u64,
    pub overload_threshold: usize,
    pub mailbox_depths: Vec<usize>,
    pub metrics: MetricsSnapshot,
}

/// Archive pools of every configured tenant.
///
/// Built once at startup and passed to whoever submits records.
pub struct ArchiveService {
    pools: HashMap<String, Arc<ArchivePool>>,
}

impl ArchiveService {
    /// Start one pool per tenant. `store_for` supplies each tenant's store.
    pub fn start<F>(
        tenants: &[TenantConfig],
        mut store_for: F,
        notifier: Arc<dyn FlushNotifier>,
    ) -> Self
    where
        F: FnMut(&TenantConfig) -> Arc<dyn ArchiveStore>,
    {
        let pools = tenants
            .iter()
            .map(|tenant| {
                let store = store_for(tenant);
                let pool = ArchivePool::start(tenant.clone(), store, Arc::clone(&notifier));
                (tenant.name.clone(), Arc::new(pool))
            })
            .collect();

        Self { pools }
    }

    pub fn pool(&self, tenant: &str) -> Option<&Arc<ArchivePool>> {
        self.pools.get(tenant)
    }

    /// Admit `request` for `tenant`
    pub async fn submit(&self, tenant: &str, request: WriteRequest) -> Result<(), ArchiveError> {
        let pool = self
            .pool(tenant)
            .ok_or_else(|| ArchiveError::UnknownTenant(tenant.to_string()))?;

        pool.submit(request).await
    }

    /// Stats for every tenant, sorted by tenant name
    pub fn stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<_> = self.pools.values().map(|p| p.stats()).collect();
        stats.sort_by(|a, b| a.tenant.cmp(&b.tenant));
        stats
    }

    /// Shut down every pool, flushing pending records
    pub async fn shutdown(&self) {
        futures::future::join_all(self.pools.values().map(|p| p.shutdown())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::BroadcastNotifier;
    use crate::record::test_request;
    use crate::store::testing::RecordingStore;
    use std::time::Duration;

    fn tenant(name: &str, pool_size: usize, max_batch_size: usize) -> TenantConfig {
        TenantConfig {
            pool_size,
            max_batch_size,
            ..TenantConfig::new(name)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_admitted_record_is_flushed() {
        let store = Arc::new(RecordingStore::default());
        let pool = ArchivePool::start(
            tenant("localhost", 4, 3),
            store.clone(),
            Arc::new(BroadcastNotifier::new(8)),
        );

        for id in 0..20 {
            pool.submit(test_request(7, id)).await.unwrap();
        }

        // Two partial records remain until the timer fires
        tokio::time::sleep(Duration::from_millis(2500)).await;

        assert_eq!(store.message_ids(), (0..20).collect::<Vec<_>>());
        assert_eq!(store.bulk_calls(), vec![3; 6]);
        assert_eq!(store.single_calls(), 2);
        assert_eq!(pool.metrics().messages_flushed, 20);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_rooms_are_spread_across_workers() {
        let notifier = Arc::new(BroadcastNotifier::new(64));
        let mut events = notifier.subscribe();
        let pool = ArchivePool::start(
            tenant("localhost", 4, 1),
            Arc::new(RecordingStore::default()),
            notifier,
        );

        // Rooms 0..8 cover every worker twice
        for room in 0..8 {
            pool.submit(test_request(room, room as i64)).await.unwrap();
        }

        let mut flushes_per_worker = [0; 4];
        for _ in 0..8 {
            let event = events.recv().await.unwrap();
            assert_eq!(event.message_count, 1);
            flushes_per_worker[event.worker] += 1;
        }
        assert_eq!(flushes_per_worker, [2, 2, 2, 2]);

        let stats = pool.stats();
        assert_eq!(stats.pool_size, 4);
        assert_eq!(stats.mailbox_depths.len(), 4);
        assert_eq!(stats.overload_threshold, 500);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_closes_pool() {
        let store = Arc::new(RecordingStore::default());
        let pool = ArchivePool::start(
            tenant("localhost", 2, 30),
            store.clone(),
            Arc::new(BroadcastNotifier::new(8)),
        );

        pool.submit(test_request(1, 1)).await.unwrap();
        pool.submit(test_request(2, 2)).await.unwrap();
        pool.shutdown().await;

        let mut ids = store.message_ids();
        ids.sort();
        assert_eq!(ids, vec![1, 2]);

        let result = pool.submit(test_request(1, 3)).await;
        assert!(matches!(result, Err(ArchiveError::Closed(_))));

        // Second shutdown is a no-op
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_service_routes_by_tenant() {
        let first = Arc::new(RecordingStore::default());
        let second = Arc::new(RecordingStore::default());
        let stores = [first.clone(), second.clone()];
        let mut next = stores.iter();

        let service = ArchiveService::start(
            &[tenant("a.example", 2, 30), tenant("b.example", 2, 30)],
            |_| {
                let store: Arc<dyn ArchiveStore> = next.next().unwrap().clone();
                store
            },
            Arc::new(BroadcastNotifier::new(8)),
        );

        service.submit("a.example", test_request(1, 1)).await.unwrap();
        service.submit("b.example", test_request(1, 2)).await.unwrap();
        service.submit("b.example", test_request(1, 3)).await.unwrap();

        let unknown = service.submit("c.example", test_request(1, 4)).await;
        assert!(matches!(unknown, Err(ArchiveError::UnknownTenant(t)) if t == "c.example"));

        let stats = service.stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].tenant, "a.example");

        service.shutdown().await;

        assert_eq!(first.message_ids(), vec![1]);
        assert_eq!(second.message_ids(), vec![2, 3]);
    }
}
