/// Map an owner key onto one of `pool_size` workers.
///
/// Plain modulo: every record of one room lands on the same worker, which
/// gives per-room ordering.
pub fn route(owner_key: u64, pool_size: usize) -> usize {
    (owner_key % pool_size as u64) as usize
}

/// Fixed set of workers serving one tenant.
///
/// The pool size is fixed at construction. Resizing a running table would
/// remap rooms onto different workers while their batches are in flight.
#[derive(Debug)]
pub struct ShardTable<W> {
    tenant: String,
    workers: Vec<(usize, W)>,
}

impl<W> ShardTable<W> {
    /// Build a table from workers in index order.
    ///
    /// # Panics
    ///
    /// Panics if `workers` is empty; configuration validation rules this out.
    pub fn new(tenant: impl Into<String>, workers: Vec<W>) -> Self {
        assert!(!workers.is_empty(), "shard table needs at least one worker");

        Self {
            tenant: tenant.into(),
            workers: workers.into_iter().enumerate().collect(),
        }
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn pool_size(&self) -> usize {
        self.workers.len()
    }

    /// Index of the worker owning `owner_key`
    pub fn route(&self, owner_key: u64) -> usize {
        route(owner_key, self.pool_size())
    }

    /// Worker owning `owner_key`
    pub fn worker_for(&self, owner_key: u64) -> &W {
        &self.workers[self.route(owner_key)].1
    }

    pub fn workers(&self) -> impl Iterator<Item = &(usize, W)> {
        self.workers.iter()
    }
}
