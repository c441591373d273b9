use thiserror::Error;

/// Errors returned to callers at the admission boundary
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// The shard's mailbox was over the threshold and the synchronous
    /// fallback did not complete. Retry later.
    #[error("Archive worker {worker} for tenant {tenant} is overloaded")]
    Overloaded { tenant: String, worker: usize },

    #[error("Unknown tenant: {0}")]
    UnknownTenant(String),

    #[error("Archive pool for tenant {0} is shut down")]
    Closed(String),
}

/// Errors from the backing store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Bulk insert expects exactly {expected} records, got {actual}")]
    BatchSizeMismatch { expected: usize, actual: usize },

    #[error("Insert rejected: {0}")]
    Rejected(String),
}
