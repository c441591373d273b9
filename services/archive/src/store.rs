use crate::config::DatabaseConfig;
use crate::error::StoreError;
use crate::record::WriteRequest;
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use tracing::{debug, info, instrument};

/// Backing store for archived room messages.
///
/// Each operation returns the number of rows it wrote or a structured
/// failure; callers never see a panic from the store.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Insert a single record
    async fn insert_one(&self, record: &WriteRequest) -> Result<u64, StoreError>;

    /// Insert exactly one full batch in a single round trip
    async fn insert_many(&self, records: &[WriteRequest]) -> Result<u64, StoreError>;

    /// Apply the retraction carried by `record`, if any
    async fn retract(&self, record: &WriteRequest) -> Result<u64, StoreError>;
}

/// Create the shared PostgreSQL connection pool
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.connect_timeout())
        .idle_timeout(Some(config.idle_timeout()))
        .connect(&config.url)
        .await
        .context("Failed to connect to PostgreSQL")?;

    info!("Connected to PostgreSQL database");

    Ok(pool)
}

/// PostgreSQL archive store for one tenant.
///
/// All tenants share one connection pool; each gets its own statements sized
/// to its batch size.
#[derive(Clone)]
pub struct PgArchiveStore {
    pool: PgPool,
    table: String,
    batch_size: usize,
    insert_one_sql: String,
    retract_sql: String,
}

const COLUMNS: &str = "room_id, message_id, sender_jid, nick_name, message, origin_id, created_at";

/// Bind parameters each row adds to an insert
pub const COLUMNS_PER_ROW: usize = 7;

/// Largest number of bind parameters PostgreSQL accepts in one statement
pub const MAX_BIND_PARAMETERS: usize = u16::MAX as usize;

/// Largest batch a single multi-row insert can carry
pub const MAX_BULK_ROWS: usize = MAX_BIND_PARAMETERS / COLUMNS_PER_ROW;

/// Room ids are stored in a signed BIGINT column
fn room_id_param(record: &WriteRequest) -> Result<i64, StoreError> {
    i64::try_from(record.room_id).map_err(|_| {
        StoreError::Rejected(format!("room id {} does not fit in BIGINT", record.room_id))
    })
}

impl PgArchiveStore {
    pub fn new(pool: PgPool, table: impl Into<String>, batch_size: usize) -> Self {
        let table = table.into();
        let insert_one_sql = format!(
            "INSERT INTO {} ({}) VALUES ($1, $2, $3, $4, $5, $6, $7)",
            table, COLUMNS
        );
        let retract_sql = format!(
            "UPDATE {} SET message = '', retracted = TRUE \
             WHERE room_id = $1 AND sender_jid = $2 AND origin_id = $3",
            table
        );

        Self {
            pool,
            table,
            batch_size,
            insert_one_sql,
            retract_sql,
        }
    }
}

#[async_trait]
impl ArchiveStore for PgArchiveStore {
    #[instrument(skip(self, record), fields(room_id = record.room_id, message_id = record.message_id))]
    async fn insert_one(&self, record: &WriteRequest) -> Result<u64, StoreError> {
        let room_id = room_id_param(record)?;

        let result = sqlx::query(&self.insert_one_sql)
            .bind(room_id)
            .bind(record.message_id)
            .bind(&record.sender_jid)
            .bind(&record.nick_name)
            .bind(&record.payload)
            .bind(&record.origin_id)
            .bind(record.timestamp)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, records), fields(count = records.len()))]
    async fn insert_many(&self, records: &[WriteRequest]) -> Result<u64, StoreError> {
        if records.len() != self.batch_size {
            return Err(StoreError::BatchSizeMismatch {
                expected: self.batch_size,
                actual: records.len(),
            });
        }

        let room_ids = records
            .iter()
            .map(room_id_param)
            .collect::<Result<Vec<_>, _>>()?;

        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("INSERT INTO {} ({}) ", self.table, COLUMNS));

        builder.push_values(records.iter().zip(room_ids), |mut row, (record, room_id)| {
            row.push_bind(room_id)
                .push_bind(record.message_id)
                .push_bind(record.sender_jid.clone())
                .push_bind(record.nick_name.clone())
                .push_bind(record.payload.clone())
                .push_bind(record.origin_id.clone())
                .push_bind(record.timestamp);
        });

        let result = builder.build().execute(&self.pool).await?;

        debug!(rows = result.rows_affected(), "Bulk insert completed");

        Ok(result.rows_affected())
    }

    async fn retract(&self, record: &WriteRequest) -> Result<u64, StoreError> {
        let Some(retraction) = &record.retraction else {
            return Ok(0);
        };

        let room_id = room_id_param(record)?;

        let result = sqlx::query(&self.retract_sql)
            .bind(room_id)
            .bind(&record.sender_jid)
            .bind(&retraction.origin_id)
            .execute(&self.pool)
            .await?;

        debug!(
            room_id = record.room_id,
            origin_id = %retraction.origin_id,
            rows = result.rows_affected(),
            "Retraction applied"
        );

        Ok(result.rows_affected())
    }
}

/// In-memory store that records every call, for worker and flush tests
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct RecordingStore {
        pub(crate) rows: Mutex<Vec<WriteRequest>>,
        pub(crate) bulk_calls: Mutex<Vec<usize>>,
        pub(crate) single_calls: Mutex<usize>,
        pub(crate) retractions: Mutex<Vec<String>>,
        pub(crate) retract_calls: Mutex<usize>,
        pub(crate) fail: AtomicBool,
    }

    impl RecordingStore {
        pub(crate) fn set_failing(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }

        pub(crate) fn message_ids(&self) -> Vec<i64> {
            self.rows.lock().unwrap().iter().map(|r| r.message_id).collect()
        }

        pub(crate) fn bulk_calls(&self) -> Vec<usize> {
            self.bulk_calls.lock().unwrap().clone()
        }

        pub(crate) fn single_calls(&self) -> usize {
            *self.single_calls.lock().unwrap()
        }

        fn check(&self) -> Result<(), StoreError> {
            if self.fail.load(Ordering::SeqCst) {
                Err(StoreError::Rejected("store unavailable".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl ArchiveStore for RecordingStore {
        async fn insert_one(&self, record: &WriteRequest) -> Result<u64, StoreError> {
            *self.single_calls.lock().unwrap() += 1;
            self.check()?;
            self.rows.lock().unwrap().push(record.clone());
            Ok(1)
        }

        async fn insert_many(&self, records: &[WriteRequest]) -> Result<u64, StoreError> {
            self.bulk_calls.lock().unwrap().push(records.len());
            self.check()?;
            self.rows.lock().unwrap().extend_from_slice(records);
            Ok(records.len() as u64)
        }

        async fn retract(&self, record: &WriteRequest) -> Result<u64, StoreError> {
            *self.retract_calls.lock().unwrap() += 1;
            match &record.retraction {
                Some(retraction) => {
                    self.retractions
                        .lock()
                        .unwrap()
                        .push(retraction.origin_id.clone());
                    Ok(1)
                }
                None => Ok(0),
            }
        }
    }
}
