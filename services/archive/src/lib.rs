//! Sharded write-back archive for chat-room messages.
//!
//! ```text
//!   submit(tenant, record)
//!          │
//!          ▼
//!   ArchiveService ── tenant ──▶ ArchivePool
//!                                  │ room_id % pool_size
//!                                  ▼
//!                              OverloadGuard ── depth > 500 ──▶ helper task (waits for ack)
//!                                  │
//!                                  ▼
//!                              BatchWorker (one task per shard)
//!                                  │ batch full or timer fired
//!                                  ▼
//!                              FlushExecutor ──▶ ArchiveStore (PostgreSQL)
//!                                  │
//!                                  ├──▶ ArchiveMetrics
//!                                  └──▶ FlushNotifier
//! ```
//!
//! Delivery is at most once: a failed insert drops its batch.

pub mod api;
pub mod config;
pub mod error;
pub mod flush;
pub mod guard;
pub mod metrics;
pub mod notify;
pub mod pool;
pub mod record;
pub mod router;
pub mod store;
pub mod worker;

pub use config::{Config, TenantConfig, OVERLOAD_THRESHOLD};
pub use error::{ArchiveError, StoreError};
pub use notify::{BroadcastNotifier, FlushEvent, FlushNotifier};
pub use pool::{ArchivePool, ArchiveService, PoolStats};
pub use record::{Retraction, WriteRequest};
pub use store::{ArchiveStore, PgArchiveStore};
