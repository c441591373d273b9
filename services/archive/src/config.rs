use crate::store::{COLUMNS_PER_ROW, MAX_BULK_ROWS};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

/// Mailbox depth above which admission switches to the synchronous fallback.
///
/// Fixed, not configurable.
pub const OVERLOAD_THRESHOLD: usize = 500;

/// Errors found while validating a loaded configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No tenants configured")]
    NoTenants,

    #[error("Duplicate tenant name: {0}")]
    DuplicateTenant(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Main configuration for the archive service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Per-tenant archive pool configuration
    #[serde(default)]
    pub tenants: Vec<TenantConfig>,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Archive table name
    #[serde(default = "default_table")]
    pub table: String,
}

/// Archive pool settings for one tenant.
///
/// `pool_size` should be a multiple or a divisor of the archive table's
/// physical partition count so each worker's batches land on a bounded set
/// of partitions. Nothing checks this.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TenantConfig {
    /// Tenant (host type) name
    pub name: String,
    /// Number of shard workers
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Records per bulk insert
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Time a partial batch may wait before it is flushed, in milliseconds
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

/// API configuration for the admission/ops endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "archive-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_table() -> String {
    "muc_messages".to_string()
}

fn default_pool_size() -> usize {
    32
}

fn default_max_batch_size() -> usize {
    30
}

fn default_flush_interval_ms() -> u64 {
    2000
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "archive-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/archive").required(false))
            .add_source(config::File::with_name("/etc/archive/archive").required(false))
            // Override with environment variables
            // ARCHIVE__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("ARCHIVE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the archive pools cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tenants.is_empty() {
            return Err(ConfigError::NoTenants);
        }

        let mut seen = HashSet::new();
        for tenant in &self.tenants {
            if !seen.insert(tenant.name.as_str()) {
                return Err(ConfigError::DuplicateTenant(tenant.name.clone()));
            }
            tenant.validate()?;
        }

        Ok(())
    }
}

impl DatabaseConfig {
    /// Get database connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get database idle timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl TenantConfig {
    /// Tenant settings with the stock pool size, batch size and interval
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pool_size: default_pool_size(),
            max_batch_size: default_max_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, message: &str| ConfigError::InvalidValue {
            key: format!("tenants.{}.{}", self.name, key),
            message: message.to_string(),
        };

        if self.name.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "tenants.name".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if self.pool_size == 0 {
            return Err(invalid("pool_size", "must be at least 1"));
        }
        if self.max_batch_size == 0 {
            return Err(invalid("max_batch_size", "must be at least 1"));
        }
        if self.max_batch_size > MAX_BULK_ROWS {
            return Err(invalid(
                "max_batch_size",
                &format!(
                    "must be at most {} ({} bind parameters per row)",
                    MAX_BULK_ROWS, COLUMNS_PER_ROW
                ),
            ));
        }
        if self.flush_interval_ms == 0 {
            return Err(invalid("flush_interval_ms", "must be greater than 0"));
        }

        Ok(())
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(tenants: Vec<TenantConfig>) -> Config {
        Config {
            service: ServiceConfig::default(),
            database: DatabaseConfig {
                url: "postgres://localhost/archive".to_string(),
                max_connections: default_max_connections(),
                min_connections: default_min_connections(),
                connect_timeout_secs: default_connect_timeout_secs(),
                idle_timeout_secs: default_idle_timeout_secs(),
                table: default_table(),
            },
            api: ApiConfig::default(),
            tenants,
        }
    }

    #[test]
    fn test_default_values() {
        let tenant = TenantConfig::new("localhost");
        assert_eq!(tenant.pool_size, 32);
        assert_eq!(tenant.max_batch_size, 30);
        assert_eq!(tenant.flush_interval(), Duration::from_millis(2000));
        assert_eq!(OVERLOAD_THRESHOLD, 500);
    }

    #[test]
    fn test_tenant_defaults_from_json() {
        let tenant: TenantConfig = serde_json::from_str(r#"{"name": "muc.example"}"#).unwrap();
        assert_eq!(tenant, TenantConfig::new("muc.example"));
    }

    #[test]
    fn test_validate_rejects_empty_tenant_list() {
        let config = test_config(vec![]);
        assert!(matches!(config.validate(), Err(ConfigError::NoTenants)));
    }

    #[test]
    fn test_validate_rejects_duplicate_tenants() {
        let config = test_config(vec![TenantConfig::new("a"), TenantConfig::new("a")]);
        match config.validate() {
            Err(ConfigError::DuplicateTenant(name)) => assert_eq!(name, "a"),
            other => panic!("expected duplicate tenant error, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let mut tenant = TenantConfig::new("a");
        tenant.max_batch_size = 0;
        let config = test_config(vec![tenant]);

        match config.validate() {
            Err(ConfigError::InvalidValue { key, .. }) => {
                assert_eq!(key, "tenants.a.max_batch_size")
            }
            other => panic!("expected invalid value error, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_batch_beyond_bind_limit() {
        let mut tenant = TenantConfig::new("a");
        tenant.max_batch_size = 10_000;
        let config = test_config(vec![tenant]);

        match config.validate() {
            Err(ConfigError::InvalidValue { key, message }) => {
                assert_eq!(key, "tenants.a.max_batch_size");
                assert!(message.contains("9362"));
            }
            other => panic!("expected invalid value error, got {:?}", other),
        }

        let mut largest = TenantConfig::new("b");
        largest.max_batch_size = MAX_BULK_ROWS;
        assert!(test_config(vec![largest]).validate().is_ok());
    }

    #[test]
    fn test_validate_accepts_defaults() {
        let config = test_config(vec![TenantConfig::new("a"), TenantConfig::new("b")]);
        assert!(config.validate().is_ok());
    }
}
