//! SqlExc Configuration
//!
//! JSON configuration loaded from `$SQLEXEC_CONFIG`, then `./config.json`,
//! `./config/config.json`, `/etc/sqlexec/config.json`, then built-in defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Main gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatewayConfig {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database-level limits
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Worker/object pool sizing
    #[serde(default)]
    pub pool: PoolConfig,

    /// Cache sizing and TTLs
    #[serde(default)]
    pub cache: CacheConfig,

    /// MVCC engine tuning
    #[serde(default)]
    pub mvcc: MvccConfig,

    /// Session lifecycle tuning
    #[serde(default)]
    pub session: SessionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port (MySQL default)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Version string reported in the handshake
    #[serde(default = "default_server_version")]
    pub version: String,

    /// Socket idle timeout
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,
}

/// Database-level limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Maximum concurrent client connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Default per-query deadline
    #[serde(default = "default_query_deadline", with = "humantime_serde")]
    pub query_deadline: Duration,
}

/// Worker/object pool sizing
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PoolConfig {
    /// Worker pool for parallel scans
    #[serde(default, rename = "goroutine_pool")]
    pub worker_pool: WorkerPoolConfig,

    /// Reusable-object pool
    #[serde(default)]
    pub object_pool: ObjectPoolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Maximum concurrent workers; also the per-statement parallelism ceiling
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Pending-task queue depth
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectPoolConfig {
    #[serde(default = "default_object_max")]
    pub max_size: usize,

    #[serde(default)]
    pub min_idle: usize,

    #[serde(default = "default_object_idle")]
    pub max_idle: usize,
}

/// Cache sizing and TTLs
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheConfig {
    #[serde(default)]
    pub query_cache: CacheSectionConfig,

    #[serde(default)]
    pub result_cache: CacheSectionConfig,

    #[serde(default)]
    pub schema_cache: CacheSectionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSectionConfig {
    #[serde(default = "default_cache_size")]
    pub max_size: usize,

    #[serde(default = "default_cache_ttl", with = "humantime_serde")]
    pub ttl: Duration,
}

/// MVCC engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MvccConfig {
    /// Interval between GC sweeps
    #[serde(default = "default_gc_interval", with = "humantime_serde")]
    pub gc_interval: Duration,

    /// Dead versions younger than this survive a sweep
    #[serde(default = "default_gc_age", with = "humantime_serde")]
    pub gc_age_threshold: Duration,

    /// XID value that triggers the remapping sweep
    #[serde(default = "default_xid_wrap")]
    pub xid_wrap_threshold: u64,

    /// Maximum concurrently active transactions
    #[serde(default = "default_max_txns")]
    pub max_active_txns: usize,
}

/// Session lifecycle tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Idle sessions older than this are reaped
    #[serde(default = "default_session_age", with = "humantime_serde")]
    pub max_age: Duration,

    /// Interval between session GC passes
    #[serde(default = "default_session_gc", with = "humantime_serde")]
    pub gc_interval: Duration,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl GatewayConfig {
    /// Load configuration from the standard search path.
    pub fn load() -> Result<Self> {
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Ok(p) = std::env::var("SQLEXEC_CONFIG") {
            candidates.push(PathBuf::from(p));
        }
        candidates.push(PathBuf::from("./config.json"));
        candidates.push(PathBuf::from("./config/config.json"));
        candidates.push(PathBuf::from("/etc/sqlexec/config.json"));

        for path in candidates {
            if path.is_file() {
                return Self::load_from(&path);
            }
        }

        tracing::info!("No configuration file found, using defaults");
        let config = Self::default();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        tracing::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Validate value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(Error::Config("server.port must be in 1-65535".into()));
        }
        if self.database.max_connections == 0 {
            return Err(Error::Config("database.max_connections must be >= 1".into()));
        }
        if self.pool.worker_pool.max_workers == 0 {
            return Err(Error::Config(
                "pool.goroutine_pool.max_workers must be >= 1".into(),
            ));
        }
        if self.pool.worker_pool.queue_size == 0 {
            return Err(Error::Config(
                "pool.goroutine_pool.queue_size must be >= 1".into(),
            ));
        }
        if self.pool.object_pool.max_size == 0 {
            return Err(Error::Config("pool.object_pool.max_size must be >= 1".into()));
        }
        if self.pool.object_pool.max_idle == 0 {
            return Err(Error::Config("pool.object_pool.max_idle must be >= 1".into()));
        }
        if self.pool.object_pool.min_idle > self.pool.object_pool.max_idle {
            return Err(Error::Config(
                "pool.object_pool.min_idle must not exceed max_idle".into(),
            ));
        }
        for (name, section) in [
            ("query_cache", &self.cache.query_cache),
            ("result_cache", &self.cache.result_cache),
            ("schema_cache", &self.cache.schema_cache),
        ] {
            if section.max_size == 0 {
                return Err(Error::Config(format!("cache.{name}.max_size must be >= 1")));
            }
        }
        if self.mvcc.max_active_txns == 0 {
            return Err(Error::Config("mvcc.max_active_txns must be >= 1".into()));
        }
        Ok(())
    }

    /// Render the default configuration as pretty JSON (used by `sqlexec init`).
    pub fn default_json() -> String {
        serde_json::to_string_pretty(&Self::default()).expect("default config serializes")
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            version: default_server_version(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            query_deadline: default_query_deadline(),
        }
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            queue_size: default_queue_size(),
        }
    }
}

impl Default for ObjectPoolConfig {
    fn default() -> Self {
        Self {
            max_size: default_object_max(),
            min_idle: 0,
            max_idle: default_object_idle(),
        }
    }
}

impl Default for CacheSectionConfig {
    fn default() -> Self {
        Self {
            max_size: default_cache_size(),
            ttl: default_cache_ttl(),
        }
    }
}

impl Default for MvccConfig {
    fn default() -> Self {
        Self {
            gc_interval: default_gc_interval(),
            gc_age_threshold: default_gc_age(),
            xid_wrap_threshold: default_xid_wrap(),
            max_active_txns: default_max_txns(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_age: default_session_age(),
            gc_interval: default_session_gc(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3306
}

fn default_server_version() -> String {
    "SqlExc".to_string()
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_connections() -> usize {
    128
}

fn default_query_deadline() -> Duration {
    Duration::from_secs(60)
}

fn default_max_workers() -> usize {
    4
}

fn default_queue_size() -> usize {
    256
}

fn default_object_max() -> usize {
    64
}

fn default_object_idle() -> usize {
    16
}

fn default_cache_size() -> usize {
    1024
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(60)
}

fn default_gc_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_gc_age() -> Duration {
    Duration::from_secs(3600)
}

fn default_xid_wrap() -> u64 {
    100_000
}

fn default_max_txns() -> usize {
    1024
}

fn default_session_age() -> Duration {
    Duration::from_secs(8 * 3600)
}

fn default_session_gc() -> Duration {
    Duration::from_secs(300)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}
