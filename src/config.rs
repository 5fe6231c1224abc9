//! Configuration types for anvilq.
//!
//! This module contains all configuration structures used throughout anvilq,
//! including store settings, engine parameters and the producer/consumer
//! network endpoints.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for anvilq.
///
/// # Examples
///
/// ```rust
/// use anvilq::config::{AnvilConfig, ConsumerConfig};
///
/// // Use default configuration
/// let config = AnvilConfig::default();
///
/// // Custom configuration
/// let config = AnvilConfig {
///     consumer: ConsumerConfig {
///         retry_interval_ms: 1000,
///         ..Default::default()
///     },
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnvilConfig {
    /// Task store configuration
    pub store: StoreConfig,

    /// Queue engine configuration
    pub engine: EngineConfig,

    /// Producer (server) configuration
    pub producer: ProducerConfig,

    /// Consumer (worker client) configuration
    pub consumer: ConsumerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Task store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Which backend to use
    pub backend: StoreBackendConfig,

    /// Maximum wait for the isolation lock (in milliseconds)
    pub lock_timeout_ms: u64,

    /// Fallback poll interval when waiting for change notifications (in milliseconds)
    pub change_poll_interval_ms: u64,

    /// Cursor paging and split settings
    pub cursor: CursorConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackendConfig::InMemory,
            lock_timeout_ms: 10_000,
            change_poll_interval_ms: 1000,
            cursor: CursorConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Create configuration for the in-memory store.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Create configuration for the PostgreSQL store.
    #[cfg(feature = "postgres-store")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres-store")))]
    pub fn postgres(connection_string: impl Into<String>) -> Self {
        Self {
            backend: StoreBackendConfig::Postgres(PostgresConfig {
                connection_string: connection_string.into(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Set the isolation lock timeout.
    pub fn with_lock_timeout(mut self, timeout_ms: u64) -> Self {
        self.lock_timeout_ms = timeout_ms;
        self
    }

    /// Set the change poll fallback.
    pub fn with_change_poll_interval(mut self, interval_ms: u64) -> Self {
        self.change_poll_interval_ms = interval_ms;
        self
    }

    /// Set the cursor configuration.
    pub fn with_cursor(mut self, cursor: CursorConfig) -> Self {
        self.cursor = cursor;
        self
    }

    /// Lock timeout as a [`Duration`].
    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout_ms.millis()
    }

    /// Change poll fallback as a [`Duration`].
    pub fn change_poll_interval(&self) -> Duration {
        self.change_poll_interval_ms.millis()
    }
}

/// Store backend-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StoreBackendConfig {
    /// In-memory store (default)
    InMemory,

    /// PostgreSQL store configuration
    #[cfg(feature = "postgres-store")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres-store")))]
    Postgres(PostgresConfig),
}

/// PostgreSQL store configuration.
#[cfg(feature = "postgres-store")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres-store")))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// PostgreSQL connection string
    pub connection_string: String,

    /// Connection pool size
    pub pool_size: u32,

    /// Base table name, auxiliary tables derive their names from it
    pub table_name: String,
}

#[cfg(feature = "postgres-store")]
impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            connection_string: "postgresql://localhost/anvilq".to_string(),
            pool_size: 10,
            table_name: "anvilq_tasks".to_string(),
        }
    }
}

/// Paging and parallel split settings for chunked cursors.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CursorConfig {
    /// Rows fetched per page
    pub page_size: u64,

    /// Results smaller than this are never split
    pub parallel_threshold: u64,

    /// Results up to this size split in two, larger ones in four
    pub four_way_threshold: u64,
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            page_size: 40_000,
            parallel_threshold: 10_000,
            four_way_threshold: 40_000,
        }
    }
}

/// Queue engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How long `acquire` sleeps between selection attempts without a change signal (in milliseconds)
    pub acquire_poll_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            acquire_poll_interval_ms: 1000,
        }
    }
}

impl EngineConfig {
    /// Set the acquire poll interval.
    pub fn with_poll_interval(mut self, interval_ms: u64) -> Self {
        self.acquire_poll_interval_ms = interval_ms;
        self
    }

    /// Acquire poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        self.acquire_poll_interval_ms.millis()
    }
}

/// Producer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// Address the producer listens on
    pub bind_address: String,

    /// Largest accepted frame (in bytes)
    pub max_frame_length: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:7070".to_string(),
            max_frame_length: 8 * 1024 * 1024, // 8MB
        }
    }
}

impl ProducerConfig {
    /// Listen on a specific address.
    pub fn bind(address: impl Into<String>) -> Self {
        Self {
            bind_address: address.into(),
            ..Default::default()
        }
    }

    /// Set the maximum frame length.
    pub fn with_max_frame_length(mut self, length: usize) -> Self {
        self.max_frame_length = length;
        self
    }
}

/// Consumer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Producer address to connect to
    pub host_address: String,

    /// Timeout for establishing a connection (in milliseconds)
    pub connect_timeout_ms: u64,

    /// Delay between reconnect attempts (in milliseconds, 0 disables reconnecting)
    pub retry_interval_ms: u64,

    /// How often the connection liveness is checked (in milliseconds)
    pub liveness_interval_ms: u64,

    /// Largest accepted frame (in bytes)
    pub max_frame_length: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            host_address: "127.0.0.1:7070".to_string(),
            connect_timeout_ms: 30_000,
            retry_interval_ms: 5000,
            liveness_interval_ms: 1000,
            max_frame_length: 8 * 1024 * 1024, // 8MB
        }
    }
}

impl ConsumerConfig {
    /// Connect to a specific producer address.
    pub fn connect_to(address: impl Into<String>) -> Self {
        Self {
            host_address: address.into(),
            ..Default::default()
        }
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = timeout_ms;
        self
    }

    /// Set the reconnect interval. Zero disables reconnecting.
    pub fn with_retry_interval(mut self, interval_ms: u64) -> Self {
        self.retry_interval_ms = interval_ms;
        self
    }

    /// Set the liveness check interval.
    pub fn with_liveness_interval(mut self, interval_ms: u64) -> Self {
        self.liveness_interval_ms = interval_ms;
        self
    }

    /// Connect timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout_ms.millis()
    }

    /// Reconnect interval as a [`Duration`], `None` when reconnecting is disabled.
    pub fn retry_interval(&self) -> Option<Duration> {
        (self.retry_interval_ms > 0).then(|| self.retry_interval_ms.millis())
    }

    /// Liveness interval as a [`Duration`].
    pub fn liveness_interval(&self) -> Duration {
        self.liveness_interval_ms.millis()
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter
    pub level: LogLevel,

    /// Enable structured JSON logging
    pub json_format: bool,

    /// Enable colored output (ignored if json_format is true)
    pub colored: bool,

    /// Include timestamps in logs
    pub include_timestamps: bool,

    /// Include target module in logs
    pub include_targets: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json_format: false,
            colored: true,
            include_timestamps: true,
            include_targets: false,
        }
    }
}

/// Log level enumeration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// Helper trait for converting durations in configuration.
pub trait DurationExt {
    /// Convert seconds to Duration
    fn secs(self) -> Duration;
    /// Convert milliseconds to Duration
    fn millis(self) -> Duration;
}

impl DurationExt for u64 {
    fn secs(self) -> Duration {
        Duration::from_secs(self)
    }

    fn millis(self) -> Duration {
        Duration::from_millis(self)
    }
}

impl AnvilConfig {
    /// Create a new configuration optimized for development.
    pub fn development() -> Self {
        Self {
            store: StoreConfig {
                lock_timeout_ms: 5000,
                ..Default::default()
            },
            consumer: ConsumerConfig {
                retry_interval_ms: 1000,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: LogLevel::Debug,
                colored: true,
                include_targets: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Create a new configuration optimized for production.
    pub fn production() -> Self {
        Self {
            store: StoreConfig {
                lock_timeout_ms: 30_000,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: LogLevel::Info,
                json_format: true,
                colored: false,
                include_timestamps: true,
                include_targets: false,
            },
            ..Default::default()
        }
    }

    /// Create a configuration for testing.
    pub fn testing() -> Self {
        Self {
            store: StoreConfig {
                lock_timeout_ms: 2000,
                change_poll_interval_ms: 50,
                ..Default::default()
            },
            engine: EngineConfig {
                acquire_poll_interval_ms: 50,
            },
            producer: ProducerConfig::bind("127.0.0.1:0"),
            consumer: ConsumerConfig {
                connect_timeout_ms: 2000,
                retry_interval_ms: 100,
                liveness_interval_ms: 100,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: LogLevel::Debug,
                colored: false,
                include_timestamps: false,
                include_targets: true,
                ..Default::default()
            },
        }
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        // Validate store config
        if self.store.lock_timeout_ms == 0 {
            errors.push("Lock timeout must be greater than 0".to_string());
        }

        if self.store.change_poll_interval_ms == 0 {
            errors.push("Change poll interval must be greater than 0".to_string());
        }

        let cursor = &self.store.cursor;
        if cursor.page_size == 0 {
            errors.push("Cursor page size must be greater than 0".to_string());
        }

        if cursor.four_way_threshold < cursor.parallel_threshold {
            errors.push(
                "Cursor four-way threshold must be greater than or equal to the parallel threshold"
                    .to_string(),
            );
        }

        #[cfg(feature = "postgres-store")]
        if let StoreBackendConfig::Postgres(pg) = &self.store.backend {
            if pg.pool_size == 0 {
                errors.push("Postgres pool size must be greater than 0".to_string());
            }
            if pg.table_name.is_empty() {
                errors.push("Postgres table name must not be empty".to_string());
            }
        }

        // Validate engine config
        if self.engine.acquire_poll_interval_ms == 0 {
            errors.push("Acquire poll interval must be greater than 0".to_string());
        }

        // Validate network config
        if self.producer.bind_address.is_empty() {
            errors.push("Producer bind address must not be empty".to_string());
        }

        if self.consumer.host_address.is_empty() {
            errors.push("Consumer host address must not be empty".to_string());
        }

        if self.consumer.connect_timeout_ms == 0 {
            errors.push("Connect timeout must be greater than 0".to_string());
        }

        if self.consumer.liveness_interval_ms == 0 {
            errors.push("Liveness interval must be greater than 0".to_string());
        }

        if self.producer.max_frame_length == 0 || self.consumer.max_frame_length == 0 {
            errors.push("Max frame length must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
