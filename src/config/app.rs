//! Application configuration structures.

use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::FixedOffset;
use serde::{Deserialize, Serialize};

use super::validation::{ConfigError, expand_env_vars};

// =============================================================================
// Constants
// =============================================================================

/// Default TCP listener port.
pub const DEFAULT_TCP_PORT: u16 = 8890;

/// Default UDP listener port.
pub const DEFAULT_UDP_PORT: u16 = 8889;

/// Default listener queue capacity.
pub const DEFAULT_BUFFER_SIZE: usize = 10_000;

/// Default consumer flush size.
pub const DEFAULT_FLUSH_SIZE: usize = 500;

/// Default consumer flush interval (100 milliseconds).
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Default billing index lifetime (60 seconds).
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

/// Default unmatched ring capacity.
pub const DEFAULT_UNMATCHED_CAPACITY: usize = 5_000;

/// Default ordinary API rate (requests per second).
pub const DEFAULT_RATE: u32 = 100;

/// Default batch ingestion rate (requests per second).
pub const DEFAULT_BATCH_RATE: u32 = 1_000;

fn default_max_connections() -> u32 {
    crate::storage::db::DEFAULT_MAX_CONNECTIONS
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_flush_size() -> usize {
    DEFAULT_FLUSH_SIZE
}

fn default_flush_interval() -> Duration {
    DEFAULT_FLUSH_INTERVAL
}

fn default_listener_host() -> String {
    "0.0.0.0".to_string()
}

fn default_cache_ttl() -> Duration {
    DEFAULT_CACHE_TTL
}

fn default_unmatched_capacity() -> usize {
    DEFAULT_UNMATCHED_CAPACITY
}

fn default_rate() -> u32 {
    DEFAULT_RATE
}

fn default_batch_rate() -> u32 {
    DEFAULT_BATCH_RATE
}

// =============================================================================
// Server Configuration
// =============================================================================

/// Web server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server bind address (default: "0.0.0.0").
    pub bind: String,

    /// Server port (default: 8888).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8888,
        }
    }
}

// =============================================================================
// Database Configuration
// =============================================================================

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database file path.
    pub path: String,

    /// Connection pool size (default: 5).
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/logbill.db".to_string(),
            max_connections: default_max_connections(),
        }
    }
}

impl DatabaseConfig {
    /// sqlx connection URL for the configured file.
    pub fn connection_url(&self) -> String {
        format!("sqlite:{}?mode=rwc", self.path)
    }
}

// =============================================================================
// Listener Configuration
// =============================================================================

/// TCP or UDP ingestion listener configuration.
///
/// A port of 0 is replaced by the transport default when the config is loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Whether the listener runs (default: false).
    #[serde(default)]
    pub enabled: bool,

    /// Bind host (default: "0.0.0.0").
    #[serde(default = "default_listener_host")]
    pub host: String,

    /// Bind port.
    #[serde(default)]
    pub port: u16,

    /// Shared secret events must carry in `secret` or `api_key`. Empty disables the check.
    #[serde(default)]
    pub secret: String,

    /// Bounded queue capacity between listener and consumer (default: 10000).
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Maximum time an event waits in the consumer buffer (default: "100ms").
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Buffered events that trigger an immediate flush (default: 500).
    #[serde(default = "default_flush_size")]
    pub flush_size: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_listener_host(),
            port: 0,
            secret: String::new(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            flush_size: DEFAULT_FLUSH_SIZE,
        }
    }
}

impl ListenerConfig {
    /// `host:port` for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        self.host.parse::<IpAddr>().map_err(|_| {
            ConfigError::ValidationError(format!("{name}: invalid host '{}'", self.host))
        })?;
        if self.buffer_size == 0 {
            return Err(ConfigError::ValidationError(format!(
                "{name}: buffer_size must be positive"
            )));
        }
        if self.flush_size == 0 {
            return Err(ConfigError::ValidationError(format!(
                "{name}: flush_size must be positive"
            )));
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::ValidationError(format!(
                "{name}: flush_interval must be positive"
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Rate Limit Configuration
// =============================================================================

/// HTTP rate limiter configuration.
///
/// A capacity of 0 means "same as the rate".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Ordinary API refill rate per second (default: 100).
    #[serde(default = "default_rate")]
    pub rate: u32,

    #[serde(default)]
    pub capacity: u32,

    /// Batch ingestion refill rate per second (default: 1000).
    #[serde(default = "default_batch_rate")]
    pub batch_rate: u32,

    #[serde(default)]
    pub batch_capacity: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rate: DEFAULT_RATE,
            capacity: 0,
            batch_rate: DEFAULT_BATCH_RATE,
            batch_capacity: 0,
        }
    }
}

// =============================================================================
// Billing Configuration
// =============================================================================

/// Billing index and classification tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingSettings {
    /// Maximum age of the cached billing index (default: "60s").
    #[serde(default = "default_cache_ttl", with = "humantime_serde")]
    pub cache_ttl: Duration,

    /// Distinct (tag, rule name) keys kept for unmatched billable events (default: 5000).
    #[serde(default = "default_unmatched_capacity")]
    pub unmatched_capacity: usize,

    /// Fixed offset such as "+08:00" used to assign billing dates.
    /// When unset, the process local time zone is used.
    #[serde(default)]
    pub utc_offset: Option<String>,
}

impl Default for BillingSettings {
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_CACHE_TTL,
            unmatched_capacity: DEFAULT_UNMATCHED_CAPACITY,
            utc_offset: None,
        }
    }
}

impl BillingSettings {
    /// Parsed `utc_offset`.
    pub fn fixed_offset(&self) -> Result<Option<FixedOffset>, ConfigError> {
        self.utc_offset
            .as_deref()
            .map(|s| {
                FixedOffset::from_str(s.trim()).map_err(|e| {
                    ConfigError::ValidationError(format!("billing utc_offset '{s}': {e}"))
                })
            })
            .transpose()
    }
}

// =============================================================================
// Application Configuration
// =============================================================================

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Web server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration.
    pub database: DatabaseConfig,

    /// Length-prefixed TCP ingestion.
    #[serde(default)]
    pub tcp: ListenerConfig,

    /// Datagram UDP ingestion.
    #[serde(default)]
    pub udp: ListenerConfig,

    /// HTTP rate limiting.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Days of log entries and metrics to keep. 0 or less keeps everything.
    #[serde(default)]
    pub retention_days: i64,

    /// Billing classification settings.
    #[serde(default)]
    pub billing: BillingSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        let mut config = Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            tcp: ListenerConfig::default(),
            udp: ListenerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            retention_days: 0,
            billing: BillingSettings::default(),
        };
        config.apply_defaults();
        config
    }
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// `${VAR}` and `${VAR:-default}` references are expanded before parsing.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse, default and validate configuration text.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_yaml::from_str(&expand_env_vars(content))?;
        config.apply_defaults();
        config.validate()?;
        Ok(config)
    }

    /// Fill transport-specific defaults that serde cannot express per field.
    pub fn apply_defaults(&mut self) {
        if self.tcp.port == 0 {
            self.tcp.port = DEFAULT_TCP_PORT;
        }
        if self.udp.port == 0 {
            self.udp.port = DEFAULT_UDP_PORT;
        }
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigError::ValidationError` if any field is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate server bind address
        self.server.bind.parse::<IpAddr>().map_err(|_| {
            ConfigError::ValidationError(format!(
                "invalid server bind address: '{}'",
                self.server.bind
            ))
        })?;

        // Validate server port
        if self.server.port == 0 {
            return Err(ConfigError::ValidationError(
                "server port must be non-zero".to_string(),
            ));
        }

        if self.database.path.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "database path cannot be empty".to_string(),
            ));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "database max_connections must be positive".to_string(),
            ));
        }

        self.tcp.validate("tcp")?;
        self.udp.validate("udp")?;

        if self.rate_limit.enabled && (self.rate_limit.rate == 0 || self.rate_limit.batch_rate == 0)
        {
            return Err(ConfigError::ValidationError(
                "rate_limit rate and batch_rate must be positive when enabled".to_string(),
            ));
        }

        if self.billing.unmatched_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "billing unmatched_capacity must be positive".to_string(),
            ));
        }
        if self.billing.cache_ttl.is_zero() {
            return Err(ConfigError::ValidationError(
                "billing cache_ttl must be positive".to_string(),
            ));
        }
        self.billing.fixed_offset()?;

        Ok(())
    }
}
