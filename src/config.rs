//! Configuration module for the logbill service.
//!
//! Provides YAML-based configuration loading and validation for:
//! - Server settings (port, bind address)
//! - Database settings (path, pool size)
//! - TCP and UDP listeners (address, queue size, flush policy, shared secret)
//! - Rate limiting, retention and billing cache tuning

mod app;
mod validation;

pub use app::{
    AppConfig, BillingSettings, DatabaseConfig, ListenerConfig, RateLimitConfig, ServerConfig,
};
pub use validation::{ConfigError, expand_env_vars};

// Re-export constants
pub use app::{
    DEFAULT_BUFFER_SIZE, DEFAULT_CACHE_TTL, DEFAULT_FLUSH_INTERVAL, DEFAULT_FLUSH_SIZE,
    DEFAULT_TCP_PORT, DEFAULT_UDP_PORT, DEFAULT_UNMATCHED_CAPACITY,
};
