//! Server configuration loaded from environment variables.
//!
//! Every knob has a default so a bare `cargo run` serves a single in-memory
//! replica on port 3000.

use std::time::Duration;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_LOCK_TTL_MS: u64 = 1000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 50;
const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Lease renewal runs every `ttl / RENEWAL_DIVISOR`.
pub const RENEWAL_DIVISOR: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("LOCK_TTL_MS must be at least {RENEWAL_DIVISOR}ms, got {0}ms")]
    LockTtlTooShort(u64),
    #[error("POLL_INTERVAL_MS must be positive")]
    ZeroPollInterval,
    #[error("OUTBOUND_CAPACITY must be positive")]
    ZeroOutboundCapacity,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Postgres backend when set, in-memory backend otherwise.
    pub database_url: Option<String>,
    /// Namespace shared by every replica of one store.
    pub prefix: String,
    /// Use the lease/broadcast queue instead of the in-process queue.
    pub replicated: bool,
    pub lock_ttl: Duration,
    /// Fallback poll interval for an idle dispatcher.
    pub poll_interval: Duration,
    /// Connections presenting this token are managers.
    pub manager_token: Option<String>,
    /// Per-connection outbound buffer.
    pub outbound_capacity: usize,
}

impl ServerConfig {
    /// Read `PORT`, `DATABASE_URL`, `STORE_PREFIX`, `REPLICATED`,
    /// `LOCK_TTL_MS`, `POLL_INTERVAL_MS`, `MANAGER_TOKEN`, and
    /// `OUTBOUND_CAPACITY`.
    ///
    /// # Errors
    ///
    /// Returns an error if a timing or capacity knob is out of range.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = env_string("DATABASE_URL");
        let config = Self {
            port: env_parse("PORT", DEFAULT_PORT),
            replicated: env_parse("REPLICATED", database_url.is_some()),
            database_url,
            prefix: env_string("STORE_PREFIX").unwrap_or_default(),
            lock_ttl: Duration::from_millis(env_parse("LOCK_TTL_MS", DEFAULT_LOCK_TTL_MS)),
            poll_interval: Duration::from_millis(env_parse("POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS)),
            manager_token: env_string("MANAGER_TOKEN"),
            outbound_capacity: env_parse("OUTBOUND_CAPACITY", DEFAULT_OUTBOUND_CAPACITY),
        };
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns the first out-of-range knob.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ttl_ms = u64::try_from(self.lock_ttl.as_millis()).unwrap_or(u64::MAX);
        if ttl_ms < u64::from(RENEWAL_DIVISOR) {
            return Err(ConfigError::LockTtlTooShort(ttl_ms));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ZeroPollInterval);
        }
        if self.outbound_capacity == 0 {
            return Err(ConfigError::ZeroOutboundCapacity);
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            database_url: None,
            prefix: String::new(),
            replicated: false,
            lock_ttl: Duration::from_millis(DEFAULT_LOCK_TTL_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            manager_token: None,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
