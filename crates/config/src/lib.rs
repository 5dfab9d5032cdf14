//! Configuration module for the registrar engine.

use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
    #[error("Unknown configuration key: {0}")]
    UnknownKey(String),
}

/// Configuration keys the engine recognizes. Any other `REGISTRAR_`-prefixed
/// environment variable is rejected at startup.
const KNOWN_KEYS: &[&str] = &[
    "REGISTRAR_BIND_ADDRESS",
    "REGISTRAR_DATABASE_URL",
    "REGISTRAR_JWT_SECRET",
    "REGISTRAR_LOCK_WAIT_TIMEOUT_MS",
    "REGISTRAR_LOCK_HOLD_TTL_MS",
    "REGISTRAR_SNAPSHOT_INTERVAL",
    "REGISTRAR_MAX_RETRIES",
    "REGISTRAR_CREDIT_CAP_DEFAULT",
    "REGISTRAR_MAX_WAITLIST",
    "REGISTRAR_ADD_DROP_OFFSET_DAYS",
    "REGISTRAR_TIMEZONE",
    "REGISTRAR_HISTORY_WINDOW_DAYS",
    "REGISTRAR_CATALOG_PATH",
];

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Address to bind the server to
    pub bind_address: String,
    /// SQLite database URL for the event, snapshot, and audit collections
    pub database_url: String,
    /// JWT secret for bearer token verification
    pub jwt_secret: String,
    /// How long a request waits for a busy section lock (milliseconds)
    pub lock_wait_timeout_ms: u64,
    /// How long an acquired section lock is held before it is reapable (milliseconds)
    pub lock_hold_ttl_ms: u64,
    /// A stream snapshot is written every this many events
    pub snapshot_interval: u64,
    /// Bounded retries after an optimistic concurrency conflict
    pub max_retries: u32,
    /// Per-term credit cap applied when the student profile has none
    pub credit_cap_default: u32,
    /// Maximum waitlist length per section
    pub max_waitlist: u32,
    /// Default add/drop deadline offset for catalog sections without one (days)
    pub add_drop_offset_days: i64,
    /// Semester timezone; all schedule times are wall-clock in this zone
    pub timezone: String,
    /// How far back dropped enrollments are reported (days)
    pub history_window_days: i64,
    /// Optional JSON catalog seeding the in-memory campus directory
    pub catalog_path: Option<String>,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        reject_unknown_keys(env::vars().map(|(k, _)| k))?;

        let config = Self {
            bind_address: env_var_or("REGISTRAR_BIND_ADDRESS", "0.0.0.0:8080"),
            database_url: env_var_or("REGISTRAR_DATABASE_URL", "sqlite://registrar.db"),
            jwt_secret: env_var("REGISTRAR_JWT_SECRET")?,
            lock_wait_timeout_ms: env_parse("REGISTRAR_LOCK_WAIT_TIMEOUT_MS", 5_000)?,
            lock_hold_ttl_ms: env_parse("REGISTRAR_LOCK_HOLD_TTL_MS", 30_000)?,
            snapshot_interval: env_parse("REGISTRAR_SNAPSHOT_INTERVAL", 100)?,
            max_retries: env_parse("REGISTRAR_MAX_RETRIES", 3)?,
            credit_cap_default: env_parse("REGISTRAR_CREDIT_CAP_DEFAULT", 18)?,
            max_waitlist: env_parse("REGISTRAR_MAX_WAITLIST", 10)?,
            add_drop_offset_days: env_parse("REGISTRAR_ADD_DROP_OFFSET_DAYS", 14)?,
            timezone: env_var_or("REGISTRAR_TIMEZONE", "UTC"),
            history_window_days: env_parse("REGISTRAR_HISTORY_WINDOW_DAYS", 30)?,
            catalog_path: env::var("REGISTRAR_CATALOG_PATH").ok(),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.snapshot_interval == 0 {
            return Err(ConfigError::InvalidValue(
                "REGISTRAR_SNAPSHOT_INTERVAL".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        if self.lock_hold_ttl_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "REGISTRAR_LOCK_HOLD_TTL_MS".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        if self.timezone.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "REGISTRAR_TIMEZONE".to_string(),
                "must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_wait_timeout_ms)
    }

    pub fn lock_hold_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_hold_ttl_ms)
    }
}

fn reject_unknown_keys(keys: impl Iterator<Item = String>) -> Result<(), ConfigError> {
    let known: HashSet<&str> = KNOWN_KEYS.iter().copied().collect();
    for key in keys {
        if key.starts_with("REGISTRAR_") && !known.contains(key.as_str()) {
            return Err(ConfigError::UnknownKey(key));
        }
    }
    Ok(())
}

fn env_var(name: &str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingVar(name.to_string()))
}

fn env_var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name.to_string(), raw)),
        Err(_) => Ok(default),
    }
}
