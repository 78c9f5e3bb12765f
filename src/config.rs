//! Configuration module for PulseWatch.
//!
//! Loads configuration from environment variables with sensible defaults.
//! Values are read once at startup; a malformed value is a fatal error.

use std::env;
use std::time::Duration;
use thiserror::Error;

/// Configuration error types.
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{name}: invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Seconds to sleep between scan cycles (default: 300)
    pub check_interval: Duration,
    /// Per-probe timeout (default: 10s)
    pub http_timeout: Duration,
    /// Verify TLS certificates when probing (default: true)
    pub verify_tls: bool,
    /// Upper bound on probes in flight during one cycle (default: 8)
    pub max_concurrent_probes: usize,
    /// Path to the SQLite database file (default: "pulsewatch.db")
    pub db_path: String,
    /// HTTP port for the target API (default: 8080)
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(300),
            http_timeout: Duration::from_secs(10),
            verify_tls: true,
            max_concurrent_probes: 8,
            db_path: "pulsewatch.db".to_string(),
            http_port: 8080,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// A `.env` file in the working directory is applied first if present.
    ///
    /// Environment variables:
    /// - `PULSEWATCH_CHECK_INTERVAL_SECONDS`: scan interval (default: 300)
    /// - `PULSEWATCH_HTTP_TIMEOUT_SECONDS`: probe timeout (default: 10)
    /// - `PULSEWATCH_HTTP_VERIFY_TLS`: verify certificates (default: true)
    /// - `PULSEWATCH_MAX_CONCURRENT_PROBES`: worker pool size (default: 8)
    /// - `PULSEWATCH_DB_PATH`: database file path (default: "pulsewatch.db")
    /// - `PULSEWATCH_HTTP_PORT`: API port (default: 8080)
    pub fn load() -> Result<Self, ConfigError> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                tracing::warn!("Ignoring unreadable .env file: {}", e);
            }
        }
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(secs) = parse_var::<u64, _>(&lookup, "PULSEWATCH_CHECK_INTERVAL_SECONDS")? {
            cfg.check_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "PULSEWATCH_HTTP_TIMEOUT_SECONDS")? {
            cfg.http_timeout = Duration::from_secs(secs);
        }
        if let Some(raw) = lookup("PULSEWATCH_HTTP_VERIFY_TLS") {
            cfg.verify_tls = parse_bool(&raw).ok_or(ConfigError::Invalid {
                name: "PULSEWATCH_HTTP_VERIFY_TLS",
                value: raw,
            })?;
        }
        if let Some(n) = parse_var(&lookup, "PULSEWATCH_MAX_CONCURRENT_PROBES")? {
            cfg.max_concurrent_probes = n;
        }
        if let Some(db_path) = lookup("PULSEWATCH_DB_PATH") {
            cfg.db_path = db_path;
        }
        if let Some(port) = parse_var(&lookup, "PULSEWATCH_HTTP_PORT")? {
            cfg.http_port = port;
        }

        if cfg.check_interval.is_zero() {
            return Err(ConfigError::Zero("PULSEWATCH_CHECK_INTERVAL_SECONDS"));
        }
        if cfg.http_timeout.is_zero() {
            return Err(ConfigError::Zero("PULSEWATCH_HTTP_TIMEOUT_SECONDS"));
        }
        if cfg.max_concurrent_probes == 0 {
            return Err(ConfigError::Zero("PULSEWATCH_MAX_CONCURRENT_PROBES"));
        }

        Ok(cfg)
    }
}

fn parse_var<T, F>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
