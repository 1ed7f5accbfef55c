//! Watcher configuration loading.
//!
//! TOML is the config source. `IRCCLOUD_EMAIL` and `IRCCLOUD_PASSWORD`
//! override the credentials when set and non-empty.
//! Default config path: `watcher.toml`.
//!
//! # Required fields
//! - `email`, `password` (file or environment)
//! - `database_path`
//! - `summary_output_path`
//! - `summary_time` (cron-style `"M H * * *"`)
//!
//! Duration fields under `[connection]` take humantime strings such as
//! `"30s"` or `"5m"`. An unparsable duration falls back to its default
//! with a warning instead of failing startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::auth::{Credentials, DEFAULT_BASE_URL, Endpoints};
use crate::backoff::{
    DEFAULT_INITIAL_DELAY, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY, DEFAULT_MULTIPLIER, RetryPolicy,
};
use crate::connection::{ConnectionSettings, DEFAULT_CONNECT_TIMEOUT};
use crate::session_cache::DEFAULT_FRESHNESS;
use crate::stream::{DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_PING_INTERVAL, StreamSettings};
use crate::summary::DailySchedule;

pub const DEFAULT_CONFIG_PATH: &str = "watcher.toml";
pub const ENV_EMAIL: &str = "IRCCLOUD_EMAIL";
pub const ENV_PASSWORD: &str = "IRCCLOUD_PASSWORD";

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub credentials: Credentials,
    /// Allow-list; empty admits every channel not ignored.
    pub channels: Vec<String>,
    pub ignored_channels: Vec<String>,
    pub database_path: PathBuf,
    pub summary: SummaryConfig,
    pub connection: ConnectionConfig,
    pub endpoints: Endpoints,
    pub backfill: BackfillConfig,
    pub debug: bool,
}

#[derive(Debug, Clone)]
pub struct SummaryConfig {
    pub output_path: PathBuf,
    /// Expression as written, for logging.
    pub time: String,
    pub schedule: DailySchedule,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    pub heartbeat_interval: Duration,
    pub ping_interval: Duration,
    pub connection_timeout: Duration,
    pub auth_freshness: Duration,
    pub retry: RetryPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            ping_interval: DEFAULT_PING_INTERVAL,
            connection_timeout: DEFAULT_CONNECT_TIMEOUT,
            auth_freshness: DEFAULT_FRESHNESS,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillConfig {
    /// Cap on `buffer_msg` entries taken from one batch; 0 is unlimited.
    pub max_batch_events: usize,
}

impl WatcherConfig {
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            retry: self.connection.retry.clone(),
            connect_timeout: self.connection.connection_timeout,
            auth_freshness: self.connection.auth_freshness,
        }
    }

    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            heartbeat_interval: self.connection.heartbeat_interval,
            ping_interval: self.connection.ping_interval,
            debug: self.debug,
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    email: Option<String>,
    password: Option<String>,
    channels: Option<Vec<String>>,
    ignored_channels: Option<Vec<String>>,
    database_path: Option<String>,
    summary_output_path: Option<String>,
    summary_time: Option<String>,
    debug: Option<bool>,
    connection: Option<RawConnectionConfig>,
    endpoints: Option<RawEndpointsConfig>,
    backfill: Option<RawBackfillConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct RawConnectionConfig {
    heartbeat_interval: Option<String>,
    ping_interval: Option<String>,
    connection_timeout: Option<String>,
    auth_freshness: Option<String>,
    initial_retry_delay: Option<String>,
    max_retry_delay: Option<String>,
    max_retry_attempts: Option<u32>,
    backoff_multiplier: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawEndpointsConfig {
    base_url: Option<String>,
    stream_url: Option<String>,
    origin: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawBackfillConfig {
    max_batch_events: Option<usize>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from `path`, applying environment overrides.
pub fn load_config_from_path(path: &Path) -> Result<WatcherConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str_with_env(&toml_str, |key| std::env::var(key).ok())
}

/// Load config from a TOML string; `env` supplies the credential overrides.
pub fn load_config_from_str_with_env<F>(toml_str: &str, env: F) -> Result<WatcherConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let env_or = |key: &str, file: Option<String>| env(key).filter(|v| !v.is_empty()).or(file);
    let email = env_or(ENV_EMAIL, raw.email)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::MissingField(format!("email (or {ENV_EMAIL})")))?;
    let password = env_or(ENV_PASSWORD, raw.password)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::MissingField(format!("password (or {ENV_PASSWORD})")))?;

    let database_path = required(raw.database_path, "database_path")?;
    let output_path = required(raw.summary_output_path, "summary_output_path")?;
    let time = required(raw.summary_time, "summary_time")?;
    let schedule =
        DailySchedule::parse(&time).map_err(|e| ConfigError::InvalidValue(e.to_string()))?;

    let endpoints = match raw.endpoints {
        Some(e) => {
            let mut endpoints =
                Endpoints::for_base(e.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL));
            if let Some(url) = e.stream_url {
                endpoints.fallback_stream_url = url;
            }
            if let Some(origin) = e.origin {
                endpoints.origin = origin;
            }
            endpoints
        }
        None => Endpoints::default(),
    };

    Ok(WatcherConfig {
        credentials: Credentials { email, password },
        channels: raw.channels.unwrap_or_default(),
        ignored_channels: raw.ignored_channels.unwrap_or_default(),
        database_path: PathBuf::from(database_path),
        summary: SummaryConfig {
            output_path: PathBuf::from(output_path),
            time,
            schedule,
        },
        connection: connection_config(raw.connection.unwrap_or_default()),
        endpoints,
        backfill: BackfillConfig {
            max_batch_events: raw.backfill.and_then(|b| b.max_batch_events).unwrap_or(0),
        },
        debug: raw.debug.unwrap_or(false),
    })
}

fn required(value: Option<String>, field: &str) -> Result<String, ConfigError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingField(field.to_owned()))
}

fn connection_config(raw: RawConnectionConfig) -> ConnectionConfig {
    let multiplier = match raw.backoff_multiplier {
        Some(m) if m.is_finite() && m > 0.0 => m,
        Some(m) => {
            warn!(value = m, default = DEFAULT_MULTIPLIER, "invalid connection.backoff_multiplier, using default");
            DEFAULT_MULTIPLIER
        }
        None => DEFAULT_MULTIPLIER,
    };
    ConnectionConfig {
        heartbeat_interval: duration_or_default(
            "connection.heartbeat_interval",
            raw.heartbeat_interval,
            DEFAULT_HEARTBEAT_INTERVAL,
        ),
        ping_interval: duration_or_default(
            "connection.ping_interval",
            raw.ping_interval,
            DEFAULT_PING_INTERVAL,
        ),
        connection_timeout: duration_or_default(
            "connection.connection_timeout",
            raw.connection_timeout,
            DEFAULT_CONNECT_TIMEOUT,
        ),
        auth_freshness: duration_or_default(
            "connection.auth_freshness",
            raw.auth_freshness,
            DEFAULT_FRESHNESS,
        ),
        retry: RetryPolicy {
            initial_delay: duration_or_default(
                "connection.initial_retry_delay",
                raw.initial_retry_delay,
                DEFAULT_INITIAL_DELAY,
            ),
            multiplier,
            max_delay: duration_or_default(
                "connection.max_retry_delay",
                raw.max_retry_delay,
                DEFAULT_MAX_DELAY,
            ),
            max_attempts: raw
                .max_retry_attempts
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_MAX_ATTEMPTS),
        },
    }
}

/// Zero-length intervals would spin the stream timers, so they count as invalid too.
fn duration_or_default(field: &str, raw: Option<String>, default: Duration) -> Duration {
    let Some(raw) = raw else {
        return default;
    };
    match humantime::parse_duration(raw.trim()) {
        Ok(d) if !d.is_zero() => d,
        Ok(_) => {
            warn!(field, value = %raw, default = ?default, "zero duration, using default");
            default
        }
        Err(e) => {
            warn!(field, value = %raw, default = ?default, error = %e, "unparsable duration, using default");
            default
        }
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}
