//! Aggregator configuration from environment variables

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// What the worker does with queued events when told to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Close the queue to new events, process everything already queued
    Drain,
    /// Close the queue and discard whatever is still queued
    Abandon,
}

impl ShutdownMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownMode::Drain => "drain",
            ShutdownMode::Abandon => "abandon",
        }
    }
}

impl fmt::Display for ShutdownMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShutdownMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "drain" => Ok(ShutdownMode::Drain),
            "abandon" => Ok(ShutdownMode::Abandon),
            other => Err(format!("unknown shutdown mode '{}'", other)),
        }
    }
}

/// Bounded retry with exponential backoff for transient store faults
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; 0 disables retrying
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(2_000),
        }
    }
}

/// Configuration for the aggregator runtime.
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatorConfig {
    /// Path to the SQLite database file
    pub db_path: PathBuf,

    /// Ingest queue capacity; `None` means unbounded
    pub queue_capacity: Option<usize>,

    pub retry: RetryPolicy,

    /// Shutdown behaviour on Ctrl-C
    pub shutdown_mode: ShutdownMode,

    /// How often the binary logs a stats line
    pub stats_interval: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/dedup_store.db"),
            queue_capacity: Some(10_000),
            retry: RetryPolicy::default(),
            shutdown_mode: ShutdownMode::Drain,
            stats_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {var}: '{value}' ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl AggregatorConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `EVENTFLOW_DB_PATH` (default: data/dedup_store.db)
    /// - `EVENTFLOW_QUEUE_CAPACITY` (default: 10000, 0 = unbounded)
    /// - `EVENTFLOW_STORE_MAX_RETRIES` (default: 5)
    /// - `EVENTFLOW_RETRY_INITIAL_MS` (default: 50)
    /// - `EVENTFLOW_RETRY_MAX_MS` (default: 2000)
    /// - `EVENTFLOW_SHUTDOWN_MODE` (default: drain)
    /// - `EVENTFLOW_STATS_INTERVAL_SECS` (default: 10)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let db_path = lookup("EVENTFLOW_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let queue_capacity = match parse_var::<usize, _>(&lookup, "EVENTFLOW_QUEUE_CAPACITY")? {
            Some(0) => None,
            Some(n) => Some(n),
            None => defaults.queue_capacity,
        };

        let retry = RetryPolicy {
            max_retries: parse_var(&lookup, "EVENTFLOW_STORE_MAX_RETRIES")?
                .unwrap_or(defaults.retry.max_retries),
            initial_backoff: parse_var(&lookup, "EVENTFLOW_RETRY_INITIAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.initial_backoff),
            max_backoff: parse_var(&lookup, "EVENTFLOW_RETRY_MAX_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.max_backoff),
        };

        let shutdown_mode = parse_var(&lookup, "EVENTFLOW_SHUTDOWN_MODE")?
            .unwrap_or(defaults.shutdown_mode);

        let stats_interval = match parse_var::<u64, _>(&lookup, "EVENTFLOW_STATS_INTERVAL_SECS")? {
            Some(0) => {
                return Err(ConfigError::InvalidValue {
                    var: "EVENTFLOW_STATS_INTERVAL_SECS",
                    value: "0".to_string(),
                    reason: "must be at least 1".to_string(),
                })
            }
            Some(secs) => Duration::from_secs(secs),
            None => defaults.stats_interval,
        };

        Ok(Self {
            db_path,
            queue_capacity,
            retry,
            shutdown_mode,
            stats_interval,
        })
    }
}

fn parse_var<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                var,
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}
