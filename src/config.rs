//! Operator configuration
//!
//! Read once at startup from `WEBAPP_OPERATOR_*` environment variables.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

const ENV_PREFIX: &str = "WEBAPP_OPERATOR_";

/// Default metrics port
pub const DEFAULT_METRICS_PORT: u16 = 8080;

/// Default number of reconcile workers
pub const DEFAULT_WORKERS: usize = 4;

/// Operator settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Port of the metrics and health server
    pub metrics_port: u16,
    /// Number of keys reconciled in parallel
    pub workers: usize,
    /// Deadline of one reconcile pass
    pub reconcile_timeout: Duration,
    /// First retry delay after a transient failure
    pub backoff_base: Duration,
    /// Longest retry delay
    pub backoff_max: Duration,
    /// Namespace to watch; all namespaces when unset
    pub watch_namespace: Option<String>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            metrics_port: DEFAULT_METRICS_PORT,
            workers: DEFAULT_WORKERS,
            reconcile_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
            watch_namespace: None,
        }
    }
}

impl OperatorConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from `lookup`, which maps a full variable name to its value
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            metrics_port: parse(&lookup, "METRICS_PORT", defaults.metrics_port)?,
            workers: parse(&lookup, "WORKERS", defaults.workers)?,
            reconcile_timeout: Duration::from_secs(parse(
                &lookup,
                "RECONCILE_TIMEOUT_SECS",
                defaults.reconcile_timeout.as_secs(),
            )?),
            backoff_base: Duration::from_secs(parse(
                &lookup,
                "BACKOFF_BASE_SECS",
                defaults.backoff_base.as_secs(),
            )?),
            backoff_max: Duration::from_secs(parse(
                &lookup,
                "BACKOFF_MAX_SECS",
                defaults.backoff_max.as_secs(),
            )?),
            watch_namespace: lookup(format!("{}WATCH_NAMESPACE", ENV_PREFIX).as_str())
                .map(|ns| ns.trim().to_string())
                .filter(|ns| !ns.is_empty()),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::config("WORKERS must be at least 1"));
        }
        if self.reconcile_timeout.is_zero() {
            return Err(Error::config("RECONCILE_TIMEOUT_SECS must be at least 1"));
        }
        if self.backoff_base.is_zero() {
            return Err(Error::config("BACKOFF_BASE_SECS must be at least 1"));
        }
        if self.backoff_base > self.backoff_max {
            return Err(Error::config(format!(
                "BACKOFF_BASE_SECS ({}) must not exceed BACKOFF_MAX_SECS ({})",
                self.backoff_base.as_secs(),
                self.backoff_max.as_secs()
            )));
        }
        Ok(())
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    let key = format!("{}{}", ENV_PREFIX, name);
    match lookup(key.as_str()) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::config(format!("Invalid {} '{}': {}", key, raw, e))),
        None => Ok(default),
    }
}
