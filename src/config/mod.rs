//! Queue tuning knobs.
//!
//! Every field has a sensible default, so `QueueConfig::default()` is
//! usually enough. Deployments can override values from the environment
//! or from a TOML document; both fail fast on malformed input.

mod duration_ms;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const ENV_NAME: &str = "PRIOQ_NAME";
const ENV_METRICS_INTERVAL: &str = "PRIOQ_METRICS_INTERVAL_MS";
const ENV_LOG_INTERVAL: &str = "PRIOQ_LOG_INTERVAL_MS";
const ENV_BACKOFF_BASE: &str = "PRIOQ_BACKOFF_BASE_MS";
const ENV_BACKOFF_MAX: &str = "PRIOQ_BACKOFF_MAX_MS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue name, used as the metrics label and in log output.
    pub name: String,
    /// How often the unfinished-work gauges are refreshed.
    #[serde(rename = "metrics_update_interval_ms", with = "duration_ms")]
    pub metrics_update_interval: Duration,
    /// How often pending items are dumped at trace level.
    #[serde(rename = "log_interval_ms", with = "duration_ms")]
    pub log_interval: Duration,
    /// First delay of the default exponential rate limiter.
    #[serde(rename = "backoff_base_ms", with = "duration_ms")]
    pub backoff_base: Duration,
    /// Upper bound of the default exponential rate limiter.
    #[serde(rename = "backoff_max_ms", with = "duration_ms")]
    pub backoff_max: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "prioq".to_string(),
            metrics_update_interval: Duration::from_millis(500),
            log_interval: Duration::from_secs(5),
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_secs(1000),
        }
    }
}

impl QueueConfig {
    /// Default configuration with a different queue name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Load configuration from `PRIOQ_*` environment variables.
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            name: std::env::var(ENV_NAME).unwrap_or(defaults.name),
            metrics_update_interval: millis_var(ENV_METRICS_INTERVAL)?
                .unwrap_or(defaults.metrics_update_interval),
            log_interval: millis_var(ENV_LOG_INTERVAL)?.unwrap_or(defaults.log_interval),
            backoff_base: millis_var(ENV_BACKOFF_BASE)?.unwrap_or(defaults.backoff_base),
            backoff_max: millis_var(ENV_BACKOFF_MAX)?.unwrap_or(defaults.backoff_max),
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML document. Missing keys keep their
    /// defaults.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the queue cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("queue name must not be empty".to_string()));
        }
        if self.metrics_update_interval.is_zero() {
            return Err(Error::Config(
                "metrics update interval must be greater than zero".to_string(),
            ));
        }
        if self.log_interval.is_zero() {
            return Err(Error::Config(
                "log interval must be greater than zero".to_string(),
            ));
        }
        if self.backoff_base > self.backoff_max {
            return Err(Error::Config(format!(
                "backoff base {:?} exceeds backoff max {:?}",
                self.backoff_base, self.backoff_max
            )));
        }
        Ok(())
    }
}

fn millis_var(name: &str) -> Result<Option<Duration>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|e| Error::Config(format!("{name} must be milliseconds, got {raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}
