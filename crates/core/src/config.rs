//! Subscriber configuration.
//!
//! These are the inputs the composition root hands to the engine: which
//! endpoint (and version) is subscribing, how large the log client's read
//! batches are, and how many deliveries may run at once.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

pub const ENV_ENDPOINT: &str = "EVENTLINE_ENDPOINT";
pub const ENV_VERSION: &str = "EVENTLINE_VERSION";
pub const ENV_READ_BATCH_SIZE: &str = "EVENTLINE_READ_BATCH_SIZE";
pub const ENV_MAX_PARALLEL: &str = "EVENTLINE_MAX_PARALLEL";
pub const ENV_DISPOSE_GRACE_MS: &str = "EVENTLINE_DISPOSE_GRACE_MS";

const DEFAULT_READ_BATCH_SIZE: usize = 100;
const DEFAULT_MAX_PARALLEL: usize = 10;
const DEFAULT_DISPOSE_GRACE: Duration = Duration::from_secs(5);

/// Upper bound on `read_batch_size`; the live buffer grows with its square.
pub const MAX_READ_BATCH_SIZE: usize = 4_096;
/// Upper bound on `max_parallel_deliveries`; each in-flight delivery holds a thread.
pub const MAX_PARALLEL_DELIVERIES: usize = 1_024;

/// Configuration of one subscriber instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberConfig {
    /// Endpoint name (first half of the routing stream name).
    pub endpoint: String,
    /// Endpoint version tag (second half of the routing stream name).
    pub version: String,
    /// Events read from the consumer group per round trip.
    pub read_batch_size: usize,
    /// Upper bound on simultaneously in-flight deliveries.
    pub max_parallel_deliveries: usize,
    /// How long `dispose` waits for the live connection to stop.
    pub dispose_grace: Duration,
}

impl SubscriberConfig {
    pub fn new(endpoint: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            version: version.into(),
            read_batch_size: DEFAULT_READ_BATCH_SIZE,
            max_parallel_deliveries: DEFAULT_MAX_PARALLEL,
            dispose_grace: DEFAULT_DISPOSE_GRACE,
        }
    }

    pub fn with_read_batch_size(mut self, size: usize) -> Self {
        self.read_batch_size = size;
        self
    }

    pub fn with_max_parallel_deliveries(mut self, max: usize) -> Self {
        self.max_parallel_deliveries = max;
        self
    }

    pub fn with_dispose_grace(mut self, grace: Duration) -> Self {
        self.dispose_grace = grace;
        self
    }

    /// Routing stream (and consumer group) name: `endpoint.version`.
    pub fn stream_name(&self) -> String {
        stream_name(&self.endpoint, &self.version)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::missing("endpoint"));
        }
        if self.version.trim().is_empty() {
            return Err(ConfigError::missing("version"));
        }
        if !(1..=MAX_READ_BATCH_SIZE).contains(&self.read_batch_size) {
            return Err(ConfigError::invalid(
                "read_batch_size",
                format!("must be between 1 and {MAX_READ_BATCH_SIZE}"),
            ));
        }
        if !(1..=MAX_PARALLEL_DELIVERIES).contains(&self.max_parallel_deliveries) {
            return Err(ConfigError::invalid(
                "max_parallel_deliveries",
                format!("must be between 1 and {MAX_PARALLEL_DELIVERIES}"),
            ));
        }
        Ok(())
    }

    /// Load from `EVENTLINE_*` environment variables.
    ///
    /// Endpoint and version are required; everything else falls back to the
    /// defaults.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (the environment, a map in tests, ...).
    pub fn from_lookup<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let endpoint = lookup(ENV_ENDPOINT).ok_or_else(|| ConfigError::missing(ENV_ENDPOINT))?;
        let version = lookup(ENV_VERSION).ok_or_else(|| ConfigError::missing(ENV_VERSION))?;

        let mut config = Self::new(endpoint, version);

        if let Some(raw) = lookup(ENV_READ_BATCH_SIZE) {
            config.read_batch_size = parse_number(ENV_READ_BATCH_SIZE, &raw)?;
        }
        if let Some(raw) = lookup(ENV_MAX_PARALLEL) {
            config.max_parallel_deliveries = parse_number(ENV_MAX_PARALLEL, &raw)?;
        }
        if let Some(raw) = lookup(ENV_DISPOSE_GRACE_MS) {
            let ms: u64 = parse_number(ENV_DISPOSE_GRACE_MS, &raw)?;
            config.dispose_grace = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }
}

/// Routing stream (and consumer group) name for an endpoint version.
pub fn stream_name(endpoint: &str, version: &str) -> String {
    format!("{endpoint}.{version}")
}

fn parse_number<T>(key: &str, raw: &str) -> ConfigResult<T>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::invalid(key, format!("{raw:?}: {e}")))
}
