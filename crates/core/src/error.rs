//! Configuration error model.

use thiserror::Error;

/// Result type used when building or loading configuration.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Invalid subscriber configuration.
///
/// Raised at construction time (builder validation or environment loading),
/// never once a subscription is live.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required value was empty or missing.
    #[error("missing configuration value: {0}")]
    Missing(String),

    /// A value was present but out of range or malformed.
    #[error("invalid configuration value for {key}: {reason}")]
    Invalid { key: String, reason: String },

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl ConfigError {
    pub fn missing(key: impl Into<String>) -> Self {
        Self::Missing(key.into())
    }

    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
