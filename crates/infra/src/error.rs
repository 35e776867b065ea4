//! Engine error model.

use thiserror::Error;

use eventline_core::ConfigError;

use crate::log::LogError;

/// Errors that cross the engine's boundary.
///
/// Per-event handler failures never show up here; the delivery loop absorbs
/// them. In live operation the only fatal signal is a drop notification.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A routing target with the same name but a different definition exists.
    #[error("routing target {stream} exists with a different definition")]
    VersionConflict {
        stream: String,
        existing: String,
        desired: String,
    },

    #[error("routing definition could not be rendered: {0}")]
    Definition(String),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("log client error: {0}")]
    Log(#[from] LogError),

    #[error("subscribe called before setup")]
    NotSetUp,

    #[error("subscription is already live")]
    AlreadySubscribed,

    #[error("subscriber has been disposed")]
    Disposed,

    #[error("cancelled before the subscription was opened")]
    Cancelled,
}
