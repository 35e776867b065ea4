//! Shared building blocks for the eventline subscription engine.
//!
//! This crate carries configuration and identifiers only (no IO).

pub mod config;
pub mod error;
pub mod id;

pub use config::{MAX_PARALLEL_DELIVERIES, MAX_READ_BATCH_SIZE, SubscriberConfig};
pub use error::{ConfigError, ConfigResult};
pub use id::{EventId, TransactionId};
