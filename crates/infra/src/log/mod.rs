//! Durable log client boundary.
//!
//! The durable log is an external, append-only, per-stream-ordered service.
//! This module describes the slice of its client the engine relies on:
//!
//! - **Routing admin**: read/create named routing definitions that link the
//!   selected event types into a routing target, in global log order
//! - **Consumer groups**: durable, checkpointed subscriptions on a target
//! - **Live connections**: push-based delivery with manual acknowledgment and
//!   a drop notification when the server or network ends the subscription
//!
//! [`InMemoryLog`] implements the whole contract in-process for tests/dev.

pub mod in_memory;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use eventline_events::{EventRecord, SharedRecord};

pub use in_memory::InMemoryLog;

/// Callback invoked by the log client for every delivered record.
pub type EventCallback = Arc<dyn Fn(SharedRecord) + Send + Sync>;

/// Callback invoked by the log client when a live connection ends.
pub type DropCallback = Arc<dyn Fn(DropReason, Option<LogError>) + Send + Sync>;

/// Durable log client error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LogError {
    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("invalid routing definition: {0}")]
    InvalidDefinition(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("timed out: {0}")]
    Timeout(String),
}

/// Why a live consumer-group connection ended.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// The subscriber stopped the connection itself.
    SubscriberRequested,
    /// The network connection to the log was lost.
    ConnectionClosed,
    /// The server terminated the subscription.
    ServerError,
    /// The consumer group was deleted underneath the subscriber.
    ConsumerGroupDeleted,
    Unknown,
}

impl core::fmt::Display for DropReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            DropReason::SubscriberRequested => "subscriber_requested",
            DropReason::ConnectionClosed => "connection_closed",
            DropReason::ServerError => "server_error",
            DropReason::ConsumerGroupDeleted => "consumer_group_deleted",
            DropReason::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Where a newly created consumer group starts reading.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    Beginning,
    /// Only entries written after the group was created.
    Tail,
}

/// How a consumer group spreads entries across its consumers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionStrategy {
    RoundRobin,
    /// All entries of one origin stream go to the same consumer, in order.
    Pinned,
}

/// Server-side settings of a consumer group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerGroupSettings {
    pub read_batch_size: usize,
    pub live_buffer_size: usize,
    pub checkpoint_after: Duration,
    /// Deliver the linked (original) event instead of the link entry.
    pub resolve_links: bool,
    pub start_from: StartPosition,
    pub strategy: DistributionStrategy,
}

/// Administrative access to routing definitions.
pub trait RoutingAdmin: Send + Sync {
    /// Definition text registered under `name`, if any.
    fn get_definition(&self, name: &str) -> Result<Option<String>, LogError>;

    /// Register a definition. Fails with [`LogError::AlreadyExists`] when the
    /// name is taken (regardless of content).
    fn create_definition(&self, name: &str, definition: &str) -> Result<(), LogError>;
}

/// A live, push-based connection to a consumer group.
pub trait LiveConnection: Send + Sync {
    /// Stop delivering and wait up to `grace` for the client's delivery
    /// threads to finish. Calling it again is a no-op.
    fn stop(&self, grace: Duration) -> Result<(), LogError>;

    fn is_stopped(&self) -> bool;
}

/// Client of the durable log.
pub trait DurableLog: Send + Sync {
    fn connect(&self) -> Result<(), LogError>;

    /// Create a consumer group. Fails with [`LogError::AlreadyExists`] when
    /// the group exists.
    fn create_consumer_group(
        &self,
        target: &str,
        group: &str,
        settings: &ConsumerGroupSettings,
    ) -> Result<(), LogError>;

    /// Open a live connection. Records are pushed to `on_event` on the
    /// client's own threads; `on_drop` fires once when the connection ends.
    fn connect_consumer_group(
        &self,
        target: &str,
        group: &str,
        on_event: EventCallback,
        on_drop: DropCallback,
        auto_ack: bool,
    ) -> Result<Box<dyn LiveConnection>, LogError>;

    fn acknowledge(&self, target: &str, group: &str, record: &EventRecord) -> Result<(), LogError>;
}

impl<L> DurableLog for Arc<L>
where
    L: DurableLog + ?Sized,
{
    fn connect(&self) -> Result<(), LogError> {
        (**self).connect()
    }

    fn create_consumer_group(
        &self,
        target: &str,
        group: &str,
        settings: &ConsumerGroupSettings,
    ) -> Result<(), LogError> {
        (**self).create_consumer_group(target, group, settings)
    }

    fn connect_consumer_group(
        &self,
        target: &str,
        group: &str,
        on_event: EventCallback,
        on_drop: DropCallback,
        auto_ack: bool,
    ) -> Result<Box<dyn LiveConnection>, LogError> {
        (**self).connect_consumer_group(target, group, on_event, on_drop, auto_ack)
    }

    fn acknowledge(&self, target: &str, group: &str, record: &EventRecord) -> Result<(), LogError> {
        (**self).acknowledge(target, group, record)
    }
}

impl<A> RoutingAdmin for Arc<A>
where
    A: RoutingAdmin + ?Sized,
{
    fn get_definition(&self, name: &str) -> Result<Option<String>, LogError> {
        (**self).get_definition(name)
    }

    fn create_definition(&self, name: &str, definition: &str) -> Result<(), LogError> {
        (**self).create_definition(name, definition)
    }
}

impl<A> RoutingAdmin for &A
where
    A: RoutingAdmin + ?Sized,
{
    fn get_definition(&self, name: &str) -> Result<Option<String>, LogError> {
        (**self).get_definition(name)
    }

    fn create_definition(&self, name: &str, definition: &str) -> Result<(), LogError> {
        (**self).create_definition(name, definition)
    }
}
