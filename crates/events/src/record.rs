use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use eventline_core::EventId;

use crate::descriptor::Descriptor;

/// An event to be appended to an origin stream (not yet assigned a position).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub event_type: String,
    pub metadata: Vec<u8>,
    pub payload: Vec<u8>,
    /// Whether `payload` is in the structured (JSON) encoding consumers expect.
    pub is_json: bool,
}

impl NewEvent {
    /// Serialize `payload` as JSON under the given type tag.
    pub fn json<T: Serialize>(event_type: impl Into<String>, payload: &T) -> serde_json::Result<Self> {
        Ok(Self {
            event_type: event_type.into(),
            metadata: Vec::new(),
            payload: serde_json::to_vec(payload)?,
            is_json: true,
        })
    }

    /// Opaque bytes; never handed to application handlers.
    pub fn binary(event_type: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            event_type: event_type.into(),
            metadata: Vec::new(),
            payload: payload.into(),
            is_json: false,
        }
    }

    pub fn with_descriptor(mut self, descriptor: &Descriptor) -> Self {
        self.metadata = descriptor.encode();
        self
    }
}

/// An event as stored in the durable log.
///
/// Records are immutable and owned by the log; consumers share them through
/// [`SharedRecord`] for the duration of a delivery instead of copying bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    event_id: EventId,
    stream_id: String,

    /// Monotonically increasing position in the origin stream (starts at 0).
    sequence_number: u64,

    event_type: String,
    metadata: Vec<u8>,
    payload: Vec<u8>,
    is_json: bool,
    created_at: DateTime<Utc>,
}

/// Reference-counted record handed out by the log client.
pub type SharedRecord = Arc<EventRecord>;

impl EventRecord {
    pub fn new(
        event_id: EventId,
        stream_id: impl Into<String>,
        sequence_number: u64,
        created_at: DateTime<Utc>,
        event: NewEvent,
    ) -> Self {
        Self {
            event_id,
            stream_id: stream_id.into(),
            sequence_number,
            event_type: event.event_type,
            metadata: event.metadata,
            payload: event.payload,
            is_json: event.is_json,
            created_at,
        }
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn metadata(&self) -> &[u8] {
        &self.metadata
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn is_json(&self) -> bool {
        self.is_json
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}
