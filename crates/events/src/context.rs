//! Per-delivery contexts handed to the handler pipeline.

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use eventline_core::{EventId, TransactionId};

use crate::descriptor::{Descriptor, headers};
use crate::record::SharedRecord;

/// Header mapping seen by handlers.
pub type Headers = BTreeMap<String, String>;

/// Typed extension storage scoped to one delivery attempt.
///
/// Handlers use it to pass values down the pipeline (one value per type).
#[derive(Default)]
pub struct ContextBag {
    entries: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl ContextBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value, returning the previous value of the same type.
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) -> Option<T> {
        self.entries
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
    }

    pub fn get_mut<T: Any + Send + Sync>(&mut self) -> Option<&mut T> {
        self.entries
            .get_mut(&TypeId::of::<T>())
            .and_then(|v| v.downcast_mut::<T>())
    }

    pub fn remove<T: Any + Send + Sync>(&mut self) -> Option<T> {
        self.entries
            .remove(&TypeId::of::<T>())
            .and_then(|v| v.downcast::<T>().ok())
            .map(|v| *v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl core::fmt::Debug for ContextBag {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ContextBag")
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// Everything a handler sees for one delivery attempt.
///
/// Built fresh for every attempt so nothing a handler stores in the bag leaks
/// into the next attempt.
#[derive(Debug)]
pub struct MessageContext {
    delivery_id: EventId,
    headers: Headers,
    record: SharedRecord,
    transaction: TransactionId,
    cancellation: CancellationToken,
    bag: ContextBag,
}

impl MessageContext {
    /// Build a context from a record and its decoded descriptor.
    ///
    /// Descriptor headers are copied first; the synthesized type/id/origin
    /// headers always reflect the record itself.
    pub fn new(record: SharedRecord, descriptor: &Descriptor, cancellation: CancellationToken) -> Self {
        let headers = synthesize_headers(&record, descriptor);
        Self {
            delivery_id: record.event_id(),
            headers,
            record,
            transaction: TransactionId::new(),
            cancellation,
            bag: ContextBag::new(),
        }
    }

    pub fn delivery_id(&self) -> EventId {
        self.delivery_id
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn message_type(&self) -> &str {
        self.record.event_type()
    }

    pub fn payload(&self) -> &[u8] {
        self.record.payload()
    }

    /// Deserialize the JSON payload.
    pub fn payload_as<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(self.record.payload())
    }

    pub fn record(&self) -> &SharedRecord {
        &self.record
    }

    pub fn transaction(&self) -> TransactionId {
        self.transaction
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn bag(&self) -> &ContextBag {
        &self.bag
    }

    pub fn bag_mut(&mut self) -> &mut ContextBag {
        &mut self.bag
    }
}

/// A failed dispatch, as seen by the error policy.
#[derive(Debug)]
pub struct ErrorContext {
    error: anyhow::Error,
    headers: Headers,
    delivery_id: EventId,
    record: SharedRecord,
    attempt: u32,
}

impl ErrorContext {
    /// Turn a failed attempt's context into an error context.
    pub fn from_failure(context: MessageContext, error: anyhow::Error, attempt: u32) -> Self {
        Self {
            error,
            headers: context.headers,
            delivery_id: context.delivery_id,
            record: context.record,
            attempt,
        }
    }

    pub fn error(&self) -> &anyhow::Error {
        &self.error
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn delivery_id(&self) -> EventId {
        self.delivery_id
    }

    pub fn payload(&self) -> &[u8] {
        self.record.payload()
    }

    pub fn record(&self) -> &SharedRecord {
        &self.record
    }

    /// 1-based dispatch attempt that produced this failure.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

fn synthesize_headers(record: &SharedRecord, descriptor: &Descriptor) -> Headers {
    let mut map = descriptor.headers().clone();
    map.insert(headers::MESSAGE_TYPE.to_string(), record.event_type().to_string());
    map.insert(headers::MESSAGE_ID.to_string(), record.event_id().to_string());
    map.insert(headers::ORIGIN_STREAM.to_string(), record.stream_id().to_string());
    map.insert(
        headers::ORIGIN_SEQUENCE.to_string(),
        record.sequence_number().to_string(),
    );
    map
}
