//! Event descriptors: the header map carried in a record's metadata.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Well-known header keys.
pub mod headers {
    /// Type tag of the delivered event (synthesized from the record).
    pub const MESSAGE_TYPE: &str = "message-type";
    /// Event id of the delivered event (synthesized from the record).
    pub const MESSAGE_ID: &str = "message-id";
    /// Origin stream of the delivered event (synthesized from the record).
    pub const ORIGIN_STREAM: &str = "origin-stream";
    /// Position within the origin stream (synthesized from the record).
    pub const ORIGIN_SEQUENCE: &str = "origin-sequence";
    pub const CORRELATION_ID: &str = "correlation-id";
    pub const CAUSATION_ID: &str = "causation-id";
    /// RFC 3339 timestamp set by the writer.
    pub const TIMESTAMP: &str = "timestamp";
}

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("metadata is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("metadata must be a JSON object, found {0}")]
    NotAnObject(&'static str),
}

/// Header mapping decoded from an event's metadata.
///
/// Metadata is a JSON object. String values are taken as-is; other values are
/// kept in their JSON text form so no header is silently dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Descriptor {
    headers: BTreeMap<String, String>,
}

impl Descriptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a descriptor from raw metadata bytes.
    ///
    /// Empty (or whitespace-only) metadata yields an empty descriptor.
    pub fn decode(metadata: &[u8]) -> Result<Self, DescriptorError> {
        if metadata.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }

        let object = match serde_json::from_slice::<JsonValue>(metadata)? {
            JsonValue::Object(object) => object,
            JsonValue::Null => return Err(DescriptorError::NotAnObject("null")),
            JsonValue::Bool(_) => return Err(DescriptorError::NotAnObject("bool")),
            JsonValue::Number(_) => return Err(DescriptorError::NotAnObject("number")),
            JsonValue::String(_) => return Err(DescriptorError::NotAnObject("string")),
            JsonValue::Array(_) => return Err(DescriptorError::NotAnObject("array")),
        };

        let headers = object
            .into_iter()
            .map(|(key, value)| match value {
                JsonValue::String(s) => (key, s),
                other => (key, other.to_string()),
            })
            .collect();

        Ok(Self { headers })
    }

    /// Encode as JSON object bytes (the inverse of [`Descriptor::decode`] for string headers).
    pub fn encode(&self) -> Vec<u8> {
        // A map of strings always serializes.
        serde_json::to_vec(&self.headers).unwrap_or_default()
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn into_headers(self) -> BTreeMap<String, String> {
        self.headers
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.get(headers::CORRELATION_ID)
    }

    /// Writer timestamp, when present and well-formed.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.get(headers::TIMESTAMP)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_metadata_decodes_to_empty_descriptor() {
        assert!(Descriptor::decode(b"").unwrap().is_empty());
        assert!(Descriptor::decode(b"  \n").unwrap().is_empty());
    }

    #[test]
    fn string_and_scalar_headers_are_kept() {
        let d = Descriptor::decode(br#"{"correlation-id":"abc","retries":3,"flag":true}"#).unwrap();
        assert_eq!(d.correlation_id(), Some("abc"));
        assert_eq!(d.get("retries"), Some("3"));
        assert_eq!(d.get("flag"), Some("true"));
    }

    #[test]
    fn non_object_metadata_is_rejected() {
        let err = Descriptor::decode(b"[1,2]").unwrap_err();
        assert!(matches!(err, DescriptorError::NotAnObject("array")));
    }

    #[test]
    fn garbage_metadata_is_rejected() {
        assert!(matches!(
            Descriptor::decode(&[0xff, 0x00]).unwrap_err(),
            DescriptorError::Json(_)
        ));
    }

    #[test]
    fn timestamp_is_parsed_as_utc() {
        let d = Descriptor::new().with_header(headers::TIMESTAMP, "2024-03-01T10:00:00+02:00");
        let ts = d.timestamp().unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-03-01T08:00:00+00:00");
    }

    #[test]
    fn encode_then_decode_preserves_headers() {
        let d = Descriptor::new()
            .with_header(headers::CORRELATION_ID, "c-1")
            .with_header(headers::CAUSATION_ID, "c-0");
        assert_eq!(Descriptor::decode(&d.encode()).unwrap(), d);
    }
}
