//! Event data model, encoding, and stream naming.
//!
//! This module provides the data types and pure functions that the stream,
//! store, repository, and dispatch modules all depend on. No network I/O
//! occurs here.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::client::StoredRecord;

/// Default bucket used when a caller does not name one.
pub const DEFAULT_BUCKET: &str = "default";

/// Produces the remote stream name for an entity identity.
///
/// Pluggable so deployments can impose their own naming scheme; the same
/// inputs must always map to the same name, since stream identity is the
/// only thing the log service can be queried by.
pub type StreamNameGenerator = fn(entity_type: &str, bucket: &str, stream_id: &str) -> String;

/// Default stream naming: `"{bucket}-{entity_type}-{stream_id}"`.
///
/// # Examples
///
/// ```
/// use streamstore_es::default_stream_name;
/// assert_eq!(default_stream_name("order", "default", "42"), "default-order-42");
/// ```
pub fn default_stream_name(entity_type: &str, bucket: &str, stream_id: &str) -> String {
    format!("{bucket}-{entity_type}-{stream_id}")
}

/// Metadata stamped on every event when it is staged.
///
/// Serialized as the descriptor bytes of the persisted record. Immutable
/// once written, except that commit-time headers are merged in on the way
/// to the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDescriptor {
    /// Entity type name that produced the event (e.g. "order").
    pub entity_type: String,
    /// UTC timestamp taken when the event was staged.
    pub timestamp: DateTime<Utc>,
    /// 1-based version of the event within its stream.
    pub version: i64,
    /// Correlation/causation/user headers carried with the event.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// A staged event: unique id (for idempotent append), descriptor, and
/// opaque JSON payload.
#[derive(Debug, Clone)]
pub struct WritableEvent {
    /// Client-assigned UUID v4, used by the store for idempotent appends.
    pub event_id: Uuid,
    /// Type tag extracted from the adjacently-tagged domain event.
    pub event_type: String,
    /// Event metadata.
    pub descriptor: EventDescriptor,
    /// JSON payload (the `"data"` portion of the adjacently-tagged enum).
    pub payload: serde_json::Value,
}

/// An event as delivered to handlers by the dispatcher.
///
/// All fields are pre-extracted from the recorded wire event and its JSON
/// descriptor.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    /// Client-assigned event ID.
    pub event_id: Uuid,
    /// Name of the stream the event was recorded on.
    pub stream_name: String,
    /// 1-based version within the stream.
    pub version: i64,
    /// Zero-based position in the global log.
    pub global_position: u64,
    /// Event type tag (e.g. "Renamed").
    pub event_type: String,
    /// Decoded JSON payload.
    pub payload: serde_json::Value,
    /// Decoded descriptor (entity type, timestamp, headers).
    pub descriptor: EventDescriptor,
    /// Server-assigned timestamp (Unix epoch milliseconds).
    pub recorded_at: u64,
}

/// Encode a domain event into its `(type tag, payload)` parts.
///
/// The domain event must use `#[serde(tag = "type", content = "data")]`
/// adjacently tagged serialization; the `"type"` field becomes the event
/// type tag and the `"data"` field (absent for unit variants, defaulting to
/// null) becomes the payload.
///
/// # Errors
///
/// Returns `serde_json::Error` if the event cannot be serialized.
pub fn encode_domain_event<E: Serialize>(event: &E) -> serde_json::Result<(String, serde_json::Value)> {
    // Serialize the adjacently-tagged domain event. This produces JSON like:
    //   {"type": "Closed"}                (unit variant)
    //   {"type": "Renamed", "data": {..}} (variant with fields)
    let value = serde_json::to_value(event)?;
    let obj = value
        .as_object()
        .expect("adjacently tagged enum must serialize to a JSON object");

    let event_type = obj["type"]
        .as_str()
        .expect("adjacently tagged enum must have a string 'type' field")
        .to_string();

    let payload = obj.get("data").cloned().unwrap_or(serde_json::Value::Null);

    Ok((event_type, payload))
}

/// Decode a `(type tag, payload)` pair back into a domain event.
///
/// Returns `None` for unknown or malformed event types so that streams
/// remain forward compatible: replay skips what it does not understand.
pub fn decode_domain_event<E: DeserializeOwned>(
    event_type: &str,
    payload: &serde_json::Value,
) -> Option<E> {
    let tagged = if payload.is_null() {
        serde_json::json!({ "type": event_type })
    } else {
        serde_json::json!({ "type": event_type, "data": payload })
    };
    serde_json::from_value(tagged).ok()
}

/// Decode a raw recorded event into a [`StoredEvent`].
///
/// Parses the descriptor bytes as JSON and the payload bytes as JSON
/// (empty payload decodes as null). Returns `None` if either fails or the
/// event id is not a UUID -- events from foreign writers are skipped on the
/// dispatch path rather than poisoning the feed.
pub fn decode_stored_event(record: &StoredRecord) -> Option<StoredEvent> {
    let descriptor: EventDescriptor = serde_json::from_slice(&record.descriptor).ok()?;
    let event_id = Uuid::parse_str(&record.event_id).ok()?;

    let payload = if record.payload.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&record.payload).ok()?
    };

    Some(StoredEvent {
        event_id,
        stream_name: record.stream_name.clone(),
        version: record.version,
        global_position: record.global_position,
        event_type: record.event_type.clone(),
        payload,
        descriptor,
        recorded_at: record.recorded_at,
    })
}

/// Decode a raw recorded event into a [`WritableEvent`] for hydration.
///
/// Unlike [`decode_stored_event`], an unparseable descriptor here is an
/// error: hydration must not silently skip committed history.
///
/// # Errors
///
/// Returns [`StoreError::Corrupt`](crate::error::StoreError::Corrupt) if the
/// descriptor bytes or payload bytes are not valid JSON, or the event id is
/// not a UUID.
pub fn decode_writable_event(record: &StoredRecord) -> Result<WritableEvent, crate::error::StoreError> {
    let corrupt = |detail: String| crate::error::StoreError::Corrupt {
        stream: record.stream_name.clone(),
        detail,
    };

    let descriptor: EventDescriptor = serde_json::from_slice(&record.descriptor)
        .map_err(|e| corrupt(format!("descriptor: {e}")))?;
    let event_id =
        Uuid::parse_str(&record.event_id).map_err(|e| corrupt(format!("event id: {e}")))?;
    let payload = if record.payload.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&record.payload).map_err(|e| corrupt(format!("payload: {e}")))?
    };

    Ok(WritableEvent {
        event_id,
        event_type: record.event_type.clone(),
        descriptor,
        payload,
    })
}
