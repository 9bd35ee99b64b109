//! Event types and enrichment.
//!
//! A `DraftEvent` is the wire shape a client submits for dispatch. The
//! pipeline enriches it into an immutable `Event` by assigning a fresh
//! id and timestamp; anything a client supplies for those fields is
//! ignored, never trusted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// An event as submitted by a client: `{ type, payload, meta? }`.
///
/// Unknown fields on the wire (including a client-supplied `id` or
/// `timestamp`) are dropped during deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftEvent {
    /// Business operation identifier. Must be non-empty.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Operation data. Required by convention, may be empty.
    #[serde(default)]
    pub payload: Value,
    /// Out-of-band context (actor, request id, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl DraftEvent {
    /// Create a draft event with the given type and payload.
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            meta: None,
        }
    }

    /// Attach out-of-band metadata.
    #[must_use]
    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// A committed (or about-to-be-committed) event: the draft fields plus
/// the id and timestamp assigned at dispatch time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event id, assigned at enrichment.
    pub id: Uuid,
    /// Enrichment instant, persisted as RFC 3339.
    pub timestamp: DateTime<Utc>,
    /// Business operation identifier.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Operation data.
    #[serde(default)]
    pub payload: Value,
    /// Out-of-band context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl Event {
    /// Enrich a draft into an immutable event with a fresh random id
    /// and the current time.
    pub fn enrich(draft: DraftEvent) -> Self {
        // Storage backends persist microsecond precision; truncate up
        // front so a committed event reads back identical.
        let now = Utc::now();
        let timestamp = DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now);
        Self {
            id: Uuid::new_v4(),
            timestamp,
            event_type: draft.event_type,
            payload: draft.payload,
            meta: draft.meta,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn enrich_assigns_fresh_id_and_timestamp() {
        let before = Utc::now();
        let a = Event::enrich(DraftEvent::new("addIssue", json!({"id": "x"})));
        let b = Event::enrich(DraftEvent::new("addIssue", json!({"id": "x"})));

        assert_ne!(a.id, b.id);
        // enrichment truncates to microseconds, so allow sub-micro slack
        assert!(a.timestamp >= before - chrono::Duration::seconds(1));
        assert_eq!(a.payload, json!({"id": "x"}));
    }

    #[test]
    fn draft_ignores_client_supplied_id_and_timestamp() {
        let draft: DraftEvent = serde_json::from_value(json!({
            "type": "addIssue",
            "payload": {"title": "T"},
            "id": "client-chosen",
            "timestamp": "1999-01-01T00:00:00Z"
        }))
        .unwrap();

        assert_eq!(draft.event_type, "addIssue");
        assert_eq!(draft.payload, json!({"title": "T"}));
        assert_eq!(draft.meta, None);
    }

    #[test]
    fn event_serializes_with_wire_field_names() {
        let event = Event::enrich(
            DraftEvent::new("addIssue", json!({})).with_meta(json!({"actor": "tests"})),
        );
        let value = serde_json::to_value(&event).unwrap();

        assert!(value.get("type").is_some());
        assert!(value.get("id").is_some());
        assert!(value.get("timestamp").is_some());
        assert_eq!(value["meta"], json!({"actor": "tests"}));

        let back: Event = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }
}
