//! Event records and their wire format.
//!
//! The wire format on the channel is a JSON object:
//!
//! ```json
//! {"event_id": "...", "event_type": "click", "user_id": null,
//!  "timestamp": 1718000000000, "data": {"x": 1}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An event as submitted by a caller, before the producer assigns identity.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewEvent {
    /// Caller-supplied category.
    #[serde(rename = "type", alias = "event_type")]
    pub event_type: String,
    /// Optional caller-supplied user identifier.
    #[serde(default, alias = "userId")]
    pub user_id: Option<String>,
    /// Open key/value payload.
    #[serde(default, alias = "data")]
    pub payload: Map<String, Value>,
}

impl NewEvent {
    pub fn new(event_type: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            event_type: event_type.into(),
            user_id: None,
            payload,
        }
    }

    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// The unit flowing through the pipeline.
///
/// `event_id` is assigned once by the producer and never changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: String,
    pub event_type: String,
    pub user_id: Option<String>,
    /// Creation time in Unix milliseconds.
    #[serde(rename = "timestamp")]
    pub created_at: i64,
    #[serde(rename = "data")]
    pub payload: Map<String, Value>,
}

impl EventRecord {
    /// Stamp a submitted event with a fresh identifier and creation time.
    pub fn assign(event: NewEvent, event_id: String, created_at: i64) -> Self {
        Self {
            event_id,
            event_type: event.event_type,
            user_id: event.user_id,
            created_at,
            payload: event.payload,
        }
    }

    /// Serialize to the channel wire format.
    pub fn to_wire(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from the channel wire format.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_event_accepts_both_field_spellings() {
        let short: NewEvent =
            serde_json::from_value(json!({"type": "click", "payload": {"x": 1}})).unwrap();
        let long: NewEvent = serde_json::from_value(
            json!({"event_type": "click", "user_id": "u1", "data": {"x": 1}}),
        )
        .unwrap();
        let camel: NewEvent =
            serde_json::from_value(json!({"type": "click", "userId": "u1"})).unwrap();

        assert_eq!(short.event_type, "click");
        assert_eq!(short.payload.get("x"), Some(&json!(1)));
        assert_eq!(long.user_id.as_deref(), Some("u1"));
        assert_eq!(long.payload, short.payload);
        assert_eq!(camel.user_id.as_deref(), Some("u1"));
        assert!(camel.payload.is_empty());
    }

    #[test]
    fn test_wire_format_field_names() {
        let mut payload = Map::new();
        payload.insert("x".into(), json!(1));
        let record = EventRecord::assign(
            NewEvent::new("click", payload).with_user("u1"),
            "evt-1".into(),
            1_700_000_000_000,
        );

        let value: Value = serde_json::from_slice(&record.to_wire().unwrap()).unwrap();
        assert_eq!(value["event_id"], "evt-1");
        assert_eq!(value["event_type"], "click");
        assert_eq!(value["user_id"], "u1");
        assert_eq!(value["timestamp"], 1_700_000_000_000_i64);
        assert_eq!(value["data"]["x"], 1);

        let decoded = EventRecord::from_wire(&record.to_wire().unwrap()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_from_wire_rejects_garbage() {
        assert!(EventRecord::from_wire(b"not json").is_err());
        assert!(EventRecord::from_wire(br#"{"event_id": "a"}"#).is_err());
    }
}
