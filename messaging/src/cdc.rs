//! Change-data-capture envelope
//!
//! Database change propagation rides on the same publish and stream-consume
//! paths as everything else; this module only fixes the payload shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::payload::DecodedPayload;

/// Database operation captured by a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

/// Envelope carried by every change event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent<T> {
    pub operation: ChangeOperation,
    /// Row state before the change; `None` for inserts.
    pub before: Option<T>,
    /// Row state after the change; `None` for deletes.
    pub after: Option<T>,
    pub timestamp: DateTime<Utc>,
}

impl<T> ChangeEvent<T> {
    pub fn insert(after: T) -> Self {
        Self {
            operation: ChangeOperation::Insert,
            before: None,
            after: Some(after),
            timestamp: Utc::now(),
        }
    }

    pub fn update(before: T, after: T) -> Self {
        Self {
            operation: ChangeOperation::Update,
            before: Some(before),
            after: Some(after),
            timestamp: Utc::now(),
        }
    }

    pub fn delete(before: T) -> Self {
        Self {
            operation: ChangeOperation::Delete,
            before: Some(before),
            after: None,
            timestamp: Utc::now(),
        }
    }
}

/// Payload delivered to CDC consumers.
///
/// Anything that does not parse as a change envelope falls back to the raw
/// text, matching the decode policy of every other consumer.
#[derive(Debug, Clone)]
pub enum CdcPayload {
    Event(ChangeEvent<serde_json::Value>),
    Raw(String),
}

impl From<DecodedPayload> for CdcPayload {
    fn from(payload: DecodedPayload) -> Self {
        match payload {
            DecodedPayload::Json(value) => {
                match serde_json::from_value::<ChangeEvent<serde_json::Value>>(value.clone()) {
                    Ok(event) => CdcPayload::Event(event),
                    Err(_) => CdcPayload::Raw(value.to_string()),
                }
            }
            DecodedPayload::Raw(raw) => CdcPayload::Raw(raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn envelope_serializes_with_lowercase_operation() {
        let event = ChangeEvent {
            operation: ChangeOperation::Update,
            before: Some(json!({"id": 1, "v": 1})),
            after: Some(json!({"id": 1, "v": 2})),
            timestamp: "2024-01-01T00:00:00Z".parse().unwrap(),
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["operation"], json!("update"));
        assert_eq!(value["before"], json!({"id": 1, "v": 1}));
        assert_eq!(value["after"], json!({"id": 1, "v": 2}));
        assert_eq!(value["timestamp"], json!("2024-01-01T00:00:00Z"));
    }

    #[test]
    fn constructors_fix_the_operation_shape() {
        let insert = ChangeEvent::insert(json!({"id": 1}));
        assert_eq!(insert.operation, ChangeOperation::Insert);
        assert_eq!(insert.before, None);

        let delete = ChangeEvent::delete(json!({"id": 1}));
        assert_eq!(delete.operation, ChangeOperation::Delete);
        assert_eq!(delete.after, None);
    }

    #[test]
    fn well_formed_envelope_parses_into_an_event() {
        let decoded = DecodedPayload::Json(json!({
            "operation": "delete",
            "before": {"id": 4},
            "after": null,
            "timestamp": "2024-06-01T12:30:00Z",
        }));

        match CdcPayload::from(decoded) {
            CdcPayload::Event(event) => {
                assert_eq!(event.operation, ChangeOperation::Delete);
                assert_eq!(event.before, Some(json!({"id": 4})));
                assert_eq!(event.after, None);
            }
            CdcPayload::Raw(raw) => panic!("expected an event, got raw {:?}", raw),
        }
    }

    #[test]
    fn json_that_is_not_an_envelope_falls_back_raw() {
        let decoded = DecodedPayload::Json(json!({"operation": "upsert"}));
        assert!(matches!(CdcPayload::from(decoded), CdcPayload::Raw(_)));
    }

    #[test]
    fn raw_payloads_stay_raw() {
        let decoded = DecodedPayload::Raw("not even json".to_string());
        match CdcPayload::from(decoded) {
            CdcPayload::Raw(raw) => assert_eq!(raw, "not even json"),
            CdcPayload::Event(event) => panic!("expected raw, got {:?}", event),
        }
    }
}
