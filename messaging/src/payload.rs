//! Inbound payload decoding
//!
//! Every consumer decodes payloads through [`DecodedPayload::decode`].
//! Malformed JSON is a policy, not an error: the handler receives the raw
//! text instead, so a stray non-JSON message never drops silently and never
//! kills a consumer loop. Callers of non-JSON topics rely on this fallback.

use std::collections::HashMap;

/// String key/value message headers as carried by the broker.
pub type Headers = HashMap<String, String>;

/// Result of decoding an inbound payload.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedPayload {
    /// The payload parsed as JSON.
    Json(serde_json::Value),
    /// The payload was not valid JSON; the raw text is handed through.
    Raw(String),
}

impl DecodedPayload {
    /// Decodes raw bytes, falling back to lossy UTF-8 text on parse failure.
    pub fn decode(payload: &[u8]) -> Self {
        match serde_json::from_slice(payload) {
            Ok(value) => DecodedPayload::Json(value),
            Err(_) => DecodedPayload::Raw(String::from_utf8_lossy(payload).into_owned()),
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            DecodedPayload::Json(value) => Some(value),
            DecodedPayload::Raw(_) => None,
        }
    }

    pub fn into_json(self) -> Option<serde_json::Value> {
        match self {
            DecodedPayload::Json(value) => Some(value),
            DecodedPayload::Raw(_) => None,
        }
    }

    pub fn as_raw(&self) -> Option<&str> {
        match self {
            DecodedPayload::Json(_) => None,
            DecodedPayload::Raw(raw) => Some(raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn decodes_json_objects() {
        let decoded = DecodedPayload::decode(br#"{"id": 7, "name": "dana"}"#);
        assert_eq!(decoded, DecodedPayload::Json(json!({"id": 7, "name": "dana"})));
    }

    #[test]
    fn decodes_json_scalars() {
        let decoded = DecodedPayload::decode(br#""hello""#);
        assert_eq!(decoded, DecodedPayload::Json(json!("hello")));
    }

    #[test]
    fn malformed_payload_falls_back_to_raw_text() {
        let decoded = DecodedPayload::decode(b"definitely not json");
        assert_eq!(decoded, DecodedPayload::Raw("definitely not json".to_string()));
    }

    #[test]
    fn non_utf8_payload_is_lossy_not_dropped() {
        let decoded = DecodedPayload::decode(&[0xff, 0xfe, 0x00]);
        assert!(decoded.as_raw().is_some());
    }
}
