use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::RelayError;

/// A single decoded sensor value. Devices publish flat JSON objects whose
/// values are scalars; nested structures are rejected as malformed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

/// One parsed inbound message, ready for the write path.
#[derive(Debug, Clone)]
pub struct DeviceReading {
    pub device_id: String,
    pub fields: HashMap<String, FieldValue>,
    /// Relay-assigned, strictly increasing per connection (unix millis).
    pub received_at: u64,
}

/// Topic contract: the device identifier is always the third `/`-segment,
/// i.e. the second segment after the namespace root (`farm/sensors/node1`).
pub fn device_id_from_topic(topic: &str) -> Option<&str> {
    let mut segments = topic.split('/');
    segments.next()?;
    segments.next()?;
    match segments.next() {
        Some(id) if !id.is_empty() => Some(id),
        _ => None,
    }
}

pub fn decode_fields(payload: &[u8]) -> Result<HashMap<String, FieldValue>, serde_json::Error> {
    serde_json::from_slice(payload)
}

/// Builds a `DeviceReading` from a raw publish. A reading with an
/// unparseable topic or payload is never constructed; the caller counts
/// the error and discards the message.
pub fn parse_reading(
    topic: &str,
    payload: &[u8],
    received_at: u64,
) -> Result<DeviceReading, RelayError> {
    let device_id = device_id_from_topic(topic)
        .ok_or_else(|| RelayError::MalformedTopic(topic.to_string()))?;
    let fields = decode_fields(payload)?;
    Ok(DeviceReading {
        device_id: device_id.to_string(),
        fields,
        received_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_is_second_segment_after_root() {
        assert_eq!(device_id_from_topic("farm/sensors/node1"), Some("node1"));
        assert_eq!(
            device_id_from_topic("farm/sensors/node1/soil"),
            Some("node1")
        );
    }

    #[test]
    fn empty_or_missing_device_segment_is_rejected() {
        assert_eq!(device_id_from_topic("farm/sensors/"), None);
        assert_eq!(device_id_from_topic("farm/sensors"), None);
        assert_eq!(device_id_from_topic("farm"), None);
        assert_eq!(device_id_from_topic(""), None);
    }

    #[test]
    fn decodes_flat_scalar_payloads() {
        let fields =
            decode_fields(br#"{"soil_moisture": 42, "pump": true, "unit": "pct"}"#).unwrap();
        assert_eq!(fields["soil_moisture"], FieldValue::Number(42.0));
        assert_eq!(fields["pump"], FieldValue::Bool(true));
        assert_eq!(fields["unit"], FieldValue::Text("pct".to_string()));
    }

    #[test]
    fn unknown_keys_pass_through() {
        let fields = decode_fields(br#"{"some_future_sensor": 1.5}"#).unwrap();
        assert_eq!(fields["some_future_sensor"], FieldValue::Number(1.5));
    }

    #[test]
    fn rejects_non_object_and_nested_payloads() {
        assert!(decode_fields(b"[1, 2]").is_err());
        assert!(decode_fields(b"42").is_err());
        assert!(decode_fields(br#"{"nested": {"a": 1}}"#).is_err());
        assert!(decode_fields(b"not json").is_err());
    }

    #[test]
    fn parse_reading_classifies_errors() {
        let err = parse_reading("farm/sensors/", b"{}", 1).unwrap_err();
        assert!(matches!(err, RelayError::MalformedTopic(_)));

        let err = parse_reading("farm/sensors/node1", b"oops", 1).unwrap_err();
        assert!(matches!(err, RelayError::MalformedPayload(_)));

        let reading = parse_reading("farm/sensors/node1", br#"{"t": 21.5}"#, 7).unwrap();
        assert_eq!(reading.device_id, "node1");
        assert_eq!(reading.received_at, 7);
    }
}
