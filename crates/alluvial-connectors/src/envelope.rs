//! Envelope decoding: raw bytes to typed records.
//!
//! Upstream messages are JSON envelopes of the form
//! `{"schema": ..., "payload": {...}}`. Only the payload object is
//! interpreted; the schema block is advisory and may be absent. The
//! decoder is pure: same bytes and shape in, same record or error out,
//! with no I/O and no shared state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use alluvial_core::{DecodeError, DecodedRecord, FieldType, FieldValue, RawMessage, RecordShape};

/// Decodes raw envelope bytes against a declared [`RecordShape`].
#[derive(Debug, Clone)]
pub struct EnvelopeDecoder {
    shape: RecordShape,
}

impl EnvelopeDecoder {
    /// Create a decoder for the given shape.
    #[must_use]
    pub fn new(shape: RecordShape) -> Self {
        Self { shape }
    }

    /// The shape this decoder validates against.
    #[must_use]
    pub fn shape(&self) -> &RecordShape {
        &self.shape
    }

    /// Decode one message into a [`DecodedRecord`].
    ///
    /// Absent optional fields become [`FieldValue::Unset`]; absent
    /// required fields are a [`DecodeError::SchemaMismatch`]. The event
    /// time comes from the shape's designated payload field when one is
    /// declared, otherwise from the message's ingest timestamp.
    pub fn decode(&self, message: &RawMessage) -> Result<DecodedRecord, DecodeError> {
        let envelope: Value = serde_json::from_slice(&message.payload)
            .map_err(|e| DecodeError::MalformedEnvelope(e.to_string()))?;
        let envelope = envelope
            .as_object()
            .ok_or_else(|| DecodeError::MalformedEnvelope("top level is not an object".into()))?;

        let payload = envelope
            .get("payload")
            .filter(|v| !v.is_null())
            .ok_or(DecodeError::MissingPayload)?
            .as_object()
            .ok_or(DecodeError::MissingPayload)?;

        let mut fields = BTreeMap::new();
        for spec in &self.shape.fields {
            let value = match payload.get(&spec.name).filter(|v| !v.is_null()) {
                Some(value) => convert_field(&spec.name, spec.data_type, value)?,
                None if spec.optional => FieldValue::Unset,
                None => {
                    return Err(DecodeError::SchemaMismatch {
                        field: spec.name.clone(),
                        message: "required field is absent".into(),
                    })
                }
            };
            fields.insert(spec.name.clone(), value);
        }

        let event_time = match &self.shape.event_time_field {
            Some(name) => extract_event_time(name, payload.get(name))?,
            None => message.ingest_time,
        };

        Ok(DecodedRecord {
            fields,
            event_time,
            raw_value: String::from_utf8_lossy(&message.payload).into_owned(),
            source: message.source.clone(),
            offset: message.offset,
        })
    }
}

fn convert_field(name: &str, expected: FieldType, value: &Value) -> Result<FieldValue, DecodeError> {
    let mismatch = || DecodeError::SchemaMismatch {
        field: name.to_string(),
        message: format!("expected {}, got {}", expected.name(), json_type(value)),
    };
    match expected {
        FieldType::Utf8 => value
            .as_str()
            .map(|s| FieldValue::Utf8(s.to_string()))
            .ok_or_else(mismatch),
        FieldType::Int64 => value.as_i64().map(FieldValue::Int64).ok_or_else(mismatch),
        FieldType::Float64 => value.as_f64().map(FieldValue::Float64).ok_or_else(mismatch),
        FieldType::Bool => value.as_bool().map(FieldValue::Bool).ok_or_else(mismatch),
    }
}

/// Parse the designated event-time field: RFC 3339 string or epoch
/// milliseconds. Anything else rejects the record rather than guessing:
/// a wrong event time would land the record in the wrong partition.
fn extract_event_time(name: &str, value: Option<&Value>) -> Result<DateTime<Utc>, DecodeError> {
    let mismatch = |message: String| DecodeError::SchemaMismatch {
        field: name.to_string(),
        message,
    };
    match value.filter(|v| !v.is_null()) {
        Some(Value::String(text)) => DateTime::parse_from_rfc3339(text)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| mismatch(format!("unparseable event time: {e}"))),
        Some(Value::Number(num)) => num
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .ok_or_else(|| mismatch("epoch millis out of range".into())),
        Some(other) => Err(mismatch(format!(
            "expected timestamp string or epoch millis, got {}",
            json_type(other)
        ))),
        None => Err(mismatch("event-time field is absent".into())),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
