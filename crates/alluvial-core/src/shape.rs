//! Declared record shape for envelope payloads.
//!
//! A [`RecordShape`] is the expected structure of the inner payload
//! object: which fields exist, their types, and whether they may be
//! absent. The envelope decoder validates payloads against it and the
//! batch writer derives the columnar schema from it, so both sides of
//! the pipeline agree on the record layout by construction.

use serde::{Deserialize, Serialize};

/// Primitive type of a declared payload field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    /// UTF-8 string.
    Utf8,
    /// 64-bit signed integer.
    Int64,
    /// 64-bit float.
    Float64,
    /// Boolean.
    Bool,
}

impl FieldType {
    /// Human-readable type name for error messages.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Utf8 => "utf8",
            Self::Int64 => "int64",
            Self::Float64 => "float64",
            Self::Bool => "bool",
        }
    }
}

/// One declared field of the payload object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Field name as it appears in the payload.
    pub name: String,
    /// Expected primitive type.
    pub data_type: FieldType,
    /// Whether the field may be absent (decoded as explicit unset).
    pub optional: bool,
}

impl FieldSpec {
    /// A field that must be present in every payload.
    #[must_use]
    pub fn required(name: impl Into<String>, data_type: FieldType) -> Self {
        Self {
            name: name.into(),
            data_type,
            optional: false,
        }
    }

    /// A field that may be absent.
    #[must_use]
    pub fn optional(name: impl Into<String>, data_type: FieldType) -> Self {
        Self {
            name: name.into(),
            data_type,
            optional: true,
        }
    }
}

/// The expected shape of decoded records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordShape {
    /// Declared payload fields, in output column order.
    pub fields: Vec<FieldSpec>,
    /// Payload field holding the event timestamp (RFC 3339 string or
    /// epoch milliseconds). When `None`, the decoder falls back to the
    /// message's ingest timestamp.
    pub event_time_field: Option<String>,
}

impl RecordShape {
    /// Create a shape with the given fields and no event-time field.
    #[must_use]
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self {
            fields,
            event_time_field: None,
        }
    }

    /// Designate a payload field as the event-time source.
    #[must_use]
    pub fn with_event_time_field(mut self, name: impl Into<String>) -> Self {
        self.event_time_field = Some(name.into());
        self
    }

    /// Look up a declared field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }
}
