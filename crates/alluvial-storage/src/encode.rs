//! Columnar encoding of decoded records.
//!
//! The Arrow schema is derived from the pipeline's [`RecordShape`]:
//! one column per declared field (nullable iff the field is optional),
//! plus an `event_time` timestamp column and a `raw_value` column
//! retaining the original envelope text for debugging.

use std::sync::Arc;

use arrow_array::builder::{
    BooleanBuilder, Float64Builder, Int64Builder, StringBuilder, TimestampMillisecondBuilder,
};
use arrow_array::{ArrayRef, RecordBatch};
use arrow_schema::{DataType, Field, Schema, SchemaRef, TimeUnit};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;

use alluvial_core::{DecodedRecord, FieldSpec, FieldType, FieldValue, RecordShape, WriteError};

/// Name of the event-time output column.
pub const EVENT_TIME_COLUMN: &str = "event_time";

/// Name of the retained-raw-payload output column.
pub const RAW_VALUE_COLUMN: &str = "raw_value";

/// Tuning knobs for the Parquet encoder.
#[derive(Debug, Clone)]
pub struct ParquetEncodeConfig {
    /// Column compression codec.
    pub compression: Compression,
    /// Maximum rows per row group.
    pub max_row_group_size: usize,
}

impl Default for ParquetEncodeConfig {
    fn default() -> Self {
        Self {
            compression: Compression::SNAPPY,
            max_row_group_size: 16 * 1024,
        }
    }
}

impl ParquetEncodeConfig {
    /// Set the compression codec.
    #[must_use]
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Set the maximum rows per row group.
    #[must_use]
    pub fn with_max_row_group_size(mut self, rows: usize) -> Self {
        self.max_row_group_size = rows;
        self
    }
}

/// Encodes slices of [`DecodedRecord`] into Parquet file bytes.
#[derive(Debug, Clone)]
pub struct ParquetEncoder {
    shape: RecordShape,
    schema: SchemaRef,
    config: ParquetEncodeConfig,
}

impl ParquetEncoder {
    /// Build an encoder for the given record shape.
    #[must_use]
    pub fn new(shape: RecordShape, config: ParquetEncodeConfig) -> Self {
        let schema = Arc::new(arrow_schema(&shape));
        Self {
            shape,
            schema,
            config,
        }
    }

    /// The derived Arrow schema.
    #[must_use]
    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// Encode `records` into a complete Parquet file.
    pub fn encode(&self, records: &[DecodedRecord]) -> Result<Vec<u8>, WriteError> {
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(self.shape.fields.len() + 2);
        for spec in &self.shape.fields {
            columns.push(field_column(spec, records)?);
        }
        columns.push(event_time_column(records));
        columns.push(raw_value_column(records));

        let batch = RecordBatch::try_new(Arc::clone(&self.schema), columns)
            .map_err(|e| WriteError::Encode(e.to_string()))?;

        let props = WriterProperties::builder()
            .set_compression(self.config.compression)
            .set_max_row_group_size(self.config.max_row_group_size)
            .build();
        let mut buf = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buf, Arc::clone(&self.schema), Some(props))
            .map_err(|e| WriteError::Encode(e.to_string()))?;
        writer
            .write(&batch)
            .map_err(|e| WriteError::Encode(e.to_string()))?;
        writer
            .close()
            .map_err(|e| WriteError::Encode(e.to_string()))?;
        Ok(buf)
    }
}

fn arrow_schema(shape: &RecordShape) -> Schema {
    let mut fields: Vec<Field> = shape
        .fields
        .iter()
        .map(|spec| Field::new(&spec.name, arrow_type(spec.data_type), spec.optional))
        .collect();
    fields.push(Field::new(
        EVENT_TIME_COLUMN,
        DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into())),
        false,
    ));
    fields.push(Field::new(RAW_VALUE_COLUMN, DataType::Utf8, false));
    Schema::new(fields)
}

fn arrow_type(field_type: FieldType) -> DataType {
    match field_type {
        FieldType::Utf8 => DataType::Utf8,
        FieldType::Int64 => DataType::Int64,
        FieldType::Float64 => DataType::Float64,
        FieldType::Bool => DataType::Boolean,
    }
}

fn field_column(spec: &FieldSpec, records: &[DecodedRecord]) -> Result<ArrayRef, WriteError> {
    let type_error = |value: &FieldValue| {
        WriteError::Encode(format!(
            "field '{}' holds {value:?}, expected {}",
            spec.name,
            spec.data_type.name()
        ))
    };
    match spec.data_type {
        FieldType::Utf8 => {
            let mut builder = StringBuilder::new();
            for record in records {
                match record.fields.get(&spec.name) {
                    Some(FieldValue::Utf8(s)) => builder.append_value(s),
                    Some(FieldValue::Unset) | None => builder.append_null(),
                    Some(other) => return Err(type_error(other)),
                }
            }
            Ok(Arc::new(builder.finish()))
        }
        FieldType::Int64 => {
            let mut builder = Int64Builder::new();
            for record in records {
                match record.fields.get(&spec.name) {
                    Some(FieldValue::Int64(v)) => builder.append_value(*v),
                    Some(FieldValue::Unset) | None => builder.append_null(),
                    Some(other) => return Err(type_error(other)),
                }
            }
            Ok(Arc::new(builder.finish()))
        }
        FieldType::Float64 => {
            let mut builder = Float64Builder::new();
            for record in records {
                match record.fields.get(&spec.name) {
                    Some(FieldValue::Float64(v)) => builder.append_value(*v),
                    Some(FieldValue::Unset) | None => builder.append_null(),
                    Some(other) => return Err(type_error(other)),
                }
            }
            Ok(Arc::new(builder.finish()))
        }
        FieldType::Bool => {
            let mut builder = BooleanBuilder::new();
            for record in records {
                match record.fields.get(&spec.name) {
                    Some(FieldValue::Bool(v)) => builder.append_value(*v),
                    Some(FieldValue::Unset) | None => builder.append_null(),
                    Some(other) => return Err(type_error(other)),
                }
            }
            Ok(Arc::new(builder.finish()))
        }
    }
}

fn event_time_column(records: &[DecodedRecord]) -> ArrayRef {
    let mut builder = TimestampMillisecondBuilder::new().with_timezone("UTC");
    for record in records {
        builder.append_value(record.event_time.timestamp_millis());
    }
    Arc::new(builder.finish())
}

fn raw_value_column(records: &[DecodedRecord]) -> ArrayRef {
    let mut builder = StringBuilder::new();
    for record in records {
        builder.append_value(&record.raw_value);
    }
    Arc::new(builder.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use arrow_array::{Array, Int64Array, StringArray};
    use bytes::Bytes;
    use chrono::{TimeZone, Utc};
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    use alluvial_core::SourcePartition;

    fn shape() -> RecordShape {
        RecordShape::new(vec![
            FieldSpec::optional("id", FieldType::Utf8),
            FieldSpec::optional("name", FieldType::Utf8),
            FieldSpec::optional("amount", FieldType::Int64),
        ])
    }

    fn record(id: Option<&str>, name: Option<&str>, amount: Option<i64>) -> DecodedRecord {
        let mut fields = BTreeMap::new();
        fields.insert(
            "id".to_string(),
            id.map_or(FieldValue::Unset, |v| FieldValue::Utf8(v.into())),
        );
        fields.insert(
            "name".to_string(),
            name.map_or(FieldValue::Unset, |v| FieldValue::Utf8(v.into())),
        );
        fields.insert(
            "amount".to_string(),
            amount.map_or(FieldValue::Unset, FieldValue::Int64),
        );
        DecodedRecord {
            fields,
            event_time: Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 0).unwrap(),
            raw_value: r#"{"payload":{}}"#.to_string(),
            source: SourcePartition::new("events", 0),
            offset: 1,
        }
    }

    fn read_back(bytes: Vec<u8>) -> RecordBatch {
        let mut reader = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(bytes))
            .unwrap()
            .build()
            .unwrap();
        reader.next().unwrap().unwrap()
    }

    #[test]
    fn test_schema_has_shape_columns_plus_extras() {
        let encoder = ParquetEncoder::new(shape(), ParquetEncodeConfig::default());
        let names: Vec<&str> = encoder
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().as_str())
            .collect();
        assert_eq!(names, vec!["id", "name", "amount", "event_time", "raw_value"]);
    }

    #[test]
    fn test_encode_round_trip() {
        let encoder = ParquetEncoder::new(shape(), ParquetEncodeConfig::default());
        let records = vec![
            record(Some("1"), Some("A"), Some(10)),
            record(Some("2"), None, None),
        ];

        let batch = read_back(encoder.encode(&records).unwrap());
        assert_eq!(batch.num_rows(), 2);

        let ids = batch
            .column_by_name("id")
            .unwrap()
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(ids.value(0), "1");
        assert_eq!(ids.value(1), "2");

        // Unset stays null, never a default.
        let names = batch
            .column_by_name("name")
            .unwrap()
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert!(names.is_null(1));
        let amounts = batch
            .column_by_name("amount")
            .unwrap()
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        assert!(amounts.is_null(1));
    }

    #[test]
    fn test_raw_value_column_retained() {
        let encoder = ParquetEncoder::new(shape(), ParquetEncodeConfig::default());
        let batch = read_back(encoder.encode(&[record(Some("1"), None, None)]).unwrap());
        let raw = batch
            .column_by_name("raw_value")
            .unwrap()
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(raw.value(0), r#"{"payload":{}}"#);
    }

    #[test]
    fn test_type_mismatch_is_encode_error() {
        let encoder = ParquetEncoder::new(shape(), ParquetEncodeConfig::default());
        let mut bad = record(Some("1"), None, None);
        bad.fields.insert("id".into(), FieldValue::Int64(42));

        let err = encoder.encode(&[bad]).unwrap_err();
        assert!(matches!(err, WriteError::Encode(_)));
        assert!(!err.is_retryable());
    }
}
