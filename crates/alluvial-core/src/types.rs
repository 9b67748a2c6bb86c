//! Core data model for the ingestion pipeline.
//!
//! The types here trace the life of a CDC event through the pipeline:
//! a [`RawMessage`] is pulled from the log, decoded into a
//! [`DecodedRecord`], grouped into a [`MicroBatch`], and, once the
//! batch's files are durably visible, acknowledged via a
//! [`CheckpointRecord`].

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::partition::PartitionPath;

/// Identifies one partition of the upstream log (topic + partition index).
///
/// `Display` renders as `topic-partition`, which doubles as the key format
/// in the persisted checkpoint document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourcePartition {
    /// Topic name.
    pub topic: String,
    /// Partition index within the topic.
    pub partition: i32,
}

impl SourcePartition {
    /// Create a new source partition identifier.
    #[must_use]
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    /// Checkpoint-document key for this partition (`topic-partition`).
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}-{}", self.topic, self.partition)
    }
}

impl fmt::Display for SourcePartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// An undecoded message as delivered by the source connector.
///
/// Immutable once delivered. The same offset may be redelivered after a
/// crash (at-least-once upstream semantics); downstream stages are
/// responsible for making that harmless.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Which log partition the message came from.
    pub source: SourcePartition,
    /// Offset of the message within its partition.
    pub offset: i64,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
    /// Broker/ingest timestamp attached at delivery time.
    pub ingest_time: DateTime<Utc>,
}

impl RawMessage {
    /// Create a new raw message.
    #[must_use]
    pub fn new(
        source: SourcePartition,
        offset: i64,
        payload: Vec<u8>,
        ingest_time: DateTime<Utc>,
    ) -> Self {
        Self {
            source,
            offset,
            payload,
            ingest_time,
        }
    }
}

/// A decoded field value with explicit unset semantics.
///
/// Optional fields absent from a payload are represented as [`Unset`],
/// never coerced to an empty string or zero; a silent default would be
/// indistinguishable from real data in the output files.
///
/// [`Unset`]: FieldValue::Unset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum FieldValue {
    /// UTF-8 string value.
    Utf8(String),
    /// 64-bit signed integer value.
    Int64(i64),
    /// 64-bit float value.
    Float64(f64),
    /// Boolean value.
    Bool(bool),
    /// Declared-but-absent optional field.
    Unset,
}

impl FieldValue {
    /// Returns `true` for [`FieldValue::Unset`].
    #[must_use]
    pub fn is_unset(&self) -> bool {
        matches!(self, Self::Unset)
    }

    /// Returns the string value, if this is a set `Utf8` field.
    #[must_use]
    pub fn as_utf8(&self) -> Option<&str> {
        match self {
            Self::Utf8(s) => Some(s),
            _ => None,
        }
    }
}

/// A successfully decoded record, ready for partition derivation.
///
/// Invariant: `event_time` is always present. A payload without a usable
/// event time is rejected at decode, since a wrong default would corrupt
/// the partition path.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRecord {
    /// Declared business fields in shape order.
    pub fields: BTreeMap<String, FieldValue>,
    /// Event time, normalized to UTC.
    pub event_time: DateTime<Utc>,
    /// Copy of the raw payload, retained as an output column for debugging.
    pub raw_value: String,
    /// Log partition the record was consumed from.
    pub source: SourcePartition,
    /// Offset of the originating message.
    pub offset: i64,
}

/// Inclusive range of offsets consumed from one source partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetRange {
    /// First offset in the range.
    pub first: i64,
    /// Last offset in the range.
    pub last: i64,
}

impl OffsetRange {
    /// Create a single-offset range.
    #[must_use]
    pub fn at(offset: i64) -> Self {
        Self {
            first: offset,
            last: offset,
        }
    }

    /// Widen the range to include `offset`.
    pub fn extend(&mut self, offset: i64) {
        self.first = self.first.min(offset);
        self.last = self.last.max(offset);
    }

    /// The offset the next poll should start from (last consumed + 1).
    #[must_use]
    pub fn next(&self) -> i64 {
        self.last + 1
    }
}

/// One orchestrator iteration's worth of decoded records, grouped by
/// `(partition path, source partition)`, plus the offset ranges consumed
/// to produce them.
///
/// A micro-batch is created per iteration, consumed entirely by one
/// `BatchWriter::flush` call, and then discarded. The group key makes the
/// writer's output filenames a pure function of the batch contents.
#[derive(Debug, Default)]
pub struct MicroBatch {
    groups: BTreeMap<(PartitionPath, SourcePartition), Vec<DecodedRecord>>,
    offsets: BTreeMap<SourcePartition, OffsetRange>,
}

impl MicroBatch {
    /// Create an empty micro-batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record under its derived partition path.
    pub fn push(&mut self, path: PartitionPath, record: DecodedRecord) {
        self.observe_offset(&record.source, record.offset);
        self.groups
            .entry((path, record.source.clone()))
            .or_default()
            .push(record);
    }

    /// Mark an offset as consumed without adding a record.
    ///
    /// Dead-lettered messages still count toward the batch's offset
    /// ranges: they were consumed and handled, so committing past them
    /// must not stall on the diverted offsets.
    pub fn observe_offset(&mut self, source: &SourcePartition, offset: i64) {
        self.offsets
            .entry(source.clone())
            .and_modify(|r| r.extend(offset))
            .or_insert_with(|| OffsetRange::at(offset));
    }

    /// Returns `true` if no records have been added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Total number of records in the batch.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    /// Record groups keyed by `(partition path, source partition)`.
    #[must_use]
    pub fn groups(&self) -> &BTreeMap<(PartitionPath, SourcePartition), Vec<DecodedRecord>> {
        &self.groups
    }

    /// Offset ranges consumed per source partition.
    #[must_use]
    pub fn offsets(&self) -> &BTreeMap<SourcePartition, OffsetRange> {
        &self.offsets
    }

    /// Per-partition offsets to commit after a successful flush: the next
    /// offset to read for each source partition in the batch.
    #[must_use]
    pub fn commit_offsets(&self) -> BTreeMap<SourcePartition, i64> {
        self.offsets
            .iter()
            .map(|(sp, range)| (sp.clone(), range.next()))
            .collect()
    }
}

/// One durable row of the checkpoint document.
///
/// The stored offset is the next offset to read, so resuming from a
/// checkpoint never re-reads a committed message. Overwritten atomically
/// (as part of the whole document) on each successful flush.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Topic name.
    pub topic: String,
    /// Partition index.
    pub partition: i32,
    /// Next offset to read for this partition.
    pub offset: i64,
    /// RFC 3339 timestamp of the write that produced this record.
    pub written_at: String,
}

impl CheckpointRecord {
    /// Build a checkpoint record for `source` at `offset`, stamped now.
    #[must_use]
    pub fn new(source: &SourcePartition, offset: i64) -> Self {
        Self {
            topic: source.topic.clone(),
            partition: source.partition,
            offset,
            written_at: Utc::now().to_rfc3339(),
        }
    }

    /// The source partition this record belongs to.
    #[must_use]
    pub fn source(&self) -> SourcePartition {
        SourcePartition::new(self.topic.clone(), self.partition)
    }
}
