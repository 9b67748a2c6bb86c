//! Dead-letter sinks for messages that fail decoding.
//!
//! Diversion is fire-and-forget by contract: a dead-letter write failure
//! is logged and dropped, never propagated, so a broken sink cannot take
//! down an otherwise healthy pipeline. The orchestrator separately
//! guards against silent mass data loss with a per-batch failure-ratio
//! threshold.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use alluvial_core::{DecodeError, RawMessage};

/// Cap on retained raw payload bytes per dead-letter record.
const MAX_RAW_BYTES: usize = 8 * 1024;

/// A diverted message with enough context to diagnose and replay it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadLetterRecord {
    /// Topic the message came from.
    pub topic: String,
    /// Partition the message came from.
    pub partition: i32,
    /// Offset of the message.
    pub offset: i64,
    /// Stable error label, e.g. `schema_mismatch`.
    pub error_kind: String,
    /// Full error message.
    pub error: String,
    /// RFC 3339 ingest timestamp of the message.
    pub ingest_time: String,
    /// Raw payload, lossily decoded and truncated to a sane size.
    pub raw_payload: String,
    /// RFC 3339 timestamp of the diversion itself.
    pub recorded_at: String,
}

impl DeadLetterRecord {
    fn new(message: &RawMessage, error: &DecodeError) -> Self {
        let kept = &message.payload[..message.payload.len().min(MAX_RAW_BYTES)];
        Self {
            topic: message.source.topic.clone(),
            partition: message.source.partition,
            offset: message.offset,
            error_kind: error.kind().to_string(),
            error: error.to_string(),
            ingest_time: message.ingest_time.to_rfc3339(),
            raw_payload: String::from_utf8_lossy(kept).into_owned(),
            recorded_at: Utc::now().to_rfc3339(),
        }
    }
}

/// Destination for messages the decoder rejected.
#[async_trait]
pub trait DeadLetterSink: Send {
    /// Record one diverted message. Must not fail the caller: sink
    /// implementations log their own errors.
    async fn record(&mut self, message: &RawMessage, error: &DecodeError);
}

/// Collects dead letters in memory. Used in tests and for small
/// diagnostic runs.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterSink {
    records: Vec<DeadLetterRecord>,
}

impl InMemoryDeadLetterSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records collected so far.
    #[must_use]
    pub fn records(&self) -> &[DeadLetterRecord] {
        &self.records
    }

    /// Number of records collected.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` if nothing has been diverted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn record(&mut self, message: &RawMessage, error: &DecodeError) {
        self.records.push(DeadLetterRecord::new(message, error));
    }
}

/// Appends dead letters as JSON lines to a local file.
#[derive(Debug)]
pub struct JsonlDeadLetterSink {
    path: PathBuf,
}

impl JsonlDeadLetterSink {
    /// Create a sink appending to `path`. The file is created on first
    /// write.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn append(&self, record: &DeadLetterRecord) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await
    }
}

#[async_trait]
impl DeadLetterSink for JsonlDeadLetterSink {
    async fn record(&mut self, message: &RawMessage, error: &DecodeError) {
        let record = DeadLetterRecord::new(message, error);
        if let Err(e) = self.append(&record).await {
            warn!(
                path = %self.path.display(),
                source = %message.source,
                offset = message.offset,
                error = %e,
                "dead-letter append failed; record dropped"
            );
        }
    }
}
