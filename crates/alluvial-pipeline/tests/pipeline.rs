//! End-to-end orchestrator tests over an in-memory source connector.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use alluvial_connectors::{
    DeadLetterSink, EnvelopeDecoder, SourceConnector, SourceError, StartingOffsets,
};
use alluvial_core::{
    DecodeError, FieldSpec, FieldType, MicroBatch, PartitionPath, RawMessage, RecordShape,
    SourcePartition,
};
use alluvial_pipeline::{BatchOutcome, Orchestrator, OrchestratorOptions, PipelineError};
use alluvial_storage::{BatchWriter, BatchWriterConfig, CheckpointStore};

const TOPIC: &str = "ora_cdc_demo";

fn ingest_time() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 0).unwrap()
}

fn shape() -> RecordShape {
    RecordShape::new(vec![
        FieldSpec::optional("id", FieldType::Utf8),
        FieldSpec::optional("name", FieldType::Utf8),
    ])
}

fn envelope(id: &str, name: &str) -> Vec<u8> {
    format!(r#"{{"schema":{{"type":"struct"}},"payload":{{"id":"{id}","name":"{name}"}}}}"#)
        .into_bytes()
}

fn schema_only() -> Vec<u8> {
    br#"{"schema":{"type":"struct"}}"#.to_vec()
}

// ── In-memory source ────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryInner {
    log: BTreeMap<i32, Vec<Vec<u8>>>,
    positions: BTreeMap<SourcePartition, i64>,
    upstream_commits: BTreeMap<SourcePartition, i64>,
    open: bool,
}

/// Cloneable handle over shared state so tests can inspect the source
/// after the orchestrator takes ownership of its clone.
#[derive(Clone, Default)]
struct MemorySource {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemorySource {
    fn with_partition(self, partition: i32, messages: Vec<Vec<u8>>) -> Self {
        self.inner.lock().unwrap().log.insert(partition, messages);
        self
    }

    fn upstream_commits(&self) -> BTreeMap<SourcePartition, i64> {
        self.inner.lock().unwrap().upstream_commits.clone()
    }
}

#[async_trait]
impl SourceConnector for MemorySource {
    async fn open(&mut self) -> Result<(), SourceError> {
        let mut inner = self.inner.lock().unwrap();
        let partitions: Vec<i32> = inner.log.keys().copied().collect();
        for p in partitions {
            inner
                .positions
                .entry(SourcePartition::new(TOPIC, p))
                .or_insert(0);
        }
        inner.open = true;
        Ok(())
    }

    async fn poll(
        &mut self,
        max_records: usize,
        _timeout: Duration,
    ) -> Result<Vec<RawMessage>, SourceError> {
        let mut inner = self.inner.lock().unwrap();
        let mut out = Vec::new();
        let partitions: Vec<i32> = inner.log.keys().copied().collect();
        for p in partitions {
            let sp = SourcePartition::new(TOPIC, p);
            let mut pos = inner.positions.get(&sp).copied().unwrap_or(0);
            while out.len() < max_records {
                let Some(payload) = inner.log[&p].get(usize::try_from(pos).unwrap()).cloned()
                else {
                    break;
                };
                out.push(RawMessage::new(sp.clone(), pos, payload, ingest_time()));
                pos += 1;
            }
            inner.positions.insert(sp, pos);
        }
        Ok(out)
    }

    fn current_assignment(&self) -> Vec<SourcePartition> {
        self.inner
            .lock()
            .unwrap()
            .log
            .keys()
            .map(|&p| SourcePartition::new(TOPIC, p))
            .collect()
    }

    async fn seek(&mut self, offsets: &BTreeMap<SourcePartition, i64>) -> Result<(), SourceError> {
        let mut inner = self.inner.lock().unwrap();
        for (sp, &offset) in offsets {
            inner.positions.insert(sp.clone(), offset);
        }
        Ok(())
    }

    async fn commit(
        &mut self,
        offsets: &BTreeMap<SourcePartition, i64>,
    ) -> Result<(), SourceError> {
        let mut inner = self.inner.lock().unwrap();
        for (sp, &offset) in offsets {
            inner.upstream_commits.insert(sp.clone(), offset);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        self.inner.lock().unwrap().open = false;
        Ok(())
    }
}

/// Delegates to a [`MemorySource`] but fails the first `failures_left`
/// polls, emulating transient broker trouble.
struct FlakyPollSource {
    inner: MemorySource,
    failures_left: u32,
}

#[async_trait]
impl SourceConnector for FlakyPollSource {
    async fn open(&mut self) -> Result<(), SourceError> {
        self.inner.open().await
    }

    async fn poll(
        &mut self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<RawMessage>, SourceError> {
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(SourceError::PollFailed("broker unreachable".into()));
        }
        self.inner.poll(max_records, timeout).await
    }

    fn current_assignment(&self) -> Vec<SourcePartition> {
        self.inner.current_assignment()
    }

    async fn seek(&mut self, offsets: &BTreeMap<SourcePartition, i64>) -> Result<(), SourceError> {
        self.inner.seek(offsets).await
    }

    async fn commit(
        &mut self,
        offsets: &BTreeMap<SourcePartition, i64>,
    ) -> Result<(), SourceError> {
        self.inner.commit(offsets).await
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        self.inner.close().await
    }
}

// ── Shared dead-letter sink ─────────────────────────────────────────────

#[derive(Clone, Default)]
struct SharedDeadLetterSink {
    records: Arc<Mutex<Vec<(i64, String)>>>,
}

impl SharedDeadLetterSink {
    fn recorded(&self) -> Vec<(i64, String)> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeadLetterSink for SharedDeadLetterSink {
    async fn record(&mut self, message: &RawMessage, error: &DecodeError) {
        self.records
            .lock()
            .unwrap()
            .push((message.offset, error.kind().to_string()));
    }
}

// ── Harness ─────────────────────────────────────────────────────────────

struct Harness {
    source: MemorySource,
    sink: SharedDeadLetterSink,
    orchestrator: Orchestrator<MemorySource, SharedDeadLetterSink>,
}

fn harness(
    source: MemorySource,
    out_dir: &Path,
    ckpt_dir: &Path,
    options: OrchestratorOptions,
) -> Harness {
    let sink = SharedDeadLetterSink::default();
    let orchestrator = Orchestrator::new(
        source.clone(),
        EnvelopeDecoder::new(shape()),
        sink.clone(),
        BatchWriter::new(shape(), BatchWriterConfig::new(out_dir)),
        CheckpointStore::open(ckpt_dir).unwrap(),
        options,
    );
    Harness {
        source,
        sink,
        orchestrator,
    }
}

fn parquet_files(root: &Path) -> Vec<String> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                if path.file_name().is_some_and(|n| n != ".staging") {
                    stack.push(path);
                }
            } else if path.extension().is_some_and(|e| e == "parquet") {
                files.push(path.strip_prefix(root).unwrap().display().to_string());
            }
        }
    }
    files.sort();
    files
}

// ── Scenarios ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_happy_path_batch_lands_in_date_hour_partition() {
    let dir = tempfile::tempdir().unwrap();
    let (out, ckpt) = (dir.path().join("out"), dir.path().join("ckpt"));
    let source = MemorySource::default()
        .with_partition(0, vec![envelope("1", "A"), envelope("2", "B")]);
    let mut h = harness(source, &out, &ckpt, OrchestratorOptions::default());

    h.orchestrator.start().await.unwrap();
    let outcome = h.orchestrator.run_once().await.unwrap();
    assert_eq!(outcome, BatchOutcome::Committed { records: 2, files: 1 });

    assert_eq!(
        parquet_files(&out),
        vec![
            "2024-03-01/10/ora_cdc_demo-0-00000000000000000000-00000000000000000001.parquet"
                .to_string()
        ]
    );
    let stored = CheckpointStore::open(&ckpt).unwrap().load().unwrap();
    assert_eq!(stored[&SourcePartition::new(TOPIC, 0)], 2);
    assert_eq!(h.source.upstream_commits()[&SourcePartition::new(TOPIC, 0)], 2);
    assert!(h.sink.recorded().is_empty());
}

#[tokio::test]
async fn test_missing_payload_is_diverted_and_batch_continues() {
    let dir = tempfile::tempdir().unwrap();
    let (out, ckpt) = (dir.path().join("out"), dir.path().join("ckpt"));
    let source = MemorySource::default().with_partition(
        0,
        vec![envelope("1", "A"), schema_only(), envelope("3", "C")],
    );
    let mut h = harness(source, &out, &ckpt, OrchestratorOptions::default());

    h.orchestrator.start().await.unwrap();
    let outcome = h.orchestrator.run_once().await.unwrap();
    assert_eq!(outcome, BatchOutcome::Committed { records: 2, files: 1 });

    // The diverted offset is still committed past.
    let stored = CheckpointStore::open(&ckpt).unwrap().load().unwrap();
    assert_eq!(stored[&SourcePartition::new(TOPIC, 0)], 3);
    assert_eq!(h.sink.recorded(), vec![(1, "missing_payload".to_string())]);
}

#[tokio::test]
async fn test_threshold_breach_aborts_and_rewinds() {
    let dir = tempfile::tempdir().unwrap();
    let (out, ckpt) = (dir.path().join("out"), dir.path().join("ckpt"));
    let source = MemorySource::default().with_partition(
        0,
        vec![envelope("1", "A"), schema_only(), schema_only(), envelope("4", "D")],
    );
    let options = OrchestratorOptions {
        dead_letter_threshold: 0.25,
        ..OrchestratorOptions::default()
    };
    let mut h = harness(source, &out, &ckpt, options);

    h.orchestrator.start().await.unwrap();
    let outcome = h.orchestrator.run_once().await.unwrap();
    assert_eq!(outcome, BatchOutcome::Aborted { failed: 2, polled: 4 });

    // Nothing written, nothing committed.
    assert!(parquet_files(&out).is_empty());
    assert!(CheckpointStore::open(&ckpt).unwrap().load().unwrap().is_empty());

    // The rewind means the next iteration sees the same messages again.
    let again = h.orchestrator.run_once().await.unwrap();
    assert_eq!(again, BatchOutcome::Aborted { failed: 2, polled: 4 });

    // Aborted batches are redelivered, not diverted: two abort passes
    // over the same offsets must not append any dead letters.
    assert!(h.sink.recorded().is_empty());
}

#[tokio::test]
async fn test_retried_batch_dead_letters_each_offset_once() {
    let dir = tempfile::tempdir().unwrap();
    let (out, ckpt) = (dir.path().join("out"), dir.path().join("ckpt"));
    let source = MemorySource::default()
        .with_partition(0, vec![envelope("1", "A"), schema_only(), schema_only()]);
    let options = OrchestratorOptions {
        dead_letter_threshold: 0.5,
        ..OrchestratorOptions::default()
    };
    let mut h = harness(source, &out, &ckpt, options);

    h.orchestrator.start().await.unwrap();
    let outcome = h.orchestrator.run_once().await.unwrap();
    assert_eq!(outcome, BatchOutcome::Aborted { failed: 2, polled: 3 });
    assert!(h.sink.recorded().is_empty());

    // Healthy traffic arrives behind the failures; the redelivered
    // batch is now under threshold and goes through.
    let _ = h.source.clone().with_partition(
        0,
        vec![
            envelope("1", "A"),
            schema_only(),
            schema_only(),
            envelope("4", "D"),
            envelope("5", "E"),
            envelope("6", "F"),
        ],
    );
    let outcome = h.orchestrator.run_once().await.unwrap();
    assert_eq!(outcome, BatchOutcome::Committed { records: 4, files: 1 });

    // Each failed offset lands in the dead letter exactly once, even
    // though the abort redelivered it.
    assert_eq!(
        h.sink.recorded(),
        vec![
            (1, "missing_payload".to_string()),
            (2, "missing_payload".to_string()),
        ]
    );
    let stored = CheckpointStore::open(&ckpt).unwrap().load().unwrap();
    assert_eq!(stored[&SourcePartition::new(TOPIC, 0)], 6);
}

#[tokio::test]
async fn test_crash_after_flush_before_commit_converges() {
    let dir = tempfile::tempdir().unwrap();
    let (out, ckpt) = (dir.path().join("out"), dir.path().join("ckpt"));
    let messages = vec![envelope("1", "A"), envelope("2", "B")];

    // A previous run flushed this batch and crashed before committing.
    let decoder = EnvelopeDecoder::new(shape());
    let writer = BatchWriter::new(shape(), BatchWriterConfig::new(&out));
    let mut batch = MicroBatch::new();
    for (offset, payload) in messages.iter().enumerate() {
        let msg = RawMessage::new(
            SourcePartition::new(TOPIC, 0),
            i64::try_from(offset).unwrap(),
            payload.clone(),
            ingest_time(),
        );
        let record = decoder.decode(&msg).unwrap();
        batch.push(PartitionPath::derive(record.event_time), record);
    }
    writer.flush(&batch).await.unwrap();
    assert_eq!(parquet_files(&out).len(), 1);

    // The restarted pipeline redelivers from offset 0.
    let source = MemorySource::default().with_partition(0, messages);
    let mut h = harness(source, &out, &ckpt, OrchestratorOptions::default());
    h.orchestrator.start().await.unwrap();
    let outcome = h.orchestrator.run_once().await.unwrap();
    assert_eq!(outcome, BatchOutcome::Committed { records: 2, files: 1 });

    // Same single file, no duplicates; checkpoint caught up.
    assert_eq!(parquet_files(&out).len(), 1);
    let stored = CheckpointStore::open(&ckpt).unwrap().load().unwrap();
    assert_eq!(stored[&SourcePartition::new(TOPIC, 0)], 2);
}

#[tokio::test]
async fn test_restart_resumes_from_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let (out, ckpt) = (dir.path().join("out"), dir.path().join("ckpt"));
    let first_two = vec![envelope("1", "A"), envelope("2", "B")];

    let source = MemorySource::default().with_partition(0, first_two.clone());
    let mut h = harness(source, &out, &ckpt, OrchestratorOptions::default());
    h.orchestrator.start().await.unwrap();
    h.orchestrator.run_once().await.unwrap();

    // Restart with one more message appended to the log.
    let mut log = first_two;
    log.push(envelope("3", "C"));
    let source = MemorySource::default().with_partition(0, log);
    let mut h = harness(source, &out, &ckpt, OrchestratorOptions::default());
    h.orchestrator.start().await.unwrap();
    let outcome = h.orchestrator.run_once().await.unwrap();
    assert_eq!(outcome, BatchOutcome::Committed { records: 1, files: 1 });

    let files = parquet_files(&out);
    assert_eq!(files.len(), 2);
    assert!(files
        .iter()
        .any(|f| f.contains("00000000000000000002-00000000000000000002")));
    let stored = CheckpointStore::open(&ckpt).unwrap().load().unwrap();
    assert_eq!(stored[&SourcePartition::new(TOPIC, 0)], 3);
}

#[tokio::test]
async fn test_offset_regression_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let (out, ckpt) = (dir.path().join("out"), dir.path().join("ckpt"));

    // A checkpoint far ahead of the log, combined with a policy that
    // ignores it, forces a commit below the stored offset.
    let store = CheckpointStore::open(&ckpt).unwrap();
    store
        .advance(&BTreeMap::from([(SourcePartition::new(TOPIC, 0), 10)]))
        .unwrap();

    let source = MemorySource::default().with_partition(0, vec![envelope("1", "A")]);
    let options = OrchestratorOptions {
        starting_offsets: StartingOffsets::Earliest,
        ..OrchestratorOptions::default()
    };
    let mut h = harness(source, &out, &ckpt, options);

    h.orchestrator.start().await.unwrap();
    let err = h.orchestrator.run_once().await.unwrap_err();
    assert!(matches!(err, PipelineError::Checkpoint(_)));

    // The stored offset is untouched.
    let stored = CheckpointStore::open(&ckpt).unwrap().load().unwrap();
    assert_eq!(stored[&SourcePartition::new(TOPIC, 0)], 10);
}

#[tokio::test]
async fn test_shutdown_stops_an_idle_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let (out, ckpt) = (dir.path().join("out"), dir.path().join("ckpt"));
    let source = MemorySource::default().with_partition(0, Vec::new());
    let options = OrchestratorOptions {
        poll_timeout: Duration::from_millis(10),
        idle_backoff: Duration::from_millis(10),
        ..OrchestratorOptions::default()
    };
    let mut h = harness(source, &out, &ckpt, options);
    let handle = h.orchestrator.shutdown_handle();

    let run = tokio::spawn(async move { h.orchestrator.run().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.shutdown();

    let result = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("run did not observe shutdown")
        .unwrap();
    result.unwrap();
}

#[tokio::test]
async fn test_shutdown_after_poll_still_commits_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    let (out, ckpt) = (dir.path().join("out"), dir.path().join("ckpt"));
    let source = MemorySource::default().with_partition(0, vec![envelope("1", "A")]);
    let mut h = harness(source, &out, &ckpt, OrchestratorOptions::default());
    let handle = h.orchestrator.shutdown_handle();

    h.orchestrator.start().await.unwrap();
    // Shutdown is already requested when the iteration runs; the polled
    // batch still completes its flush and commit instead of being
    // dropped mid-pipeline.
    handle.shutdown();
    let outcome = h.orchestrator.run_once().await.unwrap();
    assert_eq!(outcome, BatchOutcome::Committed { records: 1, files: 1 });

    let stored = CheckpointStore::open(&ckpt).unwrap().load().unwrap();
    assert_eq!(stored[&SourcePartition::new(TOPIC, 0)], 1);
}

#[tokio::test]
async fn test_transient_poll_failures_are_absorbed_with_backoff() {
    let dir = tempfile::tempdir().unwrap();
    let (out, ckpt) = (dir.path().join("out"), dir.path().join("ckpt"));
    let inner = MemorySource::default().with_partition(0, vec![envelope("1", "A")]);
    let source = FlakyPollSource {
        inner,
        failures_left: 2,
    };
    let options = OrchestratorOptions {
        retry_initial_interval: Duration::from_millis(10),
        ..OrchestratorOptions::default()
    };
    let mut orchestrator = Orchestrator::new(
        source,
        EnvelopeDecoder::new(shape()),
        SharedDeadLetterSink::default(),
        BatchWriter::new(shape(), BatchWriterConfig::new(&out)),
        CheckpointStore::open(&ckpt).unwrap(),
        options,
    );

    orchestrator.start().await.unwrap();
    let outcome = orchestrator.run_once().await.unwrap();
    assert_eq!(outcome, BatchOutcome::Committed { records: 1, files: 1 });
}

#[tokio::test]
async fn test_poll_failures_past_retry_budget_are_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let (out, ckpt) = (dir.path().join("out"), dir.path().join("ckpt"));
    let inner = MemorySource::default().with_partition(0, vec![envelope("1", "A")]);
    let source = FlakyPollSource {
        inner,
        failures_left: u32::MAX,
    };
    let options = OrchestratorOptions {
        retry_initial_interval: Duration::from_millis(5),
        retry_max_elapsed: Duration::from_millis(25),
        ..OrchestratorOptions::default()
    };
    let mut orchestrator = Orchestrator::new(
        source,
        EnvelopeDecoder::new(shape()),
        SharedDeadLetterSink::default(),
        BatchWriter::new(shape(), BatchWriterConfig::new(&out)),
        CheckpointStore::open(&ckpt).unwrap(),
        options,
    );

    orchestrator.start().await.unwrap();
    let err = orchestrator.run_once().await.unwrap_err();
    assert!(matches!(err, PipelineError::Source(SourceError::PollFailed(_))));
}
