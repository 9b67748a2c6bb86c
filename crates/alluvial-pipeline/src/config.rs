//! Pipeline configuration.

use std::path::PathBuf;
use std::time::Duration;

use alluvial_connectors::{
    EnvelopeDecoder, JsonlDeadLetterSink, KafkaSource, KafkaSourceConfig, StartingOffsets,
};
use alluvial_core::RecordShape;
use alluvial_storage::{BatchWriter, BatchWriterConfig, CheckpointStore, CommitProtocol};

use crate::orchestrator::{Orchestrator, PipelineError};

/// Knobs of the orchestrator loop itself.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Maximum messages per poll.
    pub max_poll_records: usize,
    /// How long one poll may block waiting for messages.
    pub poll_timeout: Duration,
    /// Per-batch decode-failure ratio above which the iteration is
    /// aborted and retried. `1.0` disables the guard.
    pub dead_letter_threshold: f64,
    /// Initial backoff interval for poll/flush/commit retries.
    pub retry_initial_interval: Duration,
    /// Total time budget for one poll/flush/commit retry sequence.
    pub retry_max_elapsed: Duration,
    /// Sleep between iterations when the source is idle.
    pub idle_backoff: Duration,
    /// Where to start reading on startup.
    pub starting_offsets: StartingOffsets,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            max_poll_records: 500,
            poll_timeout: Duration::from_secs(1),
            dead_letter_threshold: 0.5,
            retry_initial_interval: Duration::from_millis(200),
            retry_max_elapsed: Duration::from_secs(30),
            idle_backoff: Duration::from_millis(500),
            starting_offsets: StartingOffsets::default(),
        }
    }
}

/// Everything needed to assemble a Kafka-to-Parquet pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Source connector configuration.
    pub kafka: KafkaSourceConfig,
    /// Declared shape of decoded records.
    pub shape: RecordShape,
    /// Root of the partitioned Parquet output tree.
    pub output_root: PathBuf,
    /// Directory holding the checkpoint document.
    pub checkpoint_dir: PathBuf,
    /// JSON-lines file receiving dead-lettered messages.
    pub dead_letter_path: PathBuf,
    /// File visibility protocol for the writer.
    pub commit_protocol: CommitProtocol,
    /// Per-file write deadline.
    pub write_deadline: Duration,
    /// Loop knobs.
    pub orchestrator: OrchestratorOptions,
}

impl PipelineConfig {
    /// Defaults for the given source, shape, and directories. The
    /// dead-letter file lands beside the output tree.
    #[must_use]
    pub fn new(
        kafka: KafkaSourceConfig,
        shape: RecordShape,
        output_root: impl Into<PathBuf>,
        checkpoint_dir: impl Into<PathBuf>,
    ) -> Self {
        let output_root = output_root.into();
        let dead_letter_path = output_root.join("_dead_letters.jsonl");
        Self {
            kafka,
            shape,
            output_root,
            checkpoint_dir: checkpoint_dir.into(),
            dead_letter_path,
            commit_protocol: CommitProtocol::default(),
            write_deadline: Duration::from_secs(30),
            orchestrator: OrchestratorOptions::default(),
        }
    }

    /// Assemble the orchestrator. Nothing connects to Kafka until
    /// [`Orchestrator::run`](crate::orchestrator::Orchestrator::run).
    pub fn build(mut self) -> Result<Orchestrator<KafkaSource, JsonlDeadLetterSink>, PipelineError> {
        // One starting-offset policy drives both the consumer's
        // auto.offset.reset and the orchestrator's checkpoint seek.
        self.kafka.starting_offsets = self.orchestrator.starting_offsets;

        let checkpoints = CheckpointStore::open(&self.checkpoint_dir)?;
        let mut writer_config = BatchWriterConfig::new(&self.output_root);
        writer_config.commit_protocol = self.commit_protocol;
        writer_config.write_deadline = self.write_deadline;

        Ok(Orchestrator::new(
            KafkaSource::new(self.kafka),
            EnvelopeDecoder::new(self.shape.clone()),
            JsonlDeadLetterSink::new(self.dead_letter_path),
            BatchWriter::new(self.shape, writer_config),
            checkpoints,
            self.orchestrator,
        ))
    }
}
