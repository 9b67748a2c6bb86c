//! The micro-batch orchestrator.
//!
//! Each iteration walks the state machine
//! `Idle → Polling → Decoding → Writing → Committing → Idle`. Offsets
//! commit strictly after the batch's files are durably visible. Combined
//! with the writer's deterministic filenames and the checkpoint store's
//! monotonicity guard, this makes crash-and-redeliver runs converge on
//! the same output with no duplicates.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use alluvial_connectors::{DeadLetterSink, EnvelopeDecoder, SourceConnector, SourceError};
use alluvial_core::{
    CheckpointError, DecodeError, MicroBatch, PartitionPath, RawMessage, SourcePartition,
    WriteError,
};
use alluvial_storage::{BatchWriter, CheckpointStore, WrittenPaths};

use crate::config::OrchestratorOptions;

/// Errors that stop the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The source connector failed in a way retries could not absorb.
    #[error("source connector failed: {0}")]
    Source(#[from] SourceError),

    /// A flush kept failing past the retry budget, or failed
    /// non-retryably.
    #[error("batch flush failed: {0}")]
    Write(#[from] WriteError),

    /// Committing offsets failed fatally: an offset regression, or a
    /// store outage that outlived the retry budget.
    #[error("checkpoint commit failed: {0}")]
    Checkpoint(#[from] CheckpointError),
}

/// Where the orchestrator currently is in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Between iterations.
    Idle,
    /// Waiting on the source.
    Polling,
    /// Turning raw messages into records.
    Decoding,
    /// Flushing the micro-batch.
    Writing,
    /// Advancing checkpoints.
    Committing,
    /// Terminal; entered only between iterations.
    ShuttingDown,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Polling => "polling",
            Self::Decoding => "decoding",
            Self::Writing => "writing",
            Self::Committing => "committing",
            Self::ShuttingDown => "shutting_down",
        };
        f.write_str(name)
    }
}

/// Result of one orchestrator iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// The source had nothing.
    Idle,
    /// A batch was flushed and its offsets committed.
    Committed {
        /// Records written (dead-lettered messages excluded).
        records: usize,
        /// Files the flush accounts for, written or already present.
        files: usize,
    },
    /// The decode-failure ratio crossed the threshold; the source was
    /// rewound to the batch's first offsets and nothing was written or
    /// dead-lettered.
    Aborted {
        /// Messages that failed decoding.
        failed: usize,
        /// Messages polled.
        polled: usize,
    },
}

/// Requests a clean stop of a running [`Orchestrator`].
///
/// Observed between pipeline states: an already-polled batch always
/// completes (or fails) its flush/commit pair before the loop exits.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Signal shutdown. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// Drives the poll → decode → write → commit loop.
pub struct Orchestrator<S, D> {
    source: S,
    decoder: EnvelopeDecoder,
    dead_letter: D,
    writer: BatchWriter,
    checkpoints: CheckpointStore,
    options: OrchestratorOptions,
    state: PipelineState,
    committed: BTreeMap<SourcePartition, i64>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<S: SourceConnector, D: DeadLetterSink> Orchestrator<S, D> {
    /// Wire up an orchestrator. Nothing touches the source until
    /// [`start`](Self::start).
    #[must_use]
    pub fn new(
        source: S,
        decoder: EnvelopeDecoder,
        dead_letter: D,
        writer: BatchWriter,
        checkpoints: CheckpointStore,
        options: OrchestratorOptions,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            source,
            decoder,
            dead_letter,
            writer,
            checkpoints,
            options,
            state: PipelineState::Idle,
            committed: BTreeMap::new(),
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        }
    }

    /// Handle for requesting a clean stop from another task.
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Current state-machine position.
    #[must_use]
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Offsets committed so far (next-to-read per partition).
    #[must_use]
    pub fn committed_offsets(&self) -> &BTreeMap<SourcePartition, i64> {
        &self.committed
    }

    /// Open the source and position it per the starting-offset policy.
    ///
    /// Source errors here are fatal: a pipeline that cannot reach its
    /// upstream at startup has nothing sensible to retry into.
    pub async fn start(&mut self) -> Result<(), PipelineError> {
        self.source.open().await?;

        let stored = self.checkpoints.load()?;
        if self.options.starting_offsets.resumes_from_checkpoint() && !stored.is_empty() {
            self.source.seek(&stored).await?;
            info!(partitions = stored.len(), "resumed from checkpoint");
        } else {
            info!(
                policy = %self.options.starting_offsets.auto_offset_reset(),
                "no checkpoint applied; starting from policy position"
            );
        }
        self.committed = stored;
        Ok(())
    }

    /// Run until shutdown is requested or a fatal error occurs.
    pub async fn run(&mut self) -> Result<(), PipelineError> {
        self.start().await?;
        loop {
            if *self.shutdown_rx.borrow() {
                self.state = PipelineState::ShuttingDown;
                break;
            }
            match self.run_once().await? {
                BatchOutcome::Idle => self.idle_sleep().await,
                BatchOutcome::Aborted { .. } => {
                    tokio::time::sleep(self.options.retry_initial_interval).await;
                }
                BatchOutcome::Committed { .. } => {}
            }
        }
        info!("orchestrator shutting down");
        self.source.close().await?;
        Ok(())
    }

    /// One full pass of the state machine.
    pub async fn run_once(&mut self) -> Result<BatchOutcome, PipelineError> {
        self.state = PipelineState::Polling;
        let messages = self.poll_with_backoff().await?;
        if messages.is_empty() {
            self.state = PipelineState::Idle;
            return Ok(BatchOutcome::Idle);
        }

        // Shutdown is observed between states but never abandons a
        // polled batch: the flush/commit pair below still completes
        // before the loop exits.
        if *self.shutdown_rx.borrow() {
            info!("shutdown requested; completing in-flight batch first");
        }

        self.state = PipelineState::Decoding;
        let polled = messages.len();
        let mut batch = MicroBatch::new();
        let mut failures: Vec<(&RawMessage, DecodeError)> = Vec::new();
        for message in &messages {
            match self.decoder.decode(message) {
                Ok(record) => {
                    let path = PartitionPath::derive(record.event_time);
                    batch.push(path, record);
                }
                Err(e) => {
                    warn!(
                        source = %message.source,
                        offset = message.offset,
                        kind = e.kind(),
                        error = %e,
                        "decode failed"
                    );
                    batch.observe_offset(&message.source, message.offset);
                    failures.push((message, e));
                }
            }
        }

        let failed = failures.len();
        if failure_ratio(failed, polled) > self.options.dead_letter_threshold {
            warn!(failed, polled, "decode-failure ratio over threshold; aborting batch");
            self.rewind_to(&batch).await?;
            self.state = PipelineState::Idle;
            return Ok(BatchOutcome::Aborted { failed, polled });
        }

        // Diversion is the alternative to aborting. An aborted batch is
        // redelivered wholesale, so recording its failures up front
        // would append duplicate dead letters on every retry of a
        // poison batch.
        for (message, error) in &failures {
            info!(
                source = %message.source,
                offset = message.offset,
                "diverting failed decode to dead letter"
            );
            self.dead_letter.record(message, error).await;
        }

        self.state = PipelineState::Writing;
        let written = flush_with_retry(&self.writer, &batch, &self.options).await?;

        self.state = PipelineState::Committing;
        let commits = batch.commit_offsets();
        advance_with_retry(&self.checkpoints, &commits, &self.options).await?;
        self.committed.extend(commits.clone());

        // Consumer-group bookkeeping only; the checkpoint store already
        // holds the authoritative position.
        if let Err(e) = self.source.commit(&commits).await {
            warn!(error = %e, "best-effort source commit failed");
        }

        info!(
            records = batch.record_count(),
            files = written.file_count(),
            dead_lettered = failed,
            "micro-batch committed"
        );
        self.state = PipelineState::Idle;
        Ok(BatchOutcome::Committed {
            records: batch.record_count(),
            files: written.file_count(),
        })
    }

    /// Poll the source, absorbing transient failures with the same
    /// bounded exponential backoff the flush and commit paths use. When
    /// the retry budget runs out the last error surfaces as fatal.
    async fn poll_with_backoff(&mut self) -> Result<Vec<RawMessage>, PipelineError> {
        let mut policy = retry_policy(&self.options);
        loop {
            match self
                .source
                .poll(self.options.max_poll_records, self.options.poll_timeout)
                .await
            {
                Ok(messages) => return Ok(messages),
                Err(e) => {
                    let Some(delay) = policy.next_backoff() else {
                        error!(error = %e, "poll retries exhausted");
                        return Err(e.into());
                    };
                    warn!(error = %e, delay = ?delay, "poll failed; backing off");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Reposition the source at the aborted batch's first offsets so the
    /// next poll redelivers the same messages.
    async fn rewind_to(&mut self, batch: &MicroBatch) -> Result<(), PipelineError> {
        let firsts: BTreeMap<SourcePartition, i64> = batch
            .offsets()
            .iter()
            .map(|(sp, range)| (sp.clone(), range.first))
            .collect();
        debug!(partitions = firsts.len(), "rewinding source after aborted batch");
        self.source.seek(&firsts).await?;
        Ok(())
    }

    async fn idle_sleep(&mut self) {
        // Wake early if shutdown arrives during the idle wait.
        let _ = tokio::time::timeout(self.options.idle_backoff, self.shutdown_rx.changed()).await;
    }
}

fn failure_ratio(failed: usize, polled: usize) -> f64 {
    if polled == 0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    {
        failed as f64 / polled as f64
    }
}

fn retry_policy(options: &OrchestratorOptions) -> backoff::ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(options.retry_initial_interval)
        .with_max_elapsed_time(Some(options.retry_max_elapsed))
        .build()
}

async fn flush_with_retry(
    writer: &BatchWriter,
    batch: &MicroBatch,
    options: &OrchestratorOptions,
) -> Result<WrittenPaths, PipelineError> {
    let result = backoff::future::retry(retry_policy(options), || async {
        writer.flush(batch).await.map_err(|e| {
            if e.is_retryable() {
                warn!(error = %e, "flush failed; backing off");
                backoff::Error::transient(e)
            } else {
                backoff::Error::permanent(e)
            }
        })
    })
    .await?;
    Ok(result)
}

/// Retry the checkpoint advance without re-polling: the flushed files
/// stay valid across attempts, so only the store write is repeated. A
/// regression is permanent and surfaces as a fatal pipeline error.
async fn advance_with_retry(
    checkpoints: &CheckpointStore,
    offsets: &BTreeMap<SourcePartition, i64>,
    options: &OrchestratorOptions,
) -> Result<(), PipelineError> {
    backoff::future::retry(retry_policy(options), || async {
        checkpoints.advance(offsets).map_err(|e| {
            if e.is_retryable() {
                warn!(error = %e, "checkpoint advance failed; backing off");
                backoff::Error::transient(e)
            } else {
                error!(error = %e, "checkpoint advance failed fatally");
                backoff::Error::permanent(e)
            }
        })
    })
    .await?;
    Ok(())
}
