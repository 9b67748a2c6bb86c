//! Partitioned Parquet batch writer.
//!
//! One flush call turns a micro-batch into one Parquet file per
//! `(partition path, source partition)` group, written under
//! `root/YYYY-MM-DD/HH/`. Filenames are a pure function of the group
//! (`{topic}-{partition}-{first:020}-{last:020}.parquet`), so a
//! redelivered batch maps onto the exact same paths and is detected as
//! already present instead of duplicating data.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

use alluvial_core::{DecodedRecord, MicroBatch, PartitionPath, RecordShape, SourcePartition, WriteError};

use crate::encode::{ParquetEncodeConfig, ParquetEncoder};

const STAGING_DIR: &str = ".staging";

/// Suffix of the sibling marker file used by
/// [`CommitProtocol::CompletionMarker`].
pub const COMPLETION_MARKER_SUFFIX: &str = ".complete";

/// How a finished file is made visible to readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitProtocol {
    /// Write to a staging path, fsync, then rename into place. Readers
    /// never observe a partial file. The default.
    #[default]
    AtomicRename,
    /// Write the file in place, then create a sibling
    /// `<name>.complete` marker. For filesystems where rename is not
    /// atomic; readers must ignore unmarked files.
    CompletionMarker,
}

/// Configuration for [`BatchWriter`].
#[derive(Debug, Clone)]
pub struct BatchWriterConfig {
    /// Root directory of the partitioned output tree.
    pub output_root: PathBuf,
    /// Visibility protocol for finished files.
    pub commit_protocol: CommitProtocol,
    /// Per-file write deadline.
    pub write_deadline: Duration,
    /// Maximum partition-group writes in flight at once.
    pub max_concurrent_writes: usize,
    /// Parquet encoding knobs.
    pub encode: ParquetEncodeConfig,
}

impl BatchWriterConfig {
    /// Defaults rooted at `output_root`.
    #[must_use]
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        Self {
            output_root: output_root.into(),
            commit_protocol: CommitProtocol::default(),
            write_deadline: Duration::from_secs(30),
            max_concurrent_writes: 4,
            encode: ParquetEncodeConfig::default(),
        }
    }
}

/// Outcome of a successful flush.
#[derive(Debug, Default)]
pub struct WrittenPaths {
    /// Files written and made visible by this flush.
    pub written: Vec<PathBuf>,
    /// Files skipped because an identical write already completed.
    pub skipped: Vec<PathBuf>,
}

impl WrittenPaths {
    /// Number of files this flush accounts for, written or skipped.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.written.len() + self.skipped.len()
    }
}

enum GroupOutcome {
    Written(PathBuf),
    Skipped(PathBuf),
}

struct WriteJob {
    encoder: ParquetEncoder,
    protocol: CommitProtocol,
    final_dir: PathBuf,
    staging: PathBuf,
    filename: String,
    records: Vec<DecodedRecord>,
}

/// Writes micro-batches as date/hour-partitioned Parquet files.
///
/// Flush is all-or-nothing from the caller's perspective: only when
/// every group file is durably visible does it return `Ok`, and only
/// then may the caller commit offsets. Files from a failed flush are
/// harmless orphans; the redelivered batch will skip or overwrite them.
#[derive(Debug)]
pub struct BatchWriter {
    config: BatchWriterConfig,
    encoder: ParquetEncoder,
}

impl BatchWriter {
    /// Create a writer for records of the given shape.
    #[must_use]
    pub fn new(shape: RecordShape, config: BatchWriterConfig) -> Self {
        let encoder = ParquetEncoder::new(shape, config.encode.clone());
        Self { config, encoder }
    }

    /// Flush every partition group of `batch` to durable storage.
    ///
    /// Groups are written concurrently, each under the configured
    /// deadline. The first failure fails the whole flush after all
    /// in-flight writes have settled.
    pub async fn flush(&self, batch: &MicroBatch) -> Result<WrittenPaths, WriteError> {
        if batch.is_empty() {
            return Ok(WrittenPaths::default());
        }

        let staging = self.config.output_root.join(STAGING_DIR);
        tokio::fs::create_dir_all(&staging).await?;

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_writes));
        let mut join_set: JoinSet<Result<GroupOutcome, WriteError>> = JoinSet::new();

        for ((path, source), records) in batch.groups() {
            let job = self.job_for(path, source, records, &staging);
            let deadline = self.config.write_deadline;
            let rel = format!("{}/{}", path.rel_path(), job.filename);
            let semaphore = Arc::clone(&semaphore);

            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.map_err(|e| {
                    WriteError::PartialFailure {
                        path: rel.clone(),
                        message: e.to_string(),
                    }
                })?;
                match tokio::time::timeout(
                    deadline,
                    tokio::task::spawn_blocking(move || write_group(&job)),
                )
                .await
                {
                    Err(_) => Err(WriteError::Timeout { path: rel }),
                    Ok(Err(join_err)) => Err(WriteError::PartialFailure {
                        path: rel,
                        message: join_err.to_string(),
                    }),
                    Ok(Ok(outcome)) => outcome,
                }
            });
        }

        let mut paths = WrittenPaths::default();
        let mut first_error: Option<WriteError> = None;
        while let Some(joined) = join_set.join_next().await {
            let result = joined.unwrap_or_else(|e| {
                Err(WriteError::PartialFailure {
                    path: String::new(),
                    message: e.to_string(),
                })
            });
            match result {
                Ok(GroupOutcome::Written(p)) => paths.written.push(p),
                Ok(GroupOutcome::Skipped(p)) => paths.skipped.push(p),
                Err(e) if first_error.is_none() => first_error = Some(e),
                Err(e) => debug!(error = %e, "additional group failure in failed flush"),
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        info!(
            written = paths.written.len(),
            skipped = paths.skipped.len(),
            records = batch.record_count(),
            "micro-batch flushed"
        );
        Ok(paths)
    }

    fn job_for(
        &self,
        path: &PartitionPath,
        source: &SourcePartition,
        records: &[DecodedRecord],
        staging: &Path,
    ) -> WriteJob {
        // First/last offsets of this group's records, not of the whole
        // batch: the filename must describe exactly what the file holds.
        let first = records.iter().map(|r| r.offset).min().unwrap_or(0);
        let last = records.iter().map(|r| r.offset).max().unwrap_or(0);
        WriteJob {
            encoder: self.encoder.clone(),
            protocol: self.config.commit_protocol,
            final_dir: self.config.output_root.join(path.rel_path()),
            staging: staging.to_path_buf(),
            filename: format!(
                "{}-{}-{first:020}-{last:020}.parquet",
                source.topic, source.partition
            ),
            records: records.to_vec(),
        }
    }
}

fn write_group(job: &WriteJob) -> Result<GroupOutcome, WriteError> {
    let final_path = job.final_dir.join(&job.filename);
    if is_visible(&final_path, job.protocol) {
        debug!(path = %final_path.display(), "file already committed; skipping");
        return Ok(GroupOutcome::Skipped(final_path));
    }

    let bytes = job.encoder.encode(&job.records)?;
    std::fs::create_dir_all(&job.final_dir)?;

    match job.protocol {
        CommitProtocol::AtomicRename => {
            let temp = job.staging.join(format!("{}.inprogress", job.filename));
            write_durable(&temp, &bytes)?;
            std::fs::rename(&temp, &final_path)?;
        }
        CommitProtocol::CompletionMarker => {
            write_durable(&final_path, &bytes)?;
            let marker = job
                .final_dir
                .join(format!("{}{COMPLETION_MARKER_SUFFIX}", job.filename));
            let marker_file = std::fs::File::create(marker)?;
            marker_file.sync_all()?;
        }
    }
    sync_dir(&job.final_dir)?;
    Ok(GroupOutcome::Written(final_path))
}

/// A file is visible once its protocol says a reader may trust it. An
/// in-place file without its completion marker is an interrupted write
/// and gets overwritten by the retry.
fn is_visible(final_path: &Path, protocol: CommitProtocol) -> bool {
    match protocol {
        CommitProtocol::AtomicRename => final_path.exists(),
        CommitProtocol::CompletionMarker => {
            let mut marker = final_path.as_os_str().to_owned();
            marker.push(COMPLETION_MARKER_SUFFIX);
            PathBuf::from(marker).exists()
        }
    }
}

fn write_durable(path: &Path, bytes: &[u8]) -> Result<(), WriteError> {
    use std::io::Write;
    let mut file = std::fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

fn sync_dir(dir: &Path) -> Result<(), WriteError> {
    std::fs::File::open(dir)?.sync_all()?;
    Ok(())
}
