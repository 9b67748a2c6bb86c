//! Durable offset checkpoints.
//!
//! All partition offsets live in a single JSON document that is
//! rewritten atomically on every advance: serialize to a temp file,
//! fsync, rename over the live document, fsync the directory. A reader
//! therefore always sees a complete, internally consistent set of
//! offsets, never a torn multi-partition update.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use alluvial_core::{CheckpointError, CheckpointRecord, SourcePartition};

const DOCUMENT_NAME: &str = "offsets.json";
const DOCUMENT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointDocument {
    version: u32,
    partitions: BTreeMap<String, CheckpointRecord>,
}

impl Default for CheckpointDocument {
    fn default() -> Self {
        Self {
            version: DOCUMENT_VERSION,
            partitions: BTreeMap::new(),
        }
    }
}

/// File-backed store of per-partition next-to-read offsets.
///
/// Single-writer by design: the orchestrator is the only caller, so the
/// read-validate-write sequence in [`advance`](Self::advance) needs no
/// locking.
#[derive(Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Open (creating if needed) the store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Load all stored offsets. Empty on a first run.
    pub fn load(&self) -> Result<BTreeMap<SourcePartition, i64>, CheckpointError> {
        let doc = self.read_document()?;
        Ok(doc
            .partitions
            .values()
            .map(|r| (r.source(), r.offset))
            .collect())
    }

    /// Atomically advance the stored offsets for the given partitions.
    ///
    /// The whole call is validated before anything is written: if any
    /// proposed offset is below its stored value the entire advance is
    /// rejected with [`CheckpointError::Regression`] and the document is
    /// untouched. Advancing to an equal offset is accepted (a redelivered
    /// batch after a crash commits the same position again).
    pub fn advance(&self, offsets: &BTreeMap<SourcePartition, i64>) -> Result<(), CheckpointError> {
        if offsets.is_empty() {
            return Ok(());
        }

        let mut doc = self.read_document()?;
        for (sp, &proposed) in offsets {
            if let Some(existing) = doc.partitions.get(&sp.key()) {
                if proposed < existing.offset {
                    return Err(CheckpointError::Regression {
                        partition: sp.key(),
                        stored: existing.offset,
                        proposed,
                    });
                }
            }
        }
        for (sp, &offset) in offsets {
            doc.partitions.insert(sp.key(), CheckpointRecord::new(sp, offset));
        }

        self.write_document(&doc)?;
        debug!(partitions = offsets.len(), "checkpoint advanced");
        Ok(())
    }

    fn document_path(&self) -> PathBuf {
        self.dir.join(DOCUMENT_NAME)
    }

    fn read_document(&self) -> Result<CheckpointDocument, CheckpointError> {
        match fs::read(self.document_path()) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(CheckpointDocument::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write_document(&self, doc: &CheckpointDocument) -> Result<(), CheckpointError> {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let temp = self
            .dir
            .join(format!(".{DOCUMENT_NAME}.{}-{nanos}.tmp", std::process::id()));
        let bytes = serde_json::to_vec_pretty(doc)?;

        let mut file = File::create(&temp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp, self.document_path())?;
        // The rename itself must be durable before the caller treats the
        // batch as committed.
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }
}
