//! Source connector abstraction.
//!
//! A source connector delivers [`RawMessage`]s with at-least-once
//! semantics. The pipeline owns offset progress through its checkpoint
//! store; [`SourceConnector::commit`] only mirrors that progress back to
//! the upstream system for observability and is always best-effort.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use alluvial_core::{RawMessage, SourcePartition};

/// Errors from a source connector.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Could not establish or keep a connection to the upstream system.
    #[error("source connection failed: {0}")]
    ConnectionFailed(String),

    /// A poll attempt failed.
    #[error("source poll failed: {0}")]
    PollFailed(String),

    /// Seeking to stored offsets failed.
    #[error("source seek failed: {0}")]
    SeekFailed(String),

    /// Mirroring committed offsets upstream failed.
    #[error("source commit failed: {0}")]
    CommitFailed(String),

    /// The connector was used in the wrong lifecycle state.
    #[error("invalid source state: expected {expected}, actual {actual}")]
    InvalidState {
        /// State the operation requires.
        expected: String,
        /// State the connector is in.
        actual: String,
    },

    /// The configuration is unusable.
    #[error("invalid source configuration: {0}")]
    Configuration(String),
}

/// A partitioned, offset-addressed message source.
///
/// Lifecycle: [`open`](Self::open) once, then any number of
/// [`poll`](Self::poll) / [`seek`](Self::seek) / [`commit`](Self::commit)
/// calls, then [`close`](Self::close). Implementations must tolerate
/// redelivery of already-processed offsets after a crash.
#[async_trait]
pub trait SourceConnector: Send {
    /// Connect and take partition assignment.
    async fn open(&mut self) -> Result<(), SourceError>;

    /// Pull up to `max_records` messages, waiting at most `timeout`.
    ///
    /// Returns an empty vec when nothing arrived within the timeout; an
    /// empty result is not an error.
    async fn poll(
        &mut self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<RawMessage>, SourceError>;

    /// Partitions currently assigned to this connector.
    fn current_assignment(&self) -> Vec<SourcePartition>;

    /// Reposition the given partitions to the given next-to-read offsets.
    async fn seek(&mut self, offsets: &BTreeMap<SourcePartition, i64>) -> Result<(), SourceError>;

    /// Mirror committed offsets upstream. Best-effort: callers log
    /// failures and carry on, since durable progress lives elsewhere.
    async fn commit(&mut self, offsets: &BTreeMap<SourcePartition, i64>)
        -> Result<(), SourceError>;

    /// Release the connection.
    async fn close(&mut self) -> Result<(), SourceError>;
}
