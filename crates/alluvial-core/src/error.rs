//! Error taxonomy shared across pipeline stages.
//!
//! Each stage has its own error enum so the orchestrator can apply the
//! right recovery policy: decode failures are diverted to the dead-letter
//! sink, write failures are retried with backoff, and a checkpoint
//! regression is fatal.

use thiserror::Error;

/// Errors from decoding a raw message's envelope.
///
/// These are per-record and recoverable: the orchestrator routes the
/// offending message to the dead-letter sink and continues the batch,
/// unless the per-batch failure ratio crosses the configured threshold.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The payload is not well-formed structured data.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// The outer envelope parsed but has no payload object.
    #[error("envelope has no payload object")]
    MissingPayload,

    /// A declared field is missing, has the wrong type, or the event
    /// timestamp is unusable.
    #[error("schema mismatch on field '{field}': {message}")]
    SchemaMismatch {
        /// Name of the offending field.
        field: String,
        /// What was wrong with it.
        message: String,
    },
}

impl DecodeError {
    /// Short stable label for dead-letter records and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedEnvelope(_) => "malformed_envelope",
            Self::MissingPayload => "missing_payload",
            Self::SchemaMismatch { .. } => "schema_mismatch",
        }
    }
}

/// Errors from flushing a micro-batch to storage.
#[derive(Debug, Error)]
pub enum WriteError {
    /// A partition file write exceeded its deadline.
    #[error("write deadline exceeded for {path}")]
    Timeout {
        /// Relative path of the file that timed out.
        path: String,
    },

    /// One partition group's write failed; nothing was committed.
    #[error("failed writing {path}: {message}")]
    PartialFailure {
        /// Relative path of the failed file.
        path: String,
        /// Underlying failure description.
        message: String,
    },

    /// The storage backend is unreachable or rejected the operation.
    #[error("storage backend unavailable: {0}")]
    BackendUnavailable(#[from] std::io::Error),

    /// Records could not be encoded to the columnar format.
    #[error("columnar encode error: {0}")]
    Encode(String),
}

impl WriteError {
    /// Whether the orchestrator should retry the flush with backoff.
    ///
    /// Encode failures are deterministic (retrying the same batch would
    /// fail the same way), so only I/O-shaped failures are retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Encode(_))
    }
}

/// Errors from the checkpoint store.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// A proposed offset is below the stored offset for a partition.
    ///
    /// Fatal: advancing past this would risk silent data loss, so the
    /// pipeline must stop and alert rather than retry.
    #[error("offset regression for {partition}: stored {stored}, proposed {proposed}")]
    Regression {
        /// Key of the regressing partition (`topic-partition`).
        partition: String,
        /// Currently stored offset.
        stored: i64,
        /// Offset the caller attempted to store.
        proposed: i64,
    },

    /// The store could not be read or written; retryable.
    #[error("checkpoint store unavailable: {0}")]
    StoreUnavailable(String),
}

impl From<std::io::Error> for CheckpointError {
    fn from(err: std::io::Error) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for CheckpointError {
    fn from(err: serde_json::Error) -> Self {
        Self::StoreUnavailable(format!("checkpoint document corrupt: {err}"))
    }
}

impl CheckpointError {
    /// Whether the orchestrator may retry the commit.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_kinds() {
        assert_eq!(
            DecodeError::MalformedEnvelope("x".into()).kind(),
            "malformed_envelope"
        );
        assert_eq!(DecodeError::MissingPayload.kind(), "missing_payload");
        assert_eq!(
            DecodeError::SchemaMismatch {
                field: "id".into(),
                message: "m".into()
            }
            .kind(),
            "schema_mismatch"
        );
    }

    #[test]
    fn test_write_error_retryability() {
        assert!(WriteError::Timeout { path: "p".into() }.is_retryable());
        assert!(WriteError::PartialFailure {
            path: "p".into(),
            message: "m".into()
        }
        .is_retryable());
        assert!(!WriteError::Encode("bad schema".into()).is_retryable());
    }

    #[test]
    fn test_checkpoint_error_retryability() {
        assert!(CheckpointError::StoreUnavailable("io".into()).is_retryable());
        assert!(!CheckpointError::Regression {
            partition: "t-0".into(),
            stored: 10,
            proposed: 5
        }
        .is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = CheckpointError::Regression {
            partition: "t-0".into(),
            stored: 10,
            proposed: 5,
        };
        assert_eq!(
            err.to_string(),
            "offset regression for t-0: stored 10, proposed 5"
        );
    }
}
