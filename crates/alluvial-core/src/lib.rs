//! # Alluvial Core
//!
//! Shared data model for the Alluvial ingestion pipeline: source offsets,
//! raw and decoded records, micro-batches, checkpoint records, partition
//! path derivation, and the pipeline error taxonomy. This crate performs
//! no I/O.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod error;
pub mod partition;
pub mod shape;
pub mod types;

pub use error::{CheckpointError, DecodeError, WriteError};
pub use partition::PartitionPath;
pub use shape::{FieldSpec, FieldType, RecordShape};
pub use types::{
    CheckpointRecord, DecodedRecord, FieldValue, MicroBatch, OffsetRange, RawMessage,
    SourcePartition,
};
