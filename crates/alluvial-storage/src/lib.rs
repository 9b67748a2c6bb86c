//! # Alluvial Storage
//!
//! The durable edge of the pipeline: columnar encoding of decoded
//! records, the partitioned [`BatchWriter`] with its atomic visibility
//! protocols, and the [`CheckpointStore`] that owns offset progress.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod checkpoint;
pub mod encode;
pub mod writer;

pub use checkpoint::CheckpointStore;
pub use encode::{ParquetEncodeConfig, ParquetEncoder};
pub use writer::{BatchWriter, BatchWriterConfig, CommitProtocol, WrittenPaths};
