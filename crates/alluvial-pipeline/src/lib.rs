//! # Alluvial Pipeline
//!
//! The orchestrator that drives the ingestion loop: poll the source,
//! decode, write partitioned Parquet, then (and only then) commit
//! offsets. One rule underpins everything here: a checkpoint never
//! advances past data that is not durably visible.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod config;
pub mod orchestrator;

pub use config::{OrchestratorOptions, PipelineConfig};
pub use orchestrator::{BatchOutcome, Orchestrator, PipelineError, PipelineState, ShutdownHandle};
