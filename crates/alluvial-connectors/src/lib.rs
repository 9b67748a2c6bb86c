//! # Alluvial Connectors
//!
//! The upstream edge of the pipeline: the [`SourceConnector`] trait and
//! its Kafka implementation, the pure envelope decoder, and dead-letter
//! sinks for records that fail decoding.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod config;
pub mod dead_letter;
pub mod envelope;
pub mod kafka;
pub mod source;

pub use config::{BootstrapPosition, KafkaSourceConfig, SaslMechanism, SecurityProtocol, StartingOffsets};
pub use dead_letter::{DeadLetterRecord, DeadLetterSink, InMemoryDeadLetterSink, JsonlDeadLetterSink};
pub use envelope::EnvelopeDecoder;
pub use kafka::KafkaSource;
pub use source::{SourceConnector, SourceError};
