//! Kafka source connector over librdkafka's async consumer.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, info, warn};

use alluvial_core::{RawMessage, SourcePartition};

use crate::config::{KafkaSourceConfig, StartingOffsets};
use crate::source::{SourceConnector, SourceError};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectorState {
    Created,
    Open,
    Closed,
}

impl ConnectorState {
    fn name(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

/// Kafka implementation of [`SourceConnector`].
///
/// Uses manual partition assignment over the whole topic rather than
/// group subscription: the pipeline is a single consumer whose position
/// is restored from its own checkpoints, so rebalance callbacks and
/// broker-stored offsets would only fight that.
pub struct KafkaSource {
    config: KafkaSourceConfig,
    consumer: Option<StreamConsumer>,
    assignment: Vec<SourcePartition>,
    state: ConnectorState,
}

impl KafkaSource {
    /// Create an unopened source for the configured topic.
    #[must_use]
    pub fn new(config: KafkaSourceConfig) -> Self {
        Self {
            config,
            consumer: None,
            assignment: Vec::new(),
            state: ConnectorState::Created,
        }
    }

    fn consumer(&self) -> Result<&StreamConsumer, SourceError> {
        self.consumer.as_ref().ok_or_else(|| SourceError::InvalidState {
            expected: ConnectorState::Open.name().to_string(),
            actual: self.state.name().to_string(),
        })
    }

    fn initial_offset(&self) -> Offset {
        match self.config.starting_offsets {
            StartingOffsets::Earliest => Offset::Beginning,
            StartingOffsets::Latest => Offset::End,
            // Explicit positions arrive via seek() after the checkpoint
            // load; until then defer to auto.offset.reset.
            StartingOffsets::Resume { .. } => Offset::Invalid,
        }
    }
}

fn to_raw_message(msg: &rdkafka::message::BorrowedMessage<'_>) -> RawMessage {
    let ingest_time = msg
        .timestamp()
        .to_millis()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now);
    RawMessage::new(
        SourcePartition::new(msg.topic(), msg.partition()),
        msg.offset(),
        msg.payload().unwrap_or_default().to_vec(),
        ingest_time,
    )
}

#[async_trait]
impl SourceConnector for KafkaSource {
    async fn open(&mut self) -> Result<(), SourceError> {
        if self.state != ConnectorState::Created {
            return Err(SourceError::InvalidState {
                expected: ConnectorState::Created.name().to_string(),
                actual: self.state.name().to_string(),
            });
        }

        let consumer: StreamConsumer = self
            .config
            .to_client_config()
            .create()
            .map_err(|e| SourceError::ConnectionFailed(e.to_string()))?;

        let metadata = consumer
            .fetch_metadata(Some(&self.config.topic), METADATA_TIMEOUT)
            .map_err(|e| SourceError::ConnectionFailed(e.to_string()))?;
        let topic_meta = metadata
            .topics()
            .iter()
            .find(|t| t.name() == self.config.topic)
            .filter(|t| !t.partitions().is_empty())
            .ok_or_else(|| {
                SourceError::Configuration(format!(
                    "topic '{}' not found or has no partitions",
                    self.config.topic
                ))
            })?;

        let mut tpl = TopicPartitionList::new();
        let mut assignment = Vec::new();
        for partition in topic_meta.partitions() {
            tpl.add_partition_offset(&self.config.topic, partition.id(), self.initial_offset())
                .map_err(|e| SourceError::ConnectionFailed(e.to_string()))?;
            assignment.push(SourcePartition::new(&self.config.topic, partition.id()));
        }
        consumer
            .assign(&tpl)
            .map_err(|e| SourceError::ConnectionFailed(e.to_string()))?;

        info!(
            topic = %self.config.topic,
            partitions = assignment.len(),
            "kafka source opened"
        );

        self.consumer = Some(consumer);
        self.assignment = assignment;
        self.state = ConnectorState::Open;
        Ok(())
    }

    async fn poll(
        &mut self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<RawMessage>, SourceError> {
        let consumer = self.consumer()?;
        let deadline = Instant::now() + timeout;
        let mut messages = Vec::new();

        while messages.len() < max_records {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, consumer.recv()).await {
                Ok(Ok(msg)) => messages.push(to_raw_message(&msg)),
                Ok(Err(e)) => return Err(SourceError::PollFailed(e.to_string())),
                Err(_) => break,
            }
        }

        debug!(records = messages.len(), "kafka poll complete");
        Ok(messages)
    }

    fn current_assignment(&self) -> Vec<SourcePartition> {
        self.assignment.clone()
    }

    async fn seek(&mut self, offsets: &BTreeMap<SourcePartition, i64>) -> Result<(), SourceError> {
        let consumer = self.consumer()?;

        // Re-assign with explicit positions; partitions without a stored
        // offset keep the policy-derived initial position.
        let mut tpl = TopicPartitionList::new();
        for sp in &self.assignment {
            let offset = offsets
                .get(sp)
                .map_or_else(|| self.initial_offset(), |&next| Offset::Offset(next));
            tpl.add_partition_offset(&sp.topic, sp.partition, offset)
                .map_err(|e| SourceError::SeekFailed(e.to_string()))?;
        }
        consumer
            .assign(&tpl)
            .map_err(|e| SourceError::SeekFailed(e.to_string()))?;

        info!(partitions = offsets.len(), "kafka source repositioned");
        Ok(())
    }

    async fn commit(
        &mut self,
        offsets: &BTreeMap<SourcePartition, i64>,
    ) -> Result<(), SourceError> {
        let consumer = self.consumer()?;

        let mut tpl = TopicPartitionList::new();
        for (sp, &next) in offsets {
            tpl.add_partition_offset(&sp.topic, sp.partition, Offset::Offset(next))
                .map_err(|e| SourceError::CommitFailed(e.to_string()))?;
        }
        consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(|e| SourceError::CommitFailed(e.to_string()))?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        if let Some(consumer) = self.consumer.take() {
            consumer.unsubscribe();
            info!(topic = %self.config.topic, "kafka source closed");
        } else {
            warn!("close called on a source that was never opened");
        }
        self.assignment.clear();
        self.state = ConnectorState::Closed;
        Ok(())
    }
}
