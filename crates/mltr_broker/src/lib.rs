//! Kafka client construction and the typed stage publisher.
//!
//! Three topics carry the stage hand-off messages (audio, translation,
//! packaging), each consumed by its own group. All consumers run with
//! auto-commit disabled: an offset advances only when a stage explicitly
//! commits it, which is what gives the pipeline its at-least-once
//! delivery guarantee. Clients are constructed once at worker startup and
//! handed to the processing loop; there are no process-global handles.

use async_trait::async_trait;
use mltr_types::{BrokerConfig, PublishError, QueuedTask, TaskPublisher};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::BorrowedMessage;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// How long a publish may sit in the producer queue before failing.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Failed to create Kafka client: {0}")]
    ClientCreation(String),

    #[error("Failed to subscribe to topic '{topic}': {source}")]
    Subscribe { topic: String, source: KafkaError },

    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
}

/// The three pipeline stages; each maps to one topic and one consumer group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Audio,
    Translation,
    Packaging,
}

impl Stage {
    pub fn topic<'a>(&self, config: &'a BrokerConfig) -> &'a str {
        match self {
            Stage::Audio => &config.audio_topic,
            Stage::Translation => &config.translation_topic,
            Stage::Packaging => &config.package_topic,
        }
    }

    pub fn group<'a>(&self, config: &'a BrokerConfig) -> &'a str {
        match self {
            Stage::Audio => &config.whisper_group,
            Stage::Translation => &config.translation_group,
            Stage::Packaging => &config.packaging_group,
        }
    }
}

/// Builds a manual-commit consumer subscribed to one stage topic.
///
/// `auto.offset.reset=earliest` so a brand-new group starts from the
/// beginning of the topic rather than skipping backlog.
pub fn stage_consumer(config: &BrokerConfig, stage: Stage) -> Result<StreamConsumer, BrokerError> {
    let topic = stage.topic(config);
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", &config.bootstrap_servers)
        .set("group.id", stage.group(config))
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "earliest")
        .create()
        .map_err(|e| BrokerError::ClientCreation(e.to_string()))?;

    consumer
        .subscribe(&[topic])
        .map_err(|source| BrokerError::Subscribe {
            topic: topic.to_string(),
            source,
        })?;

    info!(topic, group = stage.group(config), "Stage consumer subscribed");
    Ok(consumer)
}

/// Acknowledges a single message, advancing the group offset past it.
/// Used both after successful processing and for drop-and-commit.
pub fn commit_message(consumer: &StreamConsumer, message: &BorrowedMessage<'_>) -> Result<(), BrokerError> {
    consumer.commit_message(message, CommitMode::Async)?;
    Ok(())
}

/// Commits `next_offset` as the new consume position for one partition.
///
/// Batch consumers pass the offset computed by the per-partition commit
/// rule: the largest offset such that every message at or below it in the
/// partition succeeded, plus one.
pub fn commit_partition(
    consumer: &StreamConsumer,
    topic: &str,
    partition: i32,
    next_offset: i64,
) -> Result<(), BrokerError> {
    let mut assignment = TopicPartitionList::new();
    assignment.add_partition_offset(topic, partition, Offset::Offset(next_offset))?;
    consumer.commit(&assignment, CommitMode::Async)?;
    debug!(topic, partition, next_offset, "Committed partition offset");
    Ok(())
}

/// JSON publisher for `QueuedTask` messages, keyed by task id.
pub struct KafkaPublisher {
    producer: FutureProducer,
}

impl KafkaPublisher {
    pub fn new(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| BrokerError::ClientCreation(e.to_string()))?;
        info!(bootstrap_servers = %config.bootstrap_servers, "Kafka producer created");
        Ok(KafkaPublisher { producer })
    }
}

#[async_trait]
impl TaskPublisher for KafkaPublisher {
    async fn publish(&self, topic: &str, task: &QueuedTask) -> Result<(), PublishError> {
        let payload =
            serde_json::to_vec(task).map_err(|e| PublishError::Serialization(e.to_string()))?;
        let key = task.task_id.to_string();

        self.producer
            .send(
                FutureRecord::to(topic).key(&key).payload(&payload),
                Timeout::After(DELIVERY_TIMEOUT),
            )
            .await
            .map_err(|(e, _message)| PublishError::Delivery(e.to_string()))?;

        debug!(topic, task_id = %task.task_id, "Published queued task");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mltr_types::AppConfig;

    #[test]
    fn test_stage_topic_and_group_mapping() {
        let config = AppConfig::default().broker;
        assert_eq!(Stage::Audio.topic(&config), "audio_processing");
        assert_eq!(Stage::Audio.group(&config), "whisper_processing_group");
        assert_eq!(Stage::Translation.topic(&config), "text_translation");
        assert_eq!(Stage::Translation.group(&config), "translation_processing_group");
        assert_eq!(Stage::Packaging.topic(&config), "text_packaging");
        assert_eq!(Stage::Packaging.group(&config), "text_packaging_group");
    }
}
