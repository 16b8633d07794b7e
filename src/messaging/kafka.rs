use async_trait::async_trait;
use futures_util::FutureExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::{Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

use super::broker::{BrokerConnector, BrokerConsumer, BrokerRecord, TopicPartition};

// ============================================================================
// Kafka Adapter
// ============================================================================
//
// One StreamConsumer per worker, all workers of a processing group sharing
// the consumer group `<prefix>.<group>`, so partitions are spread across
// them. Offsets are only ever committed explicitly by the worker.
//
// ============================================================================

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Amends the client configuration of one worker: `(config, group, worker)`.
pub type ConsumerCustomiser = Arc<dyn Fn(&mut ClientConfig, &str, usize) + Send + Sync>;

#[derive(Clone)]
pub struct KafkaConnector {
    brokers: String,
    topic: String,
    group_prefix: String,
    customisers: Vec<ConsumerCustomiser>,
}

impl KafkaConnector {
    pub fn new(brokers: &str, topic: &str, group_prefix: &str) -> Self {
        Self {
            brokers: brokers.to_string(),
            topic: topic.to_string(),
            group_prefix: group_prefix.to_string(),
            customisers: Vec::new(),
        }
    }

    pub fn with_customiser(
        mut self,
        customiser: impl Fn(&mut ClientConfig, &str, usize) + Send + Sync + 'static,
    ) -> Self {
        self.customisers.push(Arc::new(customiser));
        self
    }

    /// Client configuration for one worker of a processing group.
    pub fn client_config(&self, group: &str, worker: usize) -> ClientConfig {
        let group_id = format!("{}.{}", self.group_prefix, group);
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());

        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &group_id)
            .set("client.id", format!("{group_id}.{host}.{worker}"))
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "30000")
            .set("fetch.min.bytes", "1024")
            .set("fetch.wait.max.ms", "1000");

        for customiser in &self.customisers {
            customiser(&mut config, group, worker);
        }

        tracing::debug!(group, worker, config = ?config, "Kafka consumer configuration");
        config
    }
}

impl std::fmt::Debug for KafkaConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaConnector")
            .field("brokers", &self.brokers)
            .field("topic", &self.topic)
            .field("group_prefix", &self.group_prefix)
            .field("customisers", &self.customisers.len())
            .finish()
    }
}

impl BrokerConnector for KafkaConnector {
    fn connect(&self, group: &str, worker: usize) -> Result<Box<dyn BrokerConsumer>> {
        let consumer: StreamConsumer = self.client_config(group, worker).create()?;
        consumer.subscribe(&[self.topic.as_str()])?;

        tracing::info!(
            group,
            worker,
            topic = %self.topic,
            "📡 Subscribed Kafka consumer"
        );
        Ok(Box::new(KafkaConsumer { consumer }))
    }
}

pub struct KafkaConsumer {
    consumer: StreamConsumer,
}

fn to_record(message: &BorrowedMessage<'_>) -> BrokerRecord {
    BrokerRecord {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        value: message.payload().map(|p| p.to_vec()),
    }
}

#[async_trait]
impl BrokerConsumer for KafkaConsumer {
    async fn poll(&mut self, timeout: Duration, max_records: usize) -> Result<Vec<BrokerRecord>> {
        let mut records = Vec::new();

        let first = match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => return Ok(records),
            Ok(message) => to_record(&message?),
        };
        records.push(first);

        // Drain whatever is already buffered without waiting again.
        while records.len() < max_records {
            match self.consumer.recv().now_or_never() {
                Some(Ok(message)) => records.push(to_record(&message)),
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Kafka error while draining batch");
                    break;
                }
                None => break,
            }
        }

        Ok(records)
    }

    async fn commit(&mut self, offsets: &[(TopicPartition, i64)]) -> Result<()> {
        let mut list = TopicPartitionList::new();
        for (tp, offset) in offsets {
            list.add_partition_offset(&tp.topic, tp.partition, Offset::Offset(*offset))?;
        }
        self.consumer.commit(&list, CommitMode::Sync)?;
        Ok(())
    }

    async fn rewind(&mut self, positions: &[(TopicPartition, i64)]) -> Result<()> {
        for (tp, offset) in positions {
            self.consumer
                .seek(&tp.topic, tp.partition, Offset::Offset(*offset), SEEK_TIMEOUT)?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.consumer.unsubscribe();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_defaults() {
        let connector = KafkaConnector::new("localhost:9092", "dbserver1.public.event", "ddd-engine");
        let config = connector.client_config("projection", 3);

        assert_eq!(config.get("group.id"), Some("ddd-engine.projection"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("session.timeout.ms"), Some("30000"));
        assert!(config.get("client.id").unwrap().starts_with("ddd-engine.projection."));
        assert!(config.get("client.id").unwrap().ends_with(".3"));
    }

    #[test]
    fn test_customisers_see_group_and_worker() {
        let connector = KafkaConnector::new("localhost:9092", "events", "app").with_customiser(
            |config, group, worker| {
                config.set("client.rack", format!("{group}-{worker}"));
            },
        );

        let config = connector.client_config("audit", 2);
        assert_eq!(config.get("client.rack"), Some("audit-2"));
    }
}
