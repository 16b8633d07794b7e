use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

// ============================================================================
// Broker Abstraction
// ============================================================================
//
// The stream worker only needs four primitives from a broker consumer:
// poll a batch, commit offsets, seek back, close. Kafka implements them in
// kafka.rs; tests use an in-memory partition log.
//
// Offsets passed to `commit` are the *next* offset to read, as in Kafka.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

/// One record as delivered by the broker. `value` is `None` for tombstones.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub value: Option<Vec<u8>>,
}

impl BrokerRecord {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    /// Waits up to `timeout` for records; returns at most `max_records`.
    /// An empty batch is not an error.
    async fn poll(&mut self, timeout: Duration, max_records: usize) -> Result<Vec<BrokerRecord>>;

    async fn commit(&mut self, offsets: &[(TopicPartition, i64)]) -> Result<()>;

    /// Moves the read position so the given offsets are delivered again.
    async fn rewind(&mut self, positions: &[(TopicPartition, i64)]) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Creates one consumer per (processing group, worker).
pub trait BrokerConnector: Send + Sync {
    fn connect(&self, group: &str, worker: usize) -> Result<Box<dyn BrokerConsumer>>;
}
