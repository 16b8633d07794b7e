// ============================================================================
// Messaging - Redelivery of Stored Events from the Broker
// ============================================================================
//
// envelope - unwraps the CDC change records published for the `event` table
// broker   - the consumer primitives the stream needs (poll/commit/rewind)
// kafka    - rdkafka implementation of those primitives
// stream   - processing-group workers with commit-through-k-1 recovery
//
// ============================================================================

pub mod broker;
pub mod envelope;
pub mod kafka;
pub mod stream;

pub use broker::{BrokerConnector, BrokerConsumer, BrokerRecord, TopicPartition};
pub use envelope::Envelope;
pub use kafka::{ConsumerCustomiser, KafkaConnector, KafkaConsumer};
pub use stream::EventStream;
