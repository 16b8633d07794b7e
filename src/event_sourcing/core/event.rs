use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result};

// ============================================================================
// Domain Events
// ============================================================================
//
// Events are immutable facts. A command handler produces them in order into an
// EventBuffer; the command gateway then applies, publishes and appends them one
// by one. The buffer holds them type-erased (AnyEvent) because one command may
// emit several event types.
//
// ============================================================================

/// Domain Event trait
///
/// `TYPE_NAME` is what gets stored in the `class_name` column and what the
/// stream consumer uses to find the decoder for a streamed record, so it must
/// stay stable across deployments.
pub trait Event: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const TYPE_NAME: &'static str;
}

/// Type-erased view of an [`Event`]
pub trait AnyEvent: Send + Sync {
    fn type_name(&self) -> &'static str;
    fn event_type_id(&self) -> TypeId;
    fn as_any(&self) -> &dyn Any;
    fn to_payload(&self) -> Result<String>;
}

impl<E: Event> AnyEvent for E {
    fn type_name(&self) -> &'static str {
        E::TYPE_NAME
    }

    fn event_type_id(&self) -> TypeId {
        TypeId::of::<E>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn to_payload(&self) -> Result<String> {
        serialize(E::TYPE_NAME, self)
    }
}

impl std::fmt::Debug for dyn AnyEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnyEvent")
            .field("type_name", &self.type_name())
            .finish()
    }
}

/// Collects the events a command handler applies, in order.
#[derive(Debug, Default)]
pub struct EventBuffer {
    events: Vec<Box<dyn AnyEvent>>,
}

impl EventBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply<E: Event>(&mut self, event: E) {
        self.events.push(Box::new(event));
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn into_events(self) -> Vec<Box<dyn AnyEvent>> {
        self.events
    }
}

// ============================================================================
// Event Metadata
// ============================================================================

/// Immutable key/value metadata attached to every stored event
/// (correlation id, issuing user, source address, ...).
///
/// There is no mutating API: build a map and convert it once.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(Arc<BTreeMap<String, serde_json::Value>>);

impl Metadata {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.0.iter()
    }
}

impl From<BTreeMap<String, serde_json::Value>> for Metadata {
    fn from(map: BTreeMap<String, serde_json::Value>) -> Self {
        Self(Arc::new(map))
    }
}

impl<K: Into<String>, V: Into<serde_json::Value>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(Arc::new(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        ))
    }
}

// ============================================================================
// Stored Events
// ============================================================================

/// A row of the append-only `event` table.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub global_sequence: i64,
    pub aggregate_global_id: i64,
    pub type_name: String,
    pub payload: String,
    pub metadata: Metadata,
}

impl EventRecord {
    pub fn decode<E: Event>(&self) -> Result<E> {
        deserialize(&self.type_name, &self.payload)
    }
}

/// What an event handler can learn about the event it is handling.
///
/// `global_sequence` is only known once the event has been appended, so
/// domain-event handlers (which run before the append) see `None`; stream
/// handlers always see the stored value.
#[derive(Debug, Clone, PartialEq)]
pub struct EventInfo {
    pub type_name: String,
    pub aggregate_global_id: i64,
    pub global_sequence: Option<i64>,
    pub metadata: Metadata,
}

// ============================================================================
// Object Transformer
// ============================================================================

pub fn serialize<T: Serialize + ?Sized>(type_name: &str, value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::serialization(type_name, e))
}

pub fn deserialize<T: DeserializeOwned>(type_name: &str, text: &str) -> Result<T> {
    serde_json::from_str(text).map_err(|e| Error::serialization(type_name, e))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
    struct TestEvent {
        data: String,
    }

    impl Event for TestEvent {
        const TYPE_NAME: &'static str = "TestEvent";
    }

    #[derive(Serialize, Deserialize, Clone, Debug)]
    struct OtherEvent;

    impl Event for OtherEvent {
        const TYPE_NAME: &'static str = "OtherEvent";
    }

    #[test]
    fn test_buffer_keeps_application_order() {
        let mut buffer = EventBuffer::new();
        buffer.apply(TestEvent { data: "first".into() });
        buffer.apply(OtherEvent);
        buffer.apply(TestEvent { data: "third".into() });

        let names: Vec<_> = buffer.into_events().iter().map(|e| e.type_name()).collect();
        assert_eq!(names, vec!["TestEvent", "OtherEvent", "TestEvent"]);
    }

    #[test]
    fn test_erased_event_downcasts_to_original() {
        let event: Box<dyn AnyEvent> = Box::new(TestEvent { data: "x".into() });

        assert_eq!(event.event_type_id(), TypeId::of::<TestEvent>());
        let original = event.as_any().downcast_ref::<TestEvent>().unwrap();
        assert_eq!(original.data, "x");
    }

    #[test]
    fn test_event_payload_round_trip() {
        let event = TestEvent {
            data: "test data".to_string(),
        };

        let record = EventRecord {
            global_sequence: 7,
            aggregate_global_id: 1,
            type_name: TestEvent::TYPE_NAME.to_string(),
            payload: event.to_payload().unwrap(),
            metadata: Metadata::empty(),
        };

        assert_eq!(record.decode::<TestEvent>().unwrap(), event);
    }

    #[test]
    fn test_metadata_serializes_as_plain_map() {
        let metadata: Metadata = [("correlation-id", "abc"), ("source", "api")]
            .into_iter()
            .collect();

        let json = serialize("metadata", &metadata).unwrap();
        assert_eq!(json, r#"{"correlation-id":"abc","source":"api"}"#);

        let back: Metadata = deserialize("metadata", &json).unwrap();
        assert_eq!(back, metadata);
        assert_eq!(back.get("source"), Some(&serde_json::json!("api")));
    }

    #[test]
    fn test_decode_failure_is_serialization_error() {
        let err = deserialize::<TestEvent>("TestEvent", "{not json").unwrap_err();
        assert!(matches!(err, Error::Serialization { ref type_name, .. } if type_name == "TestEvent"));
    }
}
