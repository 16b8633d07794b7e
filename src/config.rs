use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Configuration
// ============================================================================

/// Tuning of every stream worker.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// How long one poll waits for the first record.
    pub poll_timeout: Duration,
    /// Upper bound on records handled per batch.
    pub max_poll_records: usize,
    /// Pause after a failed record before polling again.
    pub backoff: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(1000),
            max_poll_records: 50,
            backoff: Duration::from_millis(1000),
        }
    }
}

/// Engine configuration, loaded from the environment.
///
/// | Variable                 | Default                  |
/// |--------------------------|--------------------------|
/// | DATABASE_URL             | sqlite::memory:          |
/// | DATABASE_MAX_CONNECTIONS | 5                        |
/// | KAFKA_BROKERS            | unset (stream disabled)  |
/// | EVENT_TOPIC              | dbserver1.public.event   |
/// | CONSUMER_GROUP_PREFIX    | ddd-engine               |
/// | STREAM_POLL_TIMEOUT_MS   | 1000                     |
/// | STREAM_MAX_POLL_RECORDS  | 50                       |
/// | STREAM_BACKOFF_MS        | 1000                     |
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub kafka_brokers: Option<String>,
    pub event_topic: String,
    pub consumer_group_prefix: String,
    pub stream: StreamConfig,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary source.
    /// Unparseable values fall back to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let lookup = &lookup;
        let defaults = StreamConfig::default();

        Self {
            database_url: lookup("DATABASE_URL").unwrap_or_else(|| "sqlite::memory:".into()),
            database_max_connections: parsed(lookup, "DATABASE_MAX_CONNECTIONS").unwrap_or(5),
            kafka_brokers: lookup("KAFKA_BROKERS").filter(|brokers| !brokers.trim().is_empty()),
            event_topic: lookup("EVENT_TOPIC").unwrap_or_else(|| "dbserver1.public.event".into()),
            consumer_group_prefix: lookup("CONSUMER_GROUP_PREFIX")
                .unwrap_or_else(|| "ddd-engine".into()),
            stream: StreamConfig {
                poll_timeout: parsed(lookup, "STREAM_POLL_TIMEOUT_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.poll_timeout),
                max_poll_records: parsed(lookup, "STREAM_MAX_POLL_RECORDS")
                    .unwrap_or(defaults.max_poll_records)
                    .max(1),
                backoff: parsed(lookup, "STREAM_BACKOFF_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.backoff),
            },
        }
    }

    pub fn stream_enabled(&self) -> bool {
        self.kafka_brokers.is_some()
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|value| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> EngineConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EngineConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]);

        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.database_max_connections, 5);
        assert!(!config.stream_enabled());
        assert_eq!(config.event_topic, "dbserver1.public.event");
        assert_eq!(config.consumer_group_prefix, "ddd-engine");
        assert_eq!(config.stream, StreamConfig::default());
    }

    #[test]
    fn test_overrides_and_bad_values() {
        let config = config_from(&[
            ("KAFKA_BROKERS", "kafka:9092"),
            ("STREAM_BACKOFF_MS", "250"),
            ("STREAM_MAX_POLL_RECORDS", "lots"),
            ("DATABASE_MAX_CONNECTIONS", "12"),
        ]);

        assert_eq!(config.kafka_brokers.as_deref(), Some("kafka:9092"));
        assert_eq!(config.stream.backoff, Duration::from_millis(250));
        assert_eq!(config.stream.max_poll_records, 50);
        assert_eq!(config.database_max_connections, 12);
    }

    #[test]
    fn test_blank_brokers_disable_the_stream() {
        assert!(!config_from(&[("KAFKA_BROKERS", "  ")]).stream_enabled());
    }
}
