use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

// ============================================================================
// Metrics Module - Prometheus metrics for observability
// ============================================================================
//
// Provides metrics for:
// - Command processing (outcomes, latency, optimistic conflicts)
// - Event appends by type
// - Stream consumption (processed, failed, back-offs, committed offsets)
// - Critical-section occupancy
//
// Every component takes an Arc<Metrics>; the registry can be rendered in the
// Prometheus text format with `encode_text`.
// ============================================================================

/// Central metrics registry for the engine
pub struct Metrics {
    registry: Registry,

    // Command Metrics
    pub commands_total: IntCounterVec,
    pub command_duration: HistogramVec,
    pub conflicts_total: IntCounter,
    pub events_appended: IntCounterVec,

    // Stream Metrics
    pub stream_records_processed: IntCounterVec,
    pub stream_records_failed: IntCounterVec,
    pub stream_backoffs: IntCounterVec,
    pub stream_committed_offset: IntGaugeVec,

    // Locking
    pub critical_sections: IntGauge,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        // Command Metrics
        let commands_total = IntCounterVec::new(
            Opts::new("commands_total", "Commands sent through the gateway"),
            &["command", "outcome"],
        )?;
        registry.register(Box::new(commands_total.clone()))?;

        let command_duration = HistogramVec::new(
            HistogramOpts::new("command_duration_seconds", "End-to-end command processing duration")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["command"],
        )?;
        registry.register(Box::new(command_duration.clone()))?;

        let conflicts_total = IntCounter::new(
            "optimistic_conflicts_total",
            "Aggregate saves rejected by the optimistic sequence check",
        )?;
        registry.register(Box::new(conflicts_total.clone()))?;

        let events_appended = IntCounterVec::new(
            Opts::new("events_appended_total", "Events appended to the event store"),
            &["event_type"],
        )?;
        registry.register(Box::new(events_appended.clone()))?;

        // Stream Metrics
        let stream_records_processed = IntCounterVec::new(
            Opts::new("stream_records_processed_total", "Stream records handled successfully"),
            &["group", "event_type"],
        )?;
        registry.register(Box::new(stream_records_processed.clone()))?;

        let stream_records_failed = IntCounterVec::new(
            Opts::new("stream_records_failed_total", "Stream records that failed and will be redelivered"),
            &["group", "reason"],
        )?;
        registry.register(Box::new(stream_records_failed.clone()))?;

        let stream_backoffs = IntCounterVec::new(
            Opts::new("stream_backoffs_total", "Back-off pauses taken by stream workers"),
            &["group"],
        )?;
        registry.register(Box::new(stream_backoffs.clone()))?;

        let stream_committed_offset = IntGaugeVec::new(
            Opts::new("stream_committed_offset", "Last committed offset per partition"),
            &["group", "topic", "partition"],
        )?;
        registry.register(Box::new(stream_committed_offset.clone()))?;

        // Locking
        let critical_sections = IntGauge::new(
            "critical_sections_occupied",
            "Aggregate ids with an in-flight or waiting command",
        )?;
        registry.register(Box::new(critical_sections.clone()))?;

        Ok(Self {
            registry,
            commands_total,
            command_duration,
            conflicts_total,
            events_appended,
            stream_records_processed,
            stream_records_failed,
            stream_backoffs,
            stream_committed_offset,
            critical_sections,
        })
    }

    /// Get the Prometheus registry for exposing metrics
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every metric in the Prometheus text exposition format
    pub fn encode_text(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Helper to record a finished command
    pub fn record_command(&self, command: &str, duration_secs: f64, outcome: &str) {
        self.commands_total.with_label_values(&[command, outcome]).inc();
        self.command_duration.with_label_values(&[command]).observe(duration_secs);
        if outcome == "conflict" {
            self.conflicts_total.inc();
        }
    }

    pub fn record_event_appended(&self, event_type: &str) {
        self.events_appended.with_label_values(&[event_type]).inc();
    }

    /// Helper to record a stream record outcome
    pub fn record_stream_record(&self, group: &str, event_type: &str) {
        self.stream_records_processed.with_label_values(&[group, event_type]).inc();
    }

    pub fn record_stream_failure(&self, group: &str, reason: &str) {
        self.stream_records_failed.with_label_values(&[group, reason]).inc();
    }

    pub fn record_backoff(&self, group: &str) {
        self.stream_backoffs.with_label_values(&[group]).inc();
    }

    pub fn record_commit(&self, group: &str, topic: &str, partition: i32, offset: i64) {
        let partition = partition.to_string();
        self.stream_committed_offset
            .with_label_values(&[group, topic, partition.as_str()])
            .set(offset);
    }

    pub fn set_critical_sections(&self, occupied: usize) {
        self.critical_sections.set(occupied as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        metrics.set_critical_sections(0);
        assert!(!metrics.registry.gather().is_empty());
    }

    #[test]
    fn test_record_command_counts_conflicts() {
        let metrics = Metrics::new().unwrap();
        metrics.record_command("RegisterDriver", 0.01, "ok");
        metrics.record_command("AmendDriverName", 0.02, "conflict");

        let gathered = metrics.registry.gather();
        let commands = gathered.iter().find(|m| m.name() == "commands_total").unwrap();
        assert_eq!(commands.metric.len(), 2);

        let conflicts = gathered
            .iter()
            .find(|m| m.name() == "optimistic_conflicts_total")
            .unwrap();
        assert_eq!(conflicts.metric[0].counter.value, Some(1.0));
    }

    #[test]
    fn test_record_stream_activity() {
        let metrics = Metrics::new().unwrap();
        metrics.record_stream_record("projection", "DriverRegistered");
        metrics.record_stream_failure("projection", "handler");
        metrics.record_backoff("projection");
        metrics.record_commit("projection", "events", 0, 42);

        assert_eq!(
            metrics
                .stream_committed_offset
                .with_label_values(&["projection", "events", "0"])
                .get(),
            42
        );
        assert_eq!(metrics.stream_backoffs.with_label_values(&["projection"]).get(), 1);
    }

    #[test]
    fn test_encode_text() {
        let metrics = Metrics::new().unwrap();
        metrics.record_event_appended("DriverRegistered");

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("events_appended_total{event_type=\"DriverRegistered\"} 1"));
    }
}
