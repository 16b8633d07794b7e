use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::StreamConfig;
use crate::error::{Error, Result};
use crate::event_sourcing::{EventInfo, StatelessView};
use crate::metrics::Metrics;
use crate::wiring::{HandlerRegistry, MAX_WORKERS};

use super::broker::{BrokerConnector, BrokerConsumer, BrokerRecord, TopicPartition};
use super::envelope;

// ============================================================================
// Event Stream - At-Least-Once Redelivery of Stored Events
// ============================================================================
//
// Each processing group runs N workers, each with its own broker consumer
// and poll loop. Per batch, records are handled one at a time in order:
//
//   all succeed        -> commit every partition's next offset
//   record k fails     -> commit what records 0..k-1 covered, seek every
//                         partition still pending back to its first
//                         unprocessed offset, back off, poll again
//   shutdown requested -> commit what is done, close the consumer
//
// A failing record is retried until it succeeds, so handlers must be
// idempotent. EventInfo::global_sequence is the natural dedup key.
//
// ============================================================================

/// Subscribes processing groups to the broker and owns their workers.
pub struct EventStream {
    registry: Arc<HandlerRegistry>,
    connector: Arc<dyn BrokerConnector>,
    view: StatelessView,
    config: StreamConfig,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl EventStream {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        connector: Arc<dyn BrokerConnector>,
        view: StatelessView,
        config: StreamConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            registry,
            connector,
            view,
            config,
            metrics,
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Starts `workers` pollers for a processing group declared in the registry.
    ///
    /// Every consumer is connected before any worker starts, so a failed
    /// connection leaves nothing running for this call.
    pub fn subscribe(&self, group: &str, workers: usize) -> Result<()> {
        if !(1..=MAX_WORKERS).contains(&workers) {
            return Err(Error::Definition(format!(
                "processing group {group} asks for {workers} workers, allowed 1..={MAX_WORKERS}"
            )));
        }
        if self.registry.processing_group(group).is_none() {
            return Err(Error::Definition(format!("unknown processing group {group}")));
        }
        if self.shutdown.is_cancelled() {
            return Err(Error::Broker("event stream is shut down".to_string()));
        }

        let consumers = (1..=workers)
            .map(|id| self.connector.connect(group, id).map(|consumer| (id, consumer)))
            .collect::<Result<Vec<_>>>()?;

        let mut handles = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        for (id, consumer) in consumers {
            let worker = Worker {
                group: group.to_string(),
                id,
                consumer,
                registry: self.registry.clone(),
                view: self.view.clone(),
                config: self.config.clone(),
                metrics: self.metrics.clone(),
                shutdown: self.shutdown.clone(),
            };
            handles.push(tokio::spawn(worker.run()));
        }

        tracing::info!(group, workers, "🚀 Processing group subscribed");
        Ok(())
    }

    /// Subscribes every processing group with its declared worker count.
    pub fn subscribe_all(&self) -> Result<()> {
        for group in self.registry.processing_groups() {
            self.subscribe(group.name(), group.workers())?;
        }
        Ok(())
    }

    /// Signals every worker, then waits for all of them to close their consumer.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let handles = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *workers)
        };

        let count = handles.len();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Stream worker task failed");
            }
        }
        tracing::info!(workers = count, "Event stream stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("config", &self.config)
            .field("shut_down", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Worker
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchOutcome {
    Completed,
    Failed,
    Interrupted,
}

struct Worker {
    group: String,
    id: usize,
    consumer: Box<dyn BrokerConsumer>,
    registry: Arc<HandlerRegistry>,
    view: StatelessView,
    config: StreamConfig,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(mut self) {
        tracing::info!(group = %self.group, worker = self.id, "Stream worker started");
        let shutdown = self.shutdown.clone();

        loop {
            let polled = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                polled = self.consumer.poll(self.config.poll_timeout, self.config.max_poll_records) => polled,
            };

            let records = match polled {
                Ok(records) => records,
                Err(e) => {
                    tracing::error!(group = %self.group, worker = self.id, error = %e, "Poll failed");
                    self.metrics.record_stream_failure(&self.group, e.kind());
                    self.back_off().await;
                    continue;
                }
            };

            if records.is_empty() {
                continue;
            }

            match self.process_batch(&records).await {
                BatchOutcome::Completed => {}
                BatchOutcome::Failed => self.back_off().await,
                BatchOutcome::Interrupted => break,
            }
        }

        if let Err(e) = self.consumer.close().await {
            tracing::warn!(group = %self.group, worker = self.id, error = %e, "Failed to close consumer");
        }
        tracing::info!(group = %self.group, worker = self.id, "Stream worker stopped");
    }

    async fn process_batch(&mut self, records: &[BrokerRecord]) -> BatchOutcome {
        let mut next_offsets: BTreeMap<TopicPartition, i64> = BTreeMap::new();

        for (index, record) in records.iter().enumerate() {
            if self.shutdown.is_cancelled() {
                self.commit(&next_offsets).await;
                return BatchOutcome::Interrupted;
            }

            if let Err(e) = self.process_record(record).await {
                tracing::error!(
                    group = %self.group,
                    worker = self.id,
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Stream record failed, redelivering from this offset"
                );
                self.metrics.record_stream_failure(&self.group, e.kind());
                self.commit(&next_offsets).await;
                self.rewind(&records[index..]).await;
                return BatchOutcome::Failed;
            }

            next_offsets.insert(record.topic_partition(), record.offset + 1);
        }

        self.commit(&next_offsets).await;
        BatchOutcome::Completed
    }

    async fn process_record(&self, record: &BrokerRecord) -> Result<()> {
        let Some(value) = record.value.as_deref() else {
            tracing::debug!(group = %self.group, offset = record.offset, "Skipping tombstone");
            return Ok(());
        };

        let Some(envelope) = envelope::decode(value)? else {
            tracing::debug!(group = %self.group, offset = record.offset, "Skipping change record without event");
            return Ok(());
        };

        let handled = self
            .registry
            .processing_group(&self.group)
            .is_some_and(|group| group.handles(&envelope.type_name));
        if !handled {
            tracing::debug!(
                group = %self.group,
                event = %envelope.type_name,
                global_sequence = envelope.global_sequence,
                "No stream handler for event, acknowledging"
            );
            return Ok(());
        }

        let event = self
            .registry
            .decode_event(&envelope.type_name, &envelope.payload)?
            .ok_or_else(|| Error::serialization(&envelope.type_name, "no decoder registered"))?;

        let info = EventInfo {
            type_name: envelope.type_name.clone(),
            aggregate_global_id: envelope.aggregate_global_id,
            global_sequence: Some(envelope.global_sequence),
            metadata: envelope.metadata,
        };
        let ctx = self
            .registry
            .context()
            .with_stateless(&self.view)
            .with_event(&info);

        self.registry
            .dispatch_stream_handlers(&self.group, event.as_ref(), &ctx)
            .await?;

        self.metrics.record_stream_record(&self.group, &info.type_name);
        tracing::debug!(
            group = %self.group,
            worker = self.id,
            event = %info.type_name,
            global_sequence = envelope.global_sequence,
            "Stream record processed"
        );
        Ok(())
    }

    /// A failed commit only widens the redelivery window, so it is logged and dropped.
    async fn commit(&mut self, next_offsets: &BTreeMap<TopicPartition, i64>) {
        if next_offsets.is_empty() {
            return;
        }

        let offsets: Vec<(TopicPartition, i64)> =
            next_offsets.iter().map(|(tp, offset)| (tp.clone(), *offset)).collect();

        match self.consumer.commit(&offsets).await {
            Ok(()) => {
                for (tp, offset) in &offsets {
                    self.metrics.record_commit(&self.group, &tp.topic, tp.partition, *offset);
                }
            }
            Err(e) => {
                tracing::warn!(group = %self.group, worker = self.id, error = %e, "Offset commit failed");
            }
        }
    }

    /// Seeks each partition in `pending` back to its earliest offset there.
    async fn rewind(&mut self, pending: &[BrokerRecord]) {
        let mut positions: BTreeMap<TopicPartition, i64> = BTreeMap::new();
        for record in pending {
            positions.entry(record.topic_partition()).or_insert(record.offset);
        }
        let positions: Vec<(TopicPartition, i64)> = positions.into_iter().collect();

        if let Err(e) = self.consumer.rewind(&positions).await {
            tracing::error!(
                group = %self.group,
                worker = self.id,
                error = %e,
                "Rewind failed, pending records wait for the next rebalance"
            );
        }
    }

    async fn back_off(&self) {
        self.metrics.record_backoff(&self.group);
        tracing::warn!(
            group = %self.group,
            worker = self.id,
            backoff_ms = self.config.backoff.as_millis() as u64,
            "Backing off"
        );
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.config.backoff) => {}
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sourcing::{Database, Event};
    use crate::wiring::{Dep, DependencyRegister};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::MutexGuard;
    use std::time::Duration;

    const TOPIC: &str = "events";

    #[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
    struct Added {
        amount: i64,
    }

    impl Event for Added {
        const TYPE_NAME: &'static str = "Added";
    }

    // ------------------------------------------------------------------------
    // In-memory broker
    // ------------------------------------------------------------------------

    #[derive(Default)]
    struct Log {
        records: Vec<BrokerRecord>,
        positions: HashMap<TopicPartition, i64>,
        commits: Vec<(TopicPartition, i64)>,
        rewinds: Vec<(TopicPartition, i64)>,
        connected: Vec<(String, usize)>,
        closed: usize,
    }

    #[derive(Clone, Default)]
    struct FakeBroker(Arc<Mutex<Log>>);

    impl FakeBroker {
        fn log(&self) -> MutexGuard<'_, Log> {
            self.0.lock().unwrap()
        }

        fn push(&self, partition: i32, value: Option<Vec<u8>>) -> BrokerRecord {
            let mut log = self.log();
            let offset = log.records.iter().filter(|r| r.partition == partition).count() as i64;
            let record = BrokerRecord {
                topic: TOPIC.to_string(),
                partition,
                offset,
                value,
            };
            log.records.push(record.clone());
            record
        }
    }

    impl BrokerConnector for FakeBroker {
        fn connect(&self, group: &str, worker: usize) -> Result<Box<dyn BrokerConsumer>> {
            self.log().connected.push((group.to_string(), worker));
            Ok(Box::new(FakeConsumer(self.clone())))
        }
    }

    struct FakeConsumer(FakeBroker);

    #[async_trait]
    impl BrokerConsumer for FakeConsumer {
        async fn poll(&mut self, timeout: Duration, max_records: usize) -> Result<Vec<BrokerRecord>> {
            let batch = {
                let mut log = self.0.log();
                let batch: Vec<BrokerRecord> = log
                    .records
                    .iter()
                    .filter(|r| r.offset >= log.positions.get(&r.topic_partition()).copied().unwrap_or(0))
                    .take(max_records)
                    .cloned()
                    .collect();
                for record in &batch {
                    log.positions.insert(record.topic_partition(), record.offset + 1);
                }
                batch
            };
            if batch.is_empty() {
                tokio::time::sleep(timeout.min(Duration::from_millis(5))).await;
            }
            Ok(batch)
        }

        async fn commit(&mut self, offsets: &[(TopicPartition, i64)]) -> Result<()> {
            self.0.log().commits.extend_from_slice(offsets);
            Ok(())
        }

        async fn rewind(&mut self, positions: &[(TopicPartition, i64)]) -> Result<()> {
            let mut log = self.0.log();
            for (tp, offset) in positions {
                log.positions.insert(tp.clone(), *offset);
            }
            log.rewinds.extend_from_slice(positions);
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            self.0.log().closed += 1;
            Ok(())
        }
    }

    // ------------------------------------------------------------------------
    // Fixtures
    // ------------------------------------------------------------------------

    struct Recorder {
        seen: Mutex<Vec<i64>>,
        fail_once_at: AtomicI64,
    }

    impl Recorder {
        fn new(fail_once_at: i64) -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
                fail_once_at: AtomicI64::new(fail_once_at),
            }
        }

        fn seen(&self) -> Vec<i64> {
            self.seen.lock().unwrap().clone()
        }
    }

    fn change_record(global_sequence: i64, class_name: &str) -> Option<Vec<u8>> {
        let record = json!({
            "schema": {"type": "struct"},
            "payload": {
                "before": null,
                "after": {
                    "global_sequence": global_sequence,
                    "aggregate_global_id": 1,
                    "class_name": class_name,
                    "payload": json!({"amount": global_sequence}).to_string(),
                    "metadata": "{}"
                },
                "op": "c"
            }
        });
        Some(record.to_string().into_bytes())
    }

    fn config() -> StreamConfig {
        StreamConfig {
            poll_timeout: Duration::from_millis(20),
            max_poll_records: 50,
            backoff: Duration::from_millis(10),
        }
    }

    fn registry(recorder: Arc<Recorder>, workers: usize) -> Arc<HandlerRegistry> {
        let mut register = DependencyRegister::new();
        register.insert_arc(recorder);

        let mut builder = HandlerRegistry::builder(register);
        builder
            .processing_group("projection", workers)
            .unwrap()
            .on_stream_event("projection", |event: Added, recorder: Dep<Recorder>, info: EventInfo| async move {
                let sequence = info.global_sequence.unwrap_or_default();
                if recorder
                    .fail_once_at
                    .compare_exchange(sequence, -1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    anyhow::bail!("refusing event {sequence}");
                }
                assert_eq!(event.amount, sequence);
                recorder.seen.lock().unwrap().push(sequence);
                anyhow::Ok(())
            })
            .unwrap();
        Arc::new(builder.build())
    }

    async fn stream(broker: &FakeBroker, registry: Arc<HandlerRegistry>) -> (EventStream, Arc<Metrics>) {
        let database = Database::in_memory().await.unwrap();
        let metrics = Arc::new(Metrics::new().unwrap());
        let stream = EventStream::new(
            registry,
            Arc::new(broker.clone()),
            database.stateless_view(),
            config(),
            metrics.clone(),
        );
        (stream, metrics)
    }

    async fn worker(broker: &FakeBroker, registry: Arc<HandlerRegistry>) -> Worker {
        let database = Database::in_memory().await.unwrap();
        Worker {
            group: "projection".to_string(),
            id: 1,
            consumer: broker.connect("projection", 1).unwrap(),
            registry,
            view: database.stateless_view(),
            config: config(),
            metrics: Arc::new(Metrics::new().unwrap()),
            shutdown: CancellationToken::new(),
        }
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    // ------------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_failure_mid_batch_commits_prefix_and_redelivers_rest() {
        let broker = FakeBroker::default();
        for sequence in 1..=10 {
            broker.push(0, change_record(sequence, "Added"));
        }
        let recorder = Arc::new(Recorder::new(5));
        let (stream, metrics) = stream(&broker, registry(recorder.clone(), 1)).await;
        let p0 = TopicPartition::new(TOPIC, 0);

        stream.subscribe_all().unwrap();
        wait_until(|| broker.log().commits.contains(&(p0.clone(), 10))).await;
        stream.shutdown().await;

        assert_eq!(recorder.seen(), (1..=10).collect::<Vec<_>>());

        let log = broker.log();
        assert_eq!(log.commits, vec![(p0.clone(), 4), (p0.clone(), 10)]);
        assert_eq!(log.rewinds, vec![(p0, 4)]);
        assert_eq!(log.closed, 1);

        assert_eq!(
            metrics
                .stream_records_failed
                .with_label_values(&["projection", "handler"])
                .get(),
            1
        );
        assert_eq!(metrics.stream_backoffs.with_label_values(&["projection"]).get(), 1);
        assert_eq!(
            metrics
                .stream_records_processed
                .with_label_values(&["projection", "Added"])
                .get(),
            10
        );
    }

    #[tokio::test]
    async fn test_undecodable_record_is_handled_like_a_handler_failure() {
        let broker = FakeBroker::default();
        let records = vec![
            broker.push(0, change_record(1, "Added")),
            broker.push(0, change_record(2, "Added")),
            broker.push(0, Some(b"not json".to_vec())),
            broker.push(0, change_record(4, "Added")),
        ];
        let recorder = Arc::new(Recorder::new(-1));
        let mut worker = worker(&broker, registry(recorder.clone(), 1)).await;

        assert_eq!(worker.process_batch(&records).await, BatchOutcome::Failed);

        let p0 = TopicPartition::new(TOPIC, 0);
        assert_eq!(recorder.seen(), vec![1, 2]);
        assert_eq!(broker.log().commits, vec![(p0.clone(), 2)]);
        assert_eq!(broker.log().rewinds, vec![(p0, 2)]);
    }

    #[tokio::test]
    async fn test_rewind_covers_every_pending_partition() {
        let broker = FakeBroker::default();
        let records = vec![
            broker.push(0, change_record(1, "Added")),
            broker.push(1, change_record(2, "Added")),
            broker.push(0, change_record(3, "Added")),
            broker.push(1, change_record(4, "Added")),
            broker.push(2, change_record(5, "Added")),
        ];
        let recorder = Arc::new(Recorder::new(3));
        let mut worker = worker(&broker, registry(recorder.clone(), 1)).await;

        assert_eq!(worker.process_batch(&records).await, BatchOutcome::Failed);

        let log = broker.log();
        assert_eq!(
            log.commits,
            vec![(TopicPartition::new(TOPIC, 0), 1), (TopicPartition::new(TOPIC, 1), 1)]
        );
        assert_eq!(
            log.rewinds,
            vec![
                (TopicPartition::new(TOPIC, 0), 1),
                (TopicPartition::new(TOPIC, 1), 1),
                (TopicPartition::new(TOPIC, 2), 0),
            ]
        );
    }

    #[tokio::test]
    async fn test_tombstones_and_unhandled_types_are_acknowledged() {
        let broker = FakeBroker::default();
        let records = vec![
            broker.push(0, None),
            broker.push(0, change_record(2, "SomethingElse")),
            broker.push(0, Some(json!({"payload": {"after": null}}).to_string().into_bytes())),
            broker.push(0, change_record(4, "Added")),
        ];
        let recorder = Arc::new(Recorder::new(-1));
        let mut worker = worker(&broker, registry(recorder.clone(), 1)).await;

        assert_eq!(worker.process_batch(&records).await, BatchOutcome::Completed);
        assert_eq!(recorder.seen(), vec![4]);
        assert_eq!(broker.log().commits, vec![(TopicPartition::new(TOPIC, 0), 4)]);
        assert!(broker.log().rewinds.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_before_the_next_record() {
        let broker = FakeBroker::default();
        let records = vec![broker.push(0, change_record(1, "Added"))];
        let recorder = Arc::new(Recorder::new(-1));
        let mut worker = worker(&broker, registry(recorder.clone(), 1)).await;

        worker.shutdown.cancel();

        assert_eq!(worker.process_batch(&records).await, BatchOutcome::Interrupted);
        assert!(recorder.seen().is_empty());
        assert!(broker.log().commits.is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_validates_worker_count_and_group() {
        let broker = FakeBroker::default();
        let (stream, _) = stream(&broker, registry(Arc::new(Recorder::new(-1)), 1)).await;

        for workers in [0, MAX_WORKERS + 1] {
            assert!(matches!(
                stream.subscribe("projection", workers),
                Err(Error::Definition(_))
            ));
        }
        assert!(matches!(stream.subscribe("nobody", 1), Err(Error::Definition(_))));
        assert!(broker.log().connected.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_closes_every_worker() {
        let broker = FakeBroker::default();
        let (stream, _) = stream(&broker, registry(Arc::new(Recorder::new(-1)), 3)).await;

        stream.subscribe_all().unwrap();
        assert_eq!(
            broker.log().connected,
            vec![
                ("projection".to_string(), 1),
                ("projection".to_string(), 2),
                ("projection".to_string(), 3),
            ]
        );

        stream.shutdown().await;
        assert!(stream.is_shut_down());
        assert_eq!(broker.log().closed, 3);
        assert!(matches!(stream.subscribe("projection", 1), Err(Error::Broker(_))));
    }
}
