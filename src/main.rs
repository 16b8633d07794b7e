use chrono::NaiveDate;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use ddd_engine::domain::driver::{self, AmendDriverName, DriverView, RegisterDriver, GET_DRIVER_BY_ID};
use ddd_engine::event_sourcing::Database;
use ddd_engine::gateway::{CommandGateway, QueryGateway};
use ddd_engine::messaging::{EventStream, KafkaConnector};
use ddd_engine::metrics::Metrics;
use ddd_engine::wiring::{DependencyRegister, HandlerRegistry};
use ddd_engine::EngineConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to INFO level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,ddd_engine=debug")),
        )
        .init();

    tracing::info!("🚀 Starting DDD engine demo");
    let config = EngineConfig::from_env();

    // === 1. Storage ===
    tracing::info!(url = %config.database_url, "Connecting to database");
    let database = Database::connect(&config.database_url, config.database_max_connections).await?;
    database.migrate().await?;
    driver::projection::migrate(&database).await?;

    // === 2. Metrics ===
    let metrics = Arc::new(Metrics::new()?);
    tracing::info!("📊 Metrics registry created with {} metrics", metrics.registry().gather().len());

    // === 3. Handlers ===
    let mut builder = HandlerRegistry::builder(DependencyRegister::new());
    driver::register_handlers(&mut builder)?;
    let registry = Arc::new(builder.build());

    let commands = CommandGateway::new(database.clone(), registry.clone(), metrics.clone());
    let queries = QueryGateway::new(registry.clone(), database.stateless_view());

    // === 4. Stream consumer (optional) ===
    let stream = match &config.kafka_brokers {
        Some(brokers) => {
            let connector = KafkaConnector::new(brokers, &config.event_topic, &config.consumer_group_prefix);
            let stream = EventStream::new(
                registry.clone(),
                Arc::new(connector),
                database.stateless_view(),
                config.stream.clone(),
                metrics.clone(),
            );
            stream.subscribe_all()?;
            Some(stream)
        }
        None => {
            tracing::info!("KAFKA_BROKERS not set, event stream disabled");
            None
        }
    };

    // === 5. Demonstrate the command and query paths ===
    tracing::info!("📝 Demonstrating driver lifecycle");
    let driver_id = Uuid::new_v4();
    let date_of_birth = NaiveDate::from_ymd_opt(1990, 4, 1)
        .ok_or_else(|| anyhow::anyhow!("invalid demo date of birth"))?;

    let receipt = commands
        .send(RegisterDriver {
            id: driver_id,
            name: "Alice".to_string(),
            date_of_birth,
        })
        .await?;
    tracing::info!(%driver_id, event_sequence = receipt.event_sequence, "✅ Driver registered");

    let receipt = commands
        .send(AmendDriverName {
            id: driver_id,
            name: "Bob".to_string(),
        })
        .await?;
    tracing::info!(%driver_id, event_sequence = receipt.event_sequence, "✅ Driver name amended");

    let driver: Option<DriverView> = queries.query(GET_DRIVER_BY_ID, driver_id).await?;
    tracing::info!(?driver, "🔎 Queried driver");

    // === 6. Run until Ctrl-C ===
    if let Some(stream) = &stream {
        tracing::info!("Event stream running, press Ctrl-C to stop");
        tokio::signal::ctrl_c().await?;
        tracing::info!("Shutting down");
        stream.shutdown().await;
    }

    tracing::info!("Final metrics:\n{}", metrics.encode_text()?);
    Ok(())
}
