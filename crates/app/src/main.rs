//! Order Ingestion Pipeline Application
//!
//! This is the main entry point for the order ingestion service. The
//! process consumes order requests from the primary Kafka topic, processes
//! each exactly once against the shared idempotency gate, persists the
//! result to PostgreSQL, and publishes a completion event after the commit.
//! Records that exhaust their retry budget are routed to the dead-letter
//! topic, where a second consumer records the permanent failure.
//!
//! # Lifecycle
//!
//! Initialize (config, tracing, DB pool + migrations, Redis gate, Kafka
//! clients) -> serve (ingest consumer, dead-letter reconciler, ops HTTP
//! server) -> drain (stop polling, await in-flight work up to the shutdown
//! timeout) -> close (flush the producer).

use anyhow::{Context, Result};
use app_config::AppConfig;
use idempotency::IdempotencyGate;
use kafka_consumer::{DltConsumer, IngestConsumer, PipelineMetrics, RetryPolicy};
use kafka_producer::KafkaEventPublisher;
use prometheus::Registry;
use repository::{PgOrderItemsRepository, PgOrdersRepository};
use server::Server;
use service::{FailureRecorderImpl, OrderProcessorImpl};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = AppConfig::load().context("Failed to load configuration")?;
    info!(
        received_topic = %cfg.orders_received_topic,
        dlt_topic = %cfg.orders_dlt_topic,
        processed_topic = %cfg.orders_processed_topic,
        group_id = %cfg.kafka_group_id,
        "Configuration loaded"
    );

    let db_pool = db::init_db_pool(&cfg)
        .await
        .context("Failed to initialize database")?;

    let gate = Arc::new(
        IdempotencyGate::connect(
            &cfg.redis_url,
            cfg.idempotency_processing_ttl,
            cfg.idempotency_processed_ttl,
        )
        .await
        .context("Failed to connect to Redis")?,
    );

    let publisher = Arc::new(
        KafkaEventPublisher::new(
            &cfg.kafka_brokers,
            &cfg.orders_processed_topic,
            &cfg.orders_dlt_topic,
        )
        .context("Failed to create Kafka producer")?,
    );

    let processor = Arc::new(OrderProcessorImpl::new(
        db_pool.clone(),
        PgOrdersRepository::new(db_pool.clone()),
        PgOrderItemsRepository::new(db_pool.clone()),
        publisher.clone(),
    ));
    let recorder = Arc::new(FailureRecorderImpl::new(
        db_pool.clone(),
        PgOrdersRepository::new(db_pool.clone()),
        PgOrderItemsRepository::new(db_pool.clone()),
    ));

    let registry = Arc::new(Registry::new());
    let metrics = Arc::new(PipelineMetrics::new(&registry));

    let retry = RetryPolicy::new(
        cfg.retry_max_attempts,
        cfg.retry_initial_interval,
        cfg.retry_multiplier,
        cfg.retry_max_interval,
    );

    let ingest = Arc::new(
        IngestConsumer::new(
            &cfg.kafka_brokers,
            &cfg.orders_received_topic,
            &cfg.kafka_group_id,
            processor,
            gate.clone(),
            publisher.clone(),
            retry,
            metrics.clone(),
        )
        .context("Failed to create ingest consumer")?,
    );
    let dlt = Arc::new(
        DltConsumer::new(
            &cfg.kafka_brokers,
            &cfg.orders_dlt_topic,
            &cfg.dlt_group_id(),
            recorder,
            metrics.clone(),
        )
        .context("Failed to create dead-letter consumer")?,
    );

    let shutdown = Arc::new(Notify::new());

    let ingest_task = tokio::spawn({
        let consumer = ingest.clone();
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = consumer.run(shutdown).await {
                error!("Ingest consumer terminated with error: {e}");
            }
        }
    });
    let dlt_task = tokio::spawn({
        let consumer = dlt.clone();
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = consumer.run(shutdown).await {
                error!("Dead-letter consumer terminated with error: {e}");
            }
        }
    });
    let http_server = Server::new(cfg.http_port, registry.clone());
    let server_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = http_server.start(shutdown).await {
                error!("HTTP server terminated with error: {e}");
            }
        }
    });

    shutdown_signal().await;
    info!("Shutdown signal received, draining");
    shutdown.notify_waiters();

    let drain = async {
        let _ = ingest_task.await;
        let _ = dlt_task.await;
        let _ = server_task.await;
    };
    if tokio::time::timeout(cfg.shutdown_timeout, drain).await.is_err() {
        warn!(
            "Drain did not finish within {:?}, shutting down anyway",
            cfg.shutdown_timeout
        );
    }

    ingest.close().await;
    dlt.close().await;
    if let Err(e) = publisher.flush(Duration::from_secs(5)) {
        error!("Failed to flush Kafka producer: {e}");
    }
    info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
