use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

/// `AppConfig` holds all configuration parameters required by the pipeline.
///
/// The configuration is loaded from environment variables (optionally via a
/// `.env` file) or uses default values if the variable is not set. Fields
/// cover the database, Kafka topics and consumer group, Redis, the retry
/// policy, idempotency TTLs, and the ops HTTP server. This struct is
/// deserializable via Serde.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AppConfig {
    // --- Database settings ---
    /// Database hostname or service name (e.g. "postgres" in Docker Compose, "localhost" for local runs).
    pub db_host: String,
    /// Database port (default: 5432).
    pub db_port: u16,
    /// Database user.
    pub db_user: String,
    /// Database password.
    pub db_password: String,
    /// Database name.
    pub db_name: String,

    // --- Kafka settings ---
    /// List of Kafka brokers (comma-separated string in env, parsed to Vec<String>).
    pub kafka_brokers: Vec<String>,
    /// Primary topic carrying inbound order requests.
    pub orders_received_topic: String,
    /// Dead-letter topic for records that exhausted their retry budget.
    pub orders_dlt_topic: String,
    /// Outbound topic carrying completion events.
    pub orders_processed_topic: String,
    /// Kafka consumer group ID for the ingest consumer.
    pub kafka_group_id: String,

    // --- Redis ---
    /// Connection string for the shared key-value store backing the idempotency gate.
    pub redis_url: String,

    // --- Retry policy ---
    /// Total delivery attempts per record, including the first one.
    pub retry_max_attempts: u32,
    /// Backoff before the first retry (human-friendly format, e.g. "1s").
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub retry_initial_interval: Duration,
    /// Multiplier applied to the backoff after each failed attempt.
    pub retry_multiplier: f64,
    /// Upper bound on the backoff between attempts.
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub retry_max_interval: Duration,

    // --- Idempotency gate TTLs ---
    /// Lifetime of an in-flight PROCESSING claim.
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub idempotency_processing_ttl: Duration,
    /// Lifetime of a completed PROCESSED marker.
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub idempotency_processed_ttl: Duration,

    // --- HTTP server ---
    /// The port on which the ops HTTP server (health, metrics) will listen.
    pub http_port: u16,

    // --- Shutdown timeout ---
    /// Graceful shutdown timeout (human-friendly format, e.g. "5s", "1m").
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub shutdown_timeout: Duration,
}

/// Custom deserializer for duration fields.
/// Accepts human-readable formats like "5s", "1m", "24h".
fn deserialize_duration_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    let val = String::deserialize(deserializer)?;
    humantime::parse_duration(&val)
        .map_err(|e| D::Error::custom(format!("Invalid duration '{val}': {e}")))
}

impl AppConfig {
    /// Loads configuration from environment variables (and optionally from `.env` file).
    ///
    /// Fields not set via env will be filled with default values.
    ///
    /// # Errors
    /// Returns an error if environment variables are invalid or missing required values.
    pub fn load() -> Result<Self> {
        // Load from .env file (for Docker environment)
        dotenvy::dotenv().ok();

        // Note: These default values are for local development.
        // In Docker Compose the service hostnames are injected via environment
        // variables.
        let settings = config::Config::builder()
            // Database
            .set_default("db_host", "localhost")?
            .set_default("db_port", 5432)?
            .set_default("db_user", "orders_user")?
            .set_default("db_password", "securepassword")?
            .set_default("db_name", "orders_db")?
            // Kafka
            .set_default("kafka_brokers", vec!["localhost:9092"])?
            .set_default("orders_received_topic", "orders.received")?
            .set_default("orders_dlt_topic", "orders.dlt")?
            .set_default("orders_processed_topic", "orders.processed")?
            .set_default("kafka_group_id", "order-pipeline")?
            // Redis
            .set_default("redis_url", "redis://localhost:6379")?
            // Retry policy
            .set_default("retry_max_attempts", 3)?
            .set_default("retry_initial_interval", "1s")?
            .set_default("retry_multiplier", 2.0)?
            .set_default("retry_max_interval", "5s")?
            // Idempotency gate
            .set_default("idempotency_processing_ttl", "1h")?
            .set_default("idempotency_processed_ttl", "24h")?
            // HTTP
            .set_default("http_port", 8081)?
            // Shutdown
            .set_default("shutdown_timeout", "5s")?
            .add_source(config::Environment::default())
            .build()?;

        settings
            .try_deserialize()
            .context("Failed to load configuration")
    }

    /// Consumer group used by the dead-letter reconciler.
    pub fn dlt_group_id(&self) -> String {
        format!("{}-dlt", self.kafka_group_id)
    }
}
