//! Kafka consumers for the order ingestion pipeline.
//!
//! Two consumers share this crate: [`IngestConsumer`] drives the primary
//! topic through the idempotency gate and the processor, retrying with
//! exponential backoff and routing exhausted records to the dead-letter
//! topic; [`DltConsumer`] drains the dead-letter topic and reconciles the
//! database with each permanently failed record.

pub mod dlt;
pub mod headers;
pub mod ingest;
pub mod metrics;
pub mod retry;

pub use dlt::DltConsumer;
pub use ingest::IngestConsumer;
pub use metrics::PipelineMetrics;
pub use retry::RetryPolicy;
