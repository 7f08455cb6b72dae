//! Dead-letter reconciler.
//!
//! Consumes the dead-letter topic under its own consumer group and records
//! each permanent failure in the durable store. This is the last line of
//! defense: the reconciler performs zero retries, catches every error, and
//! acknowledges the record regardless, so it can never loop onto a
//! dead-letter topic of its own.

use crate::headers::header_value_utf8;
use crate::metrics::PipelineMetrics;
use anyhow::Result;
use kafka_producer::{EXCEPTION_CLASS_HEADER, EXCEPTION_MESSAGE_HEADER, IDEMPOTENCY_KEY_HEADER};
use model::OrderRequest;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Message};
use service::{FailureOutcome, FailureRecorder};
use std::sync::Arc;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

const UNKNOWN_FAILURE: &str = "Unknown DLT Failure";

/// DltConsumer wraps the dead-letter StreamConsumer and the failure
/// recorder it drives.
pub struct DltConsumer<R>
where
    R: FailureRecorder + Send + Sync + 'static,
{
    consumer: StreamConsumer,
    recorder: Arc<R>,
    metrics: Arc<PipelineMetrics>,
}

impl<R> DltConsumer<R>
where
    R: FailureRecorder + Send + Sync + 'static,
{
    /// Create a new dead-letter consumer.
    ///
    /// `group_id` is the reconciler's own group (the ingest group id with a
    /// `-dlt` suffix). Auto-commit stays enabled: every record is
    /// acknowledged exactly once, repaired or not.
    pub fn new(
        brokers: &[String],
        topic: &str,
        group_id: &str,
        recorder: Arc<R>,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<Self, KafkaError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers.join(","))
            .set("group.id", group_id)
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.auto.commit", "true")
            .create()?;

        consumer.subscribe(&[topic])?;
        Ok(Self {
            consumer,
            recorder,
            metrics,
        })
    }

    /// Runs the reconciliation loop until the given context is cancelled.
    pub async fn run(&self, shutdown: Arc<tokio::sync::Notify>) -> Result<()> {
        let mut stream = self.consumer.stream();

        loop {
            tokio::select! {
                maybe_msg = stream.next() => {
                    match maybe_msg {
                        Some(Ok(msg)) => {
                            self.handle_record(&msg).await;
                        }
                        Some(Err(e)) => {
                            error!("Kafka error: {e}");
                        }
                        None => {
                            debug!("Dead-letter stream ended.");
                            break;
                        }
                    }
                }
                _ = shutdown.notified() => {
                    info!("Dead-letter consumer received shutdown signal.");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Handles one dead-lettered record, swallowing every failure.
    async fn handle_record(&self, msg: &BorrowedMessage<'_>) {
        if let Err(e) = self.reconcile(msg).await {
            self.metrics.dlt_reconcile_failures.inc();
            error!(
                offset = msg.offset(),
                "Failed to reconcile dead-lettered record, dropping: {e}"
            );
        }
    }

    async fn reconcile(&self, msg: &BorrowedMessage<'_>) -> Result<()> {
        let Some(idempotency_key) = header_value_utf8(msg, IDEMPOTENCY_KEY_HEADER) else {
            warn!(
                offset = msg.offset(),
                "Dead-lettered record has no idempotency key, nothing can be repaired"
            );
            return Ok(());
        };

        // The payload is raw bytes from the original record and may not be
        // an order request at all.
        let request: Option<OrderRequest> =
            msg.payload().and_then(|p| serde_json::from_slice(p).ok());
        if request.is_none() {
            warn!(
                idempotency_key = %idempotency_key,
                "Dead-lettered payload is undecodable, repair limited to existing rows"
            );
        }

        let reason = derive_failure_reason(
            header_value_utf8(msg, EXCEPTION_MESSAGE_HEADER),
            header_value_utf8(msg, EXCEPTION_CLASS_HEADER),
        );

        let outcome = self
            .recorder
            .record_failure(&idempotency_key, &reason, request.as_ref())
            .await?;
        self.metrics
            .dlt_reconciled
            .with_label_values(&[outcome_label(outcome)])
            .inc();
        info!(
            idempotency_key = %idempotency_key,
            outcome = outcome_label(outcome),
            "Dead-lettered record reconciled"
        );
        Ok(())
    }

    /// Close the consumer, flushing resources.
    pub async fn close(&self) {
        info!("Dead-letter consumer closed.");
    }
}

/// Picks the recorded failure reason: the exception message if present,
/// else the exception class, else a fixed fallback.
fn derive_failure_reason(message: Option<String>, class: Option<String>) -> String {
    message
        .or(class)
        .unwrap_or_else(|| UNKNOWN_FAILURE.to_string())
}

fn outcome_label(outcome: FailureOutcome) -> &'static str {
    match outcome {
        FailureOutcome::MarkedFailed => "marked_failed",
        FailureOutcome::CreatedFailed => "created_failed",
        FailureOutcome::AlreadyTerminal => "already_terminal",
        FailureOutcome::NothingToRepair => "nothing_to_repair",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reason_prefers_message_over_class() {
        assert_eq!(
            derive_failure_reason(Some("connection reset".into()), Some("Transient".into())),
            "connection reset"
        );
        assert_eq!(
            derive_failure_reason(None, Some("Transient".into())),
            "Transient"
        );
        assert_eq!(derive_failure_reason(None, None), "Unknown DLT Failure");
    }

    #[test]
    fn test_outcome_labels_are_distinct() {
        let labels = [
            outcome_label(FailureOutcome::MarkedFailed),
            outcome_label(FailureOutcome::CreatedFailed),
            outcome_label(FailureOutcome::AlreadyTerminal),
            outcome_label(FailureOutcome::NothingToRepair),
        ];
        for (i, a) in labels.iter().enumerate() {
            for b in labels.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }
}
