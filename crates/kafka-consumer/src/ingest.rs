//! Ingest consumer for the primary order topic.
//!
//! Drives each record through the idempotency gate and the order processor,
//! retries transient failures with exponential backoff inside the held
//! claim, and routes exhausted or poisoned records to the dead-letter
//! topic. Offsets are committed manually: a record whose handling could not
//! reach a routing decision stays uncommitted and is redelivered.

use crate::headers::{collect_headers, header_value_utf8};
use crate::metrics::PipelineMetrics;
use crate::retry::RetryPolicy;
use anyhow::Result;
use idempotency::{ClaimOutcome, IdempotencyGate};
use kafka_producer::{DeadLetter, EventPublisher, IDEMPOTENCY_KEY_HEADER};
use model::{Order, OrderRequest};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Message};
use serde_json::from_slice;
use service::{OrderProcessor, ProcessError};
use std::sync::Arc;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

/// IngestConsumer wraps the underlying StreamConsumer and the pipeline
/// dependencies it drives for every record.
pub struct IngestConsumer<P, E>
where
    P: OrderProcessor + Send + Sync + 'static,
    E: EventPublisher + Send + Sync + 'static,
{
    consumer: StreamConsumer,
    processor: Arc<P>,
    gate: Arc<IdempotencyGate>,
    publisher: Arc<E>,
    retry: RetryPolicy,
    metrics: Arc<PipelineMetrics>,
}

impl<P, E> IngestConsumer<P, E>
where
    P: OrderProcessor + Send + Sync + 'static,
    E: EventPublisher + Send + Sync + 'static,
{
    /// Create a new ingest consumer for the specified brokers/topic/group.
    ///
    /// Auto-commit is disabled; offsets are committed per record once a
    /// routing decision (processed, skipped, or dead-lettered) is reached.
    pub fn new(
        brokers: &[String],
        topic: &str,
        group_id: &str,
        processor: Arc<P>,
        gate: Arc<IdempotencyGate>,
        publisher: Arc<E>,
        retry: RetryPolicy,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<Self, KafkaError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers.join(","))
            .set("group.id", group_id)
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.auto.commit", "false")
            .create()?;

        consumer.subscribe(&[topic])?;
        Ok(Self {
            consumer,
            processor,
            gate,
            publisher,
            retry,
            metrics,
        })
    }

    /// Runs the main consumption loop until the given context is cancelled.
    ///
    /// # Arguments
    /// * `shutdown`: a signal for graceful shutdown (e.g., tokio::sync::Notify).
    pub async fn run(&self, shutdown: Arc<tokio::sync::Notify>) -> Result<()> {
        let mut stream = self.consumer.stream();

        loop {
            tokio::select! {
                maybe_msg = stream.next() => {
                    match maybe_msg {
                        Some(Ok(msg)) => {
                            match self.handle_message(&msg).await {
                                Ok(()) => {
                                    if let Err(e) = self.consumer.commit_message(&msg, CommitMode::Async) {
                                        error!("Failed to commit offset: {e}");
                                    }
                                }
                                Err(e) => {
                                    // Offset stays uncommitted so the record is
                                    // redelivered after a rebalance or restart.
                                    error!("Failed to handle Kafka message: {e}");
                                }
                            }
                        }
                        Some(Err(e)) => {
                            error!("Kafka error: {e}");
                        }
                        None => {
                            debug!("Kafka stream ended.");
                            break;
                        }
                    }
                }
                _ = shutdown.notified() => {
                    info!("Ingest consumer received shutdown signal.");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Handles a single record through to a routing decision.
    ///
    /// Returns `Ok(())` once the record may be acknowledged; any error means
    /// no decision was reached and the record must be redelivered.
    async fn handle_message(&self, msg: &BorrowedMessage<'_>) -> Result<()> {
        let Some(idempotency_key) = header_value_utf8(msg, IDEMPOTENCY_KEY_HEADER) else {
            warn!(
                offset = msg.offset(),
                "Record has no idempotency key header, routing to dead-letter topic"
            );
            self.dead_letter(
                msg,
                "MissingIdempotencyKey",
                &format!("Header {IDEMPOTENCY_KEY_HEADER} is required"),
            )
            .await?;
            return Ok(());
        };

        match self.gate.try_claim(&idempotency_key).await? {
            ClaimOutcome::AlreadyProcessed => {
                info!(idempotency_key = %idempotency_key, "Key already processed, skipping duplicate");
                self.metrics
                    .orders_skipped
                    .with_label_values(&["already_processed"])
                    .inc();
                return Ok(());
            }
            ClaimOutcome::AlreadyProcessing => {
                // The holder, or its retries, is responsible for this key.
                info!(idempotency_key = %idempotency_key, "Key is being processed elsewhere, skipping");
                self.metrics
                    .orders_skipped
                    .with_label_values(&["already_processing"])
                    .inc();
                return Ok(());
            }
            ClaimOutcome::Unknown(value) => {
                error!(
                    idempotency_key = %idempotency_key,
                    value = ?value,
                    "Unrecognized idempotency state, skipping record without retry"
                );
                self.metrics
                    .orders_skipped
                    .with_label_values(&["unknown_state"])
                    .inc();
                return Ok(());
            }
            ClaimOutcome::Claimed => {}
        }

        let payload = msg.payload().unwrap_or_default();
        let request: OrderRequest = match from_slice(payload) {
            Ok(request) => request,
            Err(e) => {
                // A malformed payload cannot succeed on a later attempt.
                warn!(idempotency_key = %idempotency_key, "Failed to deserialize order request: {e}");
                self.dead_letter(
                    msg,
                    "InvalidRequest",
                    &format!("Malformed order request JSON: {e}"),
                )
                .await?;
                return Ok(());
            }
        };

        match process_with_retry(
            self.processor.as_ref(),
            &self.retry,
            &self.metrics,
            &request,
            &idempotency_key,
        )
        .await
        {
            Ok(order) => {
                if let Err(e) = self.gate.mark_completed(&idempotency_key).await {
                    // The claim TTL and the unique index absorb the
                    // consequences of a lost completion marker.
                    error!(
                        idempotency_key = %idempotency_key,
                        error = %e,
                        "Failed to mark idempotency key completed"
                    );
                }
                self.metrics.orders_processed.inc();
                info!(
                    order_id = %order.id,
                    offset = msg.offset(),
                    "Order processed and acknowledged"
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    idempotency_key = %idempotency_key,
                    error_class = e.kind(),
                    "Processing exhausted, routing to dead-letter topic: {e}"
                );
                self.dead_letter(msg, e.kind(), &e.to_string()).await?;
                Ok(())
            }
        }
    }

    /// Forwards the record to the dead-letter topic with diagnostic headers.
    ///
    /// A produce failure propagates so the offset stays uncommitted.
    async fn dead_letter(
        &self,
        msg: &BorrowedMessage<'_>,
        error_class: &str,
        error_message: &str,
    ) -> Result<()> {
        let dead_letter = DeadLetter {
            key: msg.key().map(|k| k.to_vec()),
            payload: msg.payload().unwrap_or_default().to_vec(),
            headers: collect_headers(msg),
            error_class: error_class.to_string(),
            error_message: error_message.to_string(),
        };
        self.publisher.publish_dead_letter(&dead_letter).await?;
        self.metrics
            .orders_dead_lettered
            .with_label_values(&[error_class])
            .inc();
        Ok(())
    }

    /// Close the consumer, flushing resources.
    pub async fn close(&self) {
        info!("Ingest consumer closed.");
    }
}

/// Invokes the processor under the retry policy, inside the held claim.
///
/// Transient errors back off and retry until the attempt budget is spent;
/// non-retryable errors short-circuit immediately.
async fn process_with_retry<P: OrderProcessor>(
    processor: &P,
    retry: &RetryPolicy,
    metrics: &PipelineMetrics,
    request: &OrderRequest,
    idempotency_key: &str,
) -> Result<Order, ProcessError> {
    let mut attempt: u32 = 1;
    loop {
        match processor.process(request, idempotency_key).await {
            Ok(order) => return Ok(order),
            Err(e) if e.is_retryable() && attempt < retry.max_attempts => {
                let delay = retry.delay_after_attempt(attempt);
                warn!(
                    idempotency_key = %idempotency_key,
                    attempt,
                    max_attempts = retry.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Processing failed, backing off before retry: {e}"
                );
                metrics.processing_retries.inc();
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use prometheus::Registry;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Processor double failing a configurable number of times before
    /// succeeding, or always failing with a fixed error.
    struct ScriptedProcessor {
        invocations: AtomicU32,
        fail_first: u32,
        permanent: Option<fn() -> ProcessError>,
    }

    impl ScriptedProcessor {
        fn failing_first(n: u32) -> Self {
            Self {
                invocations: AtomicU32::new(0),
                fail_first: n,
                permanent: None,
            }
        }

        fn always(permanent: fn() -> ProcessError) -> Self {
            Self {
                invocations: AtomicU32::new(0),
                fail_first: u32::MAX,
                permanent: Some(permanent),
            }
        }
    }

    #[async_trait]
    impl OrderProcessor for ScriptedProcessor {
        async fn process(
            &self,
            request: &OrderRequest,
            idempotency_key: &str,
        ) -> Result<Order, ProcessError> {
            let n = self.invocations.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(make_error) = self.permanent {
                return Err(make_error());
            }
            if n <= self.fail_first {
                return Err(ProcessError::Transient("connection reset".into()));
            }
            let mut order = model::Order {
                id: uuid::Uuid::new_v4(),
                idempotency_key: idempotency_key.to_string(),
                status: model::OrderStatus::Processed,
                total: dec!(0.00),
                items: Vec::new(),
                failure_reason: None,
                created_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
                version: 0,
            };
            order.total = request
                .items
                .iter()
                .map(|it| it.price * rust_decimal::Decimal::from(it.quantity))
                .sum();
            Ok(order)
        }
    }

    fn request() -> OrderRequest {
        OrderRequest {
            items: vec![model::OrderItemRequest {
                product_id: "P1".to_string(),
                quantity: 2,
                price: dec!(10.00),
            }],
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1), 2.0, Duration::from_millis(5))
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_recovers_within_budget() {
        let processor = ScriptedProcessor::failing_first(2);
        let metrics = PipelineMetrics::new(&Registry::new());

        let order = process_with_retry(&processor, &fast_policy(), &metrics, &request(), "K3")
            .await
            .unwrap();

        assert_eq!(processor.invocations.load(Ordering::SeqCst), 3);
        assert_eq!(order.total, dec!(20.00));
        assert_eq!(metrics.processing_retries.get(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_is_exactly_max_attempts() {
        let processor = ScriptedProcessor::always(|| ProcessError::Transient("down".into()));
        let metrics = PipelineMetrics::new(&Registry::new());

        let err = process_with_retry(&processor, &fast_policy(), &metrics, &request(), "K4")
            .await
            .unwrap_err();

        assert_eq!(processor.invocations.load(Ordering::SeqCst), 3);
        assert_eq!(err.kind(), "Transient");
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_short_circuits() {
        let processor =
            ScriptedProcessor::always(|| ProcessError::DuplicateKey("K5".into()));
        let metrics = PipelineMetrics::new(&Registry::new());

        let err = process_with_retry(&processor, &fast_policy(), &metrics, &request(), "K5")
            .await
            .unwrap_err();

        assert_eq!(processor.invocations.load(Ordering::SeqCst), 1);
        assert_eq!(err.kind(), "DuplicateKey");
        assert_eq!(metrics.processing_retries.get(), 0);
    }
}
