//! Kafka producer module for outbound pipeline records.
//!
//! One shared, thread-safe producer publishes the two outbound record kinds:
//! completion events on the processed topic (strictly after the database
//! commit) and dead-letter records carrying the original payload plus
//! diagnostic headers.

use async_trait::async_trait;
use model::OrderProcessedEvent;
use rdkafka::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

/// Mandatory header on inbound records; copied onto dead-letter records.
pub const IDEMPOTENCY_KEY_HEADER: &str = "X-Idempotency-Key";
/// Diagnostic header naming the error kind that exhausted the record.
pub const EXCEPTION_CLASS_HEADER: &str = "x-exception-class";
/// Diagnostic header carrying the error message that exhausted the record.
pub const EXCEPTION_MESSAGE_HEADER: &str = "x-exception-message";

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors raised while publishing an outbound record.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("Failed to serialize event: {0}")]
    Serde(#[from] serde_json::Error),
}

/// A record routed to the dead-letter topic.
///
/// Carries the original key, payload and headers untouched, plus the
/// diagnostic error class and message appended as headers.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, Vec<u8>)>,
    pub error_class: String,
    pub error_message: String,
}

/// Sink for outbound pipeline records.
///
/// The trait seam keeps the service and consumer layers testable without a
/// broker.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publishes a completion event, keyed by the order id.
    async fn publish_completion(&self, event: &OrderProcessedEvent) -> Result<(), PublishError>;

    /// Publishes a dead-letter record.
    async fn publish_dead_letter(&self, dead_letter: &DeadLetter) -> Result<(), PublishError>;
}

/// Kafka-backed [`EventPublisher`] over a shared [`FutureProducer`].
pub struct KafkaEventPublisher {
    producer: FutureProducer,
    processed_topic: String,
    dlt_topic: String,
}

impl KafkaEventPublisher {
    /// Creates the producer for the specified brokers and topics.
    pub fn new(
        brokers: &[String],
        processed_topic: &str,
        dlt_topic: &str,
    ) -> Result<Self, KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers.join(","))
            .set("message.timeout.ms", "5000")
            .create()?;

        Ok(Self {
            producer,
            processed_topic: processed_topic.to_string(),
            dlt_topic: dlt_topic.to_string(),
        })
    }

    /// Flushes any in-flight sends, used during graceful shutdown.
    pub fn flush(&self, timeout: Duration) -> Result<(), KafkaError> {
        self.producer.flush(timeout)
    }
}

#[async_trait]
impl EventPublisher for KafkaEventPublisher {
    async fn publish_completion(&self, event: &OrderProcessedEvent) -> Result<(), PublishError> {
        let key = event.order_id.to_string();
        let payload = serde_json::to_string(event)?;

        let record = FutureRecord::to(&self.processed_topic)
            .key(&key)
            .payload(&payload);

        match self.producer.send(record, SEND_TIMEOUT).await {
            Ok(_) => {
                info!(order_id = %event.order_id, topic = %self.processed_topic, "Completion event published");
                Ok(())
            }
            Err((e, _)) => {
                error!(order_id = %event.order_id, error = %e, "Failed to publish completion event");
                Err(PublishError::Kafka(e))
            }
        }
    }

    async fn publish_dead_letter(&self, dead_letter: &DeadLetter) -> Result<(), PublishError> {
        let headers = dead_letter_headers(
            &dead_letter.headers,
            &dead_letter.error_class,
            &dead_letter.error_message,
        );

        let mut record = FutureRecord::<Vec<u8>, Vec<u8>>::to(&self.dlt_topic)
            .payload(&dead_letter.payload)
            .headers(headers);
        if let Some(key) = &dead_letter.key {
            record = record.key(key);
        }

        match self.producer.send(record, SEND_TIMEOUT).await {
            Ok(_) => {
                info!(
                    topic = %self.dlt_topic,
                    error_class = %dead_letter.error_class,
                    "Record routed to dead-letter topic"
                );
                Ok(())
            }
            Err((e, _)) => {
                error!(topic = %self.dlt_topic, error = %e, "Failed to publish dead-letter record");
                Err(PublishError::Kafka(e))
            }
        }
    }
}

/// Builds the dead-letter header set: all original headers, then the
/// diagnostic pair.
fn dead_letter_headers(
    original: &[(String, Vec<u8>)],
    error_class: &str,
    error_message: &str,
) -> OwnedHeaders {
    let mut headers = OwnedHeaders::new();
    for (key, value) in original {
        headers = headers.insert(Header {
            key: key.as_str(),
            value: Some(value),
        });
    }
    headers = headers.insert(Header {
        key: EXCEPTION_CLASS_HEADER,
        value: Some(error_class.as_bytes()),
    });
    headers.insert(Header {
        key: EXCEPTION_MESSAGE_HEADER,
        value: Some(error_message.as_bytes()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::message::Headers;

    #[test]
    fn test_dead_letter_headers_append_diagnostics() {
        let original = vec![(
            IDEMPOTENCY_KEY_HEADER.to_string(),
            b"K4".to_vec(),
        )];
        let headers = dead_letter_headers(&original, "Transient", "connection reset");

        let collected: Vec<(&str, Option<&[u8]>)> =
            headers.iter().map(|h| (h.key, h.value)).collect();
        assert_eq!(
            collected,
            vec![
                (IDEMPOTENCY_KEY_HEADER, Some(b"K4".as_slice())),
                (EXCEPTION_CLASS_HEADER, Some(b"Transient".as_slice())),
                (
                    EXCEPTION_MESSAGE_HEADER,
                    Some(b"connection reset".as_slice())
                ),
            ]
        );
    }
}
