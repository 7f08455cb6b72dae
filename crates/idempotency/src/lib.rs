//! Redis-backed idempotency gate shared across all consumer instances.
//!
//! The gate is a pure compare-and-set decision point: `try_claim` performs a
//! single atomic set-if-absent, so for any key exactly one worker in the
//! fleet observes `Claimed`. It never blocks and holds no lock beyond the
//! claim TTL.

use redis::Client;
use redis::aio::ConnectionManager;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Value stored while a worker holds the claim.
pub const PROCESSING: &str = "PROCESSING";
/// Value stored once the downstream transaction has committed.
pub const PROCESSED: &str = "PROCESSED";

const KEY_PREFIX: &str = "idempotency:order:";

/// Errors from the underlying key-value store.
///
/// Any gate error is fatal for the record being handled: processing must not
/// proceed without a successful claim, and the caller leaves the record
/// uncommitted so the bus redelivers it.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Result of an atomic claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This worker won the claim and owns processing for the key.
    Claimed,
    /// Another worker holds an in-flight claim.
    AlreadyProcessing,
    /// The key completed processing earlier; the record is a duplicate.
    AlreadyProcessed,
    /// The stored value is unrecognized (or the key expired between the
    /// failed set and the read). Skipped without retry to avoid tight loops
    /// on corrupted state.
    Unknown(Option<String>),
}

/// Idempotency gate backed by a shared Redis instance.
///
/// Cheap to clone per call site via the auto-reconnecting
/// [`ConnectionManager`]; all mutations use single-key atomic primitives.
pub struct IdempotencyGate {
    conn: ConnectionManager,
    processing_ttl: Duration,
    processed_ttl: Duration,
}

impl IdempotencyGate {
    /// Connects to Redis and returns a ready gate.
    ///
    /// # Arguments
    /// * `redis_url` - connection string, e.g. `redis://localhost:6379`.
    /// * `processing_ttl` - lifetime of an in-flight claim.
    /// * `processed_ttl` - lifetime of the completed marker.
    pub async fn connect(
        redis_url: &str,
        processing_ttl: Duration,
        processed_ttl: Duration,
    ) -> Result<Self, GateError> {
        let client = Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            processing_ttl,
            processed_ttl,
        })
    }

    fn storage_key(key: &str) -> String {
        format!("{KEY_PREFIX}{key}")
    }

    /// Atomically claims the key for processing.
    ///
    /// Performs `SET <key> PROCESSING NX EX <processing_ttl>`; if the set is
    /// refused, the current value is read and mapped to the matching
    /// [`ClaimOutcome`].
    pub async fn try_claim(&self, key: &str) -> Result<ClaimOutcome, GateError> {
        let storage_key = Self::storage_key(key);
        let mut conn = self.conn.clone();

        // SET NX returns OK when this worker won, nil when the key exists.
        let won: Option<String> = redis::cmd("SET")
            .arg(&storage_key)
            .arg(PROCESSING)
            .arg("NX")
            .arg("EX")
            .arg(self.processing_ttl.as_secs())
            .query_async(&mut conn)
            .await?;

        if won.is_some() {
            debug!(idempotency_key = %key, "Claimed idempotency key");
            return Ok(ClaimOutcome::Claimed);
        }

        let current: Option<String> = redis::cmd("GET")
            .arg(&storage_key)
            .query_async(&mut conn)
            .await?;
        Ok(outcome_for_value(current))
    }

    /// Marks the key as completed with the longer TTL.
    ///
    /// Called only after the database transaction has committed; the set is
    /// unconditional.
    pub async fn mark_completed(&self, key: &str) -> Result<(), GateError> {
        let storage_key = Self::storage_key(key);
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(&storage_key)
            .arg(PROCESSED)
            .arg("EX")
            .arg(self.processed_ttl.as_secs())
            .query_async(&mut conn)
            .await?;
        debug!(idempotency_key = %key, "Marked idempotency key completed");
        Ok(())
    }

    /// Removes the key.
    ///
    /// The pipeline itself never releases a claim on failure; the claim
    /// expires through its TTL and the unique index on the orders table
    /// absorbs any duplicate that slips through. This operation exists for
    /// operational repair.
    pub async fn release(&self, key: &str) -> Result<(), GateError> {
        let storage_key = Self::storage_key(key);
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL")
            .arg(&storage_key)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

/// Maps the value found behind a refused claim to an outcome.
fn outcome_for_value(value: Option<String>) -> ClaimOutcome {
    match value.as_deref() {
        Some(PROCESSING) => ClaimOutcome::AlreadyProcessing,
        Some(PROCESSED) => ClaimOutcome::AlreadyProcessed,
        _ => ClaimOutcome::Unknown(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_key_prefix() {
        assert_eq!(
            IdempotencyGate::storage_key("K1"),
            "idempotency:order:K1".to_string()
        );
    }

    #[test]
    fn test_outcome_mapping() {
        assert_eq!(
            outcome_for_value(Some(PROCESSING.to_string())),
            ClaimOutcome::AlreadyProcessing
        );
        assert_eq!(
            outcome_for_value(Some(PROCESSED.to_string())),
            ClaimOutcome::AlreadyProcessed
        );
        // Corrupted value is surfaced, not retried.
        assert_eq!(
            outcome_for_value(Some("GARBAGE".to_string())),
            ClaimOutcome::Unknown(Some("GARBAGE".to_string()))
        );
        // Key expired between the refused set and the read.
        assert_eq!(outcome_for_value(None), ClaimOutcome::Unknown(None));
    }
}
