//! Business logic layer for the order ingestion pipeline.
//!
//! This module defines the [`OrderProcessor`] trait and its async
//! implementation [`OrderProcessorImpl`], plus the [`FailureRecorder`] used
//! by the dead-letter reconciler. The processor walks the order state
//! machine, computes the total with fixed-point arithmetic, persists the
//! aggregate in a single transaction, and publishes the completion event
//! strictly after the commit.
//!
//! # Features
//! - Atomic saving of an order and its items in one transaction.
//! - Validation of the inbound request before any persistence.
//! - Deferred completion publication: emit only if the commit succeeded.
//! - Dependency injection for testability and loose coupling.
//! - Well-typed error handling via [`ProcessError`], split along the
//!   retryable / non-retryable boundary the consumer relies on.

use async_trait::async_trait;
use chrono::{Local, Utc};
use deadpool_postgres::{Pool, PoolError};
use kafka_producer::EventPublisher;
use model::{Order, OrderItem, OrderProcessedEvent, OrderRequest, OrderStatus};
use repository::{OrderItemsRepository, OrdersRepository, RepositoryError};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// Lowest accepted unit price on an inbound item.
const MIN_ITEM_PRICE: Decimal = dec!(0.01);

/// The main error type for order processing.
///
/// The variants encode the retry decision: validation and duplicate-key
/// failures are permanent, everything else is assumed to be transient
/// infrastructure trouble and counts against the delivery retry budget.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The request is structurally or semantically invalid.
    #[error("Invalid order request: {0}")]
    InvalidRequest(String),
    /// The idempotency key is already persisted. Another instance raced us
    /// between the gate claim and the save.
    #[error("Duplicate idempotency key: {0}")]
    DuplicateKey(String),
    /// Connectivity or other recoverable infrastructure failure.
    #[error("Transient infrastructure error: {0}")]
    Transient(String),
}

impl ProcessError {
    /// Whether another delivery attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProcessError::Transient(_))
    }

    /// Stable error-kind name, used for dead-letter diagnostic headers.
    pub fn kind(&self) -> &'static str {
        match self {
            ProcessError::InvalidRequest(_) => "InvalidRequest",
            ProcessError::DuplicateKey(_) => "DuplicateKey",
            ProcessError::Transient(_) => "Transient",
        }
    }
}

impl From<RepositoryError> for ProcessError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::DuplicateKey(key) => ProcessError::DuplicateKey(key),
            other => ProcessError::Transient(other.to_string()),
        }
    }
}

impl From<PoolError> for ProcessError {
    fn from(e: PoolError) -> Self {
        ProcessError::Transient(format!("Pool error: {e}"))
    }
}

/// Trait describing the exactly-once processing of one order request.
///
/// Implementations guarantee that a successful return means the PROCESSED
/// row is durably committed and exactly one completion event has been
/// handed to the publisher.
#[async_trait]
pub trait OrderProcessor: Send + Sync {
    /// Processes a validated order request under the given idempotency key.
    ///
    /// # Errors
    /// Returns [`ProcessError::InvalidRequest`] if validation fails,
    /// [`ProcessError::DuplicateKey`] if the key is already persisted, or
    /// [`ProcessError::Transient`] for recoverable infrastructure failures.
    /// On any error the transaction is rolled back and no row is persisted.
    async fn process(
        &self,
        request: &OrderRequest,
        idempotency_key: &str,
    ) -> Result<Order, ProcessError>;
}

/// Async implementation of [`OrderProcessor`] using the repository pattern.
pub struct OrderProcessorImpl<R1, R2, P> {
    db_pool: Pool,
    orders_repo: R1,
    items_repo: R2,
    publisher: Arc<P>,
}

impl<R1, R2, P> OrderProcessorImpl<R1, R2, P>
where
    R1: OrdersRepository + Send + Sync,
    R2: OrderItemsRepository + Send + Sync,
    P: EventPublisher + Send + Sync,
{
    /// Constructs a new [`OrderProcessorImpl`] from the provided dependencies.
    ///
    /// # Arguments
    /// * `db_pool` - The Postgres connection pool to use for transactions.
    /// * `orders_repo` - The repository for order rows.
    /// * `items_repo` - The repository for order item lines.
    /// * `publisher` - The sink for post-commit completion events.
    pub fn new(db_pool: Pool, orders_repo: R1, items_repo: R2, publisher: Arc<P>) -> Self {
        Self {
            db_pool,
            orders_repo,
            items_repo,
            publisher,
        }
    }
}

#[async_trait]
impl<R1, R2, P> OrderProcessor for OrderProcessorImpl<R1, R2, P>
where
    R1: OrdersRepository + Send + Sync,
    R2: OrderItemsRepository + Send + Sync,
    P: EventPublisher + Send + Sync,
{
    /// Runs the full processing pipeline for one request.
    ///
    /// The in-memory status walks RECEIVED -> PROCESSING -> PROCESSED; only
    /// the final state reaches the store. The completion event is published
    /// after the commit; a publish failure is logged and does not fail the
    /// call, the database being the state of record.
    #[instrument(skip(self, request), fields(idempotency_key = %idempotency_key))]
    async fn process(
        &self,
        request: &OrderRequest,
        idempotency_key: &str,
    ) -> Result<Order, ProcessError> {
        validate_request(request)?;

        let mut order = build_received_order(request, idempotency_key);

        order.status = OrderStatus::Processing;
        order.total = order_total(&order.items);
        order.status = OrderStatus::Processed;

        let mut client = self.db_pool.get().await.map_err(ProcessError::from)?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| ProcessError::Transient(format!("Begin transaction failed: {e}")))?;

        self.orders_repo.insert_tx(&tx, &order).await?;
        self.items_repo
            .insert_tx(&tx, &order.items, order.id)
            .await?;

        tx.commit()
            .await
            .map_err(|e| ProcessError::Transient(format!("Commit failed: {e}")))?;

        info!(order_id = %order.id, total = %order.total, "Order persisted as PROCESSED");

        // The transaction is durable at this point; the event must not be
        // able to precede it, and losing it must not undo it.
        let event = OrderProcessedEvent::for_order(&order, Local::now().naive_local());
        if let Err(e) = self.publisher.publish_completion(&event).await {
            error!(
                order_id = %order.id,
                error = %e,
                "Completion event lost after commit; order remains PROCESSED"
            );
        }

        Ok(order)
    }
}

/// Validates the structure and required fields of the inbound request.
fn validate_request(request: &OrderRequest) -> Result<(), ProcessError> {
    if request.items.is_empty() {
        return Err(ProcessError::InvalidRequest("order has no items".into()));
    }
    for (idx, item) in request.items.iter().enumerate() {
        if item.product_id.trim().is_empty() {
            return Err(ProcessError::InvalidRequest(format!(
                "item {idx} has a blank productId"
            )));
        }
        if item.quantity < 1 {
            return Err(ProcessError::InvalidRequest(format!(
                "item {idx} has quantity {} (must be at least 1)",
                item.quantity
            )));
        }
        if item.price < MIN_ITEM_PRICE {
            return Err(ProcessError::InvalidRequest(format!(
                "item {idx} has price {} (must be at least {MIN_ITEM_PRICE})",
                item.price
            )));
        }
    }
    Ok(())
}

/// Maps the request to a fresh in-memory order in RECEIVED state.
fn build_received_order(request: &OrderRequest, idempotency_key: &str) -> Order {
    let now = Utc::now();
    Order {
        id: Uuid::new_v4(),
        idempotency_key: idempotency_key.to_string(),
        status: OrderStatus::Received,
        total: Decimal::ZERO,
        items: request
            .items
            .iter()
            .map(|it| OrderItem {
                id: Uuid::new_v4(),
                product_id: it.product_id.clone(),
                quantity: it.quantity,
                price: it.price,
            })
            .collect(),
        failure_reason: None,
        created_at: now,
        updated_at: now,
        version: 0,
    }
}

/// Sums price * quantity over the items with fixed-point arithmetic.
///
/// Each per-item product is rounded half-up to scale 2 before summing.
fn order_total(items: &[OrderItem]) -> Decimal {
    items
        .iter()
        .map(|it| {
            (it.price * Decimal::from(it.quantity))
                .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
        })
        .sum()
}

/// What the reconciler did for a dead-lettered record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// A non-terminal row existed and was marked FAILED.
    MarkedFailed,
    /// No row existed; a FAILED row was created from the decoded payload.
    CreatedFailed,
    /// The row already reached a terminal state; left untouched.
    AlreadyTerminal,
    /// No row existed and the payload was undecodable; nothing to repair.
    NothingToRepair,
}

/// Trait describing the dead-letter repair operation: reconcile database
/// state with a permanently failed record.
#[async_trait]
pub trait FailureRecorder: Send + Sync {
    /// Records the permanent failure of the given idempotency key.
    ///
    /// `request` carries the decoded payload when deserialization succeeded.
    async fn record_failure(
        &self,
        idempotency_key: &str,
        reason: &str,
        request: Option<&OrderRequest>,
    ) -> Result<FailureOutcome, ProcessError>;
}

/// Async implementation of [`FailureRecorder`] over the order repositories.
pub struct FailureRecorderImpl<R1, R2> {
    db_pool: Pool,
    orders_repo: R1,
    items_repo: R2,
}

impl<R1, R2> FailureRecorderImpl<R1, R2>
where
    R1: OrdersRepository + Send + Sync,
    R2: OrderItemsRepository + Send + Sync,
{
    pub fn new(db_pool: Pool, orders_repo: R1, items_repo: R2) -> Self {
        Self {
            db_pool,
            orders_repo,
            items_repo,
        }
    }
}

#[async_trait]
impl<R1, R2> FailureRecorder for FailureRecorderImpl<R1, R2>
where
    R1: OrdersRepository + Send + Sync,
    R2: OrderItemsRepository + Send + Sync,
{
    /// Marks the corresponding order row as permanently failed, creating it
    /// if the original processing never persisted one.
    ///
    /// Terminal rows are never mutated.
    #[instrument(skip(self, request), fields(idempotency_key = %idempotency_key))]
    async fn record_failure(
        &self,
        idempotency_key: &str,
        reason: &str,
        request: Option<&OrderRequest>,
    ) -> Result<FailureOutcome, ProcessError> {
        match self
            .orders_repo
            .get_by_idempotency_key(idempotency_key)
            .await
            .map_err(ProcessError::from)?
        {
            Some(order) if order.status.is_terminal() => {
                info!(
                    order_id = %order.id,
                    status = order.status.as_str(),
                    "Order already terminal, leaving untouched"
                );
                Ok(FailureOutcome::AlreadyTerminal)
            }
            Some(mut order) => {
                order.status = OrderStatus::Failed;
                order.failure_reason = Some(reason.to_string());

                let mut client = self.db_pool.get().await.map_err(ProcessError::from)?;
                let tx = client.transaction().await.map_err(|e| {
                    ProcessError::Transient(format!("Begin transaction failed: {e}"))
                })?;
                self.orders_repo.update_status_tx(&tx, &order).await?;
                tx.commit()
                    .await
                    .map_err(|e| ProcessError::Transient(format!("Commit failed: {e}")))?;

                info!(order_id = %order.id, "Order marked FAILED");
                Ok(FailureOutcome::MarkedFailed)
            }
            None => match request {
                Some(req) => {
                    let mut order = build_received_order(req, idempotency_key);
                    order.status = OrderStatus::Failed;
                    order.total = Decimal::ZERO;
                    order.failure_reason = Some(reason.to_string());

                    let mut client = self.db_pool.get().await.map_err(ProcessError::from)?;
                    let tx = client.transaction().await.map_err(|e| {
                        ProcessError::Transient(format!("Begin transaction failed: {e}"))
                    })?;
                    self.orders_repo.insert_tx(&tx, &order).await?;
                    self.items_repo
                        .insert_tx(&tx, &order.items, order.id)
                        .await?;
                    tx.commit()
                        .await
                        .map_err(|e| ProcessError::Transient(format!("Commit failed: {e}")))?;

                    info!(order_id = %order.id, "FAILED order created from dead-lettered payload");
                    Ok(FailureOutcome::CreatedFailed)
                }
                None => {
                    info!("No order row and undecodable payload, nothing to repair");
                    Ok(FailureOutcome::NothingToRepair)
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::OrderItemRequest;

    fn item(product_id: &str, quantity: i32, price: Decimal) -> OrderItemRequest {
        OrderItemRequest {
            product_id: product_id.to_string(),
            quantity,
            price,
        }
    }

    #[test]
    fn test_total_sums_price_times_quantity() {
        let request = OrderRequest {
            items: vec![item("P1", 2, dec!(10.00)), item("P2", 1, dec!(5.25))],
        };
        let order = build_received_order(&request, "K1");
        assert_eq!(order_total(&order.items), dec!(25.25));
    }

    #[test]
    fn test_total_rounds_half_up_per_item() {
        // 3 * 0.335 = 1.005, which rounds up to 1.01 at scale 2.
        let request = OrderRequest {
            items: vec![item("P1", 3, dec!(0.335))],
        };
        let order = build_received_order(&request, "K1");
        assert_eq!(order_total(&order.items), dec!(1.01));
    }

    #[test]
    fn test_validate_rejects_empty_items() {
        let err = validate_request(&OrderRequest { items: vec![] }).unwrap_err();
        assert!(matches!(err, ProcessError::InvalidRequest(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_validate_rejects_blank_product_id() {
        let request = OrderRequest {
            items: vec![item("  ", 1, dec!(1.00))],
        };
        assert!(matches!(
            validate_request(&request),
            Err(ProcessError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_quantity_and_free_items() {
        let zero_qty = OrderRequest {
            items: vec![item("P1", 0, dec!(1.00))],
        };
        assert!(validate_request(&zero_qty).is_err());

        let free = OrderRequest {
            items: vec![item("P1", 1, dec!(0.00))],
        };
        assert!(validate_request(&free).is_err());

        let cheapest = OrderRequest {
            items: vec![item("P1", 1, dec!(0.01))],
        };
        assert!(validate_request(&cheapest).is_ok());
    }

    #[test]
    fn test_build_received_order_wires_items() {
        let request = OrderRequest {
            items: vec![item("P1", 2, dec!(10.00))],
        };
        let order = build_received_order(&request, "K1");
        assert_eq!(order.status, OrderStatus::Received);
        assert_eq!(order.idempotency_key, "K1");
        assert_eq!(order.total, Decimal::ZERO);
        assert_eq!(order.version, 0);
        assert_eq!(order.items.len(), 1);
        assert_eq!(order.items[0].product_id, "P1");
    }

    #[test]
    fn test_error_classification() {
        assert!(ProcessError::Transient("timeout".into()).is_retryable());
        assert!(!ProcessError::DuplicateKey("K1".into()).is_retryable());
        assert!(!ProcessError::InvalidRequest("empty".into()).is_retryable());

        assert_eq!(ProcessError::DuplicateKey("K1".into()).kind(), "DuplicateKey");
        assert_eq!(
            ProcessError::from(RepositoryError::DuplicateKey("K1".into())).kind(),
            "DuplicateKey"
        );
        assert_eq!(
            ProcessError::from(RepositoryError::NotFound).kind(),
            "Transient"
        );
    }
}
