//! # Data Repository Layer
//!
//! This module provides repository traits and PostgreSQL implementations
//! for the order aggregate: the orders table and its owned order_items.
//! Each repository supports transactional operations for integration with
//! the service layer; writes for one record always share one transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Pool, PoolError};
use model::{Order, OrderItem, OrderStatus};
use thiserror::Error;
use tokio_postgres::Transaction;
use tokio_postgres::error::SqlState;
use tokio_postgres::row::Row;
use uuid::Uuid;

/// # RepositoryError
///
/// Error types that can occur during repository operations.
///
/// `DuplicateKey` and `VersionConflict` carry domain meaning: the first is
/// the unique-index backstop against concurrent processing of one
/// idempotency key, the second signals a lost optimistic-concurrency race.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The idempotency key already exists in the store (unique-index violation).
    #[error("Duplicate idempotency key: {0}")]
    DuplicateKey(String),
    /// An optimistic update matched no row at the expected version.
    #[error("Version conflict updating order {0}")]
    VersionConflict(Uuid),
    /// A row holds a value the model cannot represent.
    #[error("Corrupt row: {0}")]
    Corrupt(String),
    /// Database-related errors, wrapping the underlying PostgreSQL error
    #[error("Database error: {0}")]
    Db(#[from] tokio_postgres::Error),
    /// Failed to obtain a connection from the pool.
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),
    /// No result found.
    #[error("Not found")]
    NotFound,
}

fn map_write_error(e: tokio_postgres::Error, key: &str) -> RepositoryError {
    if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        RepositoryError::DuplicateKey(key.to_string())
    } else {
        RepositoryError::Db(e)
    }
}

/// # OrdersRepository
///
/// Repository interface for the orders table.
///
/// Orders are the main aggregates of the ingestion pipeline; their item
/// lines live in a separate table managed by [`OrderItemsRepository`].
/// Reads return the bare row with an empty item list, to be composed by
/// the caller.
#[async_trait]
pub trait OrdersRepository: Send + Sync {
    /// Insert an order row in a transaction.
    ///
    /// Fails with [`RepositoryError::DuplicateKey`] if the idempotency key
    /// is already present.
    async fn insert_tx(&self, tx: &Transaction<'_>, order: &Order) -> Result<(), RepositoryError>;

    /// Update status and failure reason of an order row in a transaction,
    /// guarded by the optimistic version counter.
    async fn update_status_tx(
        &self,
        tx: &Transaction<'_>,
        order: &Order,
    ) -> Result<(), RepositoryError>;

    /// Look up an order by its caller-supplied idempotency key.
    async fn get_by_idempotency_key(&self, key: &str) -> Result<Option<Order>, RepositoryError>;
}

/// PostgreSQL implementation of the OrdersRepository trait.
pub struct PgOrdersRepository {
    /// Connection pool for non-transactional reads
    pool: Pool,
}

impl PgOrdersRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

fn order_from_row(row: &Row) -> Result<Order, RepositoryError> {
    let status_text: String = row.get("status");
    let status = OrderStatus::parse(&status_text)
        .ok_or_else(|| RepositoryError::Corrupt(format!("unknown order status {status_text}")))?;
    let created_at: DateTime<Utc> = row.get("created_at");
    let updated_at: DateTime<Utc> = row.get("updated_at");
    Ok(Order {
        id: row.get("id"),
        idempotency_key: row.get("idempotency_key"),
        status,
        total: row.get("total"),
        items: Vec::new(), // To be filled by the caller
        failure_reason: row.get("failure_reason"),
        created_at,
        updated_at,
        version: row.get("version"),
    })
}

#[async_trait]
impl OrdersRepository for PgOrdersRepository {
    async fn insert_tx(&self, tx: &Transaction<'_>, order: &Order) -> Result<(), RepositoryError> {
        let query = r#"
            INSERT INTO orders (id, idempotency_key, status, total, failure_reason, version)
            VALUES ($1, $2, $3, $4, $5, $6)
        "#;
        tx.execute(
            query,
            &[
                &order.id,
                &order.idempotency_key,
                &order.status.as_str(),
                &order.total,
                &order.failure_reason,
                &order.version,
            ],
        )
        .await
        .map_err(|e| map_write_error(e, &order.idempotency_key))?;
        Ok(())
    }

    async fn update_status_tx(
        &self,
        tx: &Transaction<'_>,
        order: &Order,
    ) -> Result<(), RepositoryError> {
        let query = r#"
            UPDATE orders
            SET status = $1, failure_reason = $2, updated_at = now(), version = version + 1
            WHERE id = $3 AND version = $4
        "#;
        let updated = tx
            .execute(
                query,
                &[
                    &order.status.as_str(),
                    &order.failure_reason,
                    &order.id,
                    &order.version,
                ],
            )
            .await?;
        if updated == 0 {
            return Err(RepositoryError::VersionConflict(order.id));
        }
        Ok(())
    }

    async fn get_by_idempotency_key(&self, key: &str) -> Result<Option<Order>, RepositoryError> {
        let query = r#"
            SELECT id, idempotency_key, status, total, failure_reason,
                   created_at, updated_at, version
            FROM orders WHERE idempotency_key = $1
        "#;
        let client = self.pool.get().await?;
        let row = client.query_opt(query, &[&key]).await?;
        match row {
            Some(row) => Ok(Some(order_from_row(&row)?)),
            None => Ok(None),
        }
    }
}

/// # OrderItemsRepository
///
/// Repository interface for order item lines.
///
/// Items belong to exactly one order; the foreign key cascades on delete,
/// so removing an order removes its items.
#[async_trait]
pub trait OrderItemsRepository: Send + Sync {
    async fn insert_tx(
        &self,
        tx: &Transaction<'_>,
        items: &[OrderItem],
        order_id: Uuid,
    ) -> Result<(), RepositoryError>;

    async fn get_by_order_id(&self, order_id: Uuid) -> Result<Vec<OrderItem>, RepositoryError>;
}

/// PostgreSQL implementation of the OrderItemsRepository trait.
pub struct PgOrderItemsRepository {
    /// Connection pool for non-transactional reads
    pool: Pool,
}

impl PgOrderItemsRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderItemsRepository for PgOrderItemsRepository {
    async fn insert_tx(
        &self,
        tx: &Transaction<'_>,
        items: &[OrderItem],
        order_id: Uuid,
    ) -> Result<(), RepositoryError> {
        let query = r#"
            INSERT INTO order_items (id, order_id, product_id, quantity, price)
            VALUES ($1, $2, $3, $4, $5)
        "#;
        for it in items {
            tx.execute(
                query,
                &[&it.id, &order_id, &it.product_id, &it.quantity, &it.price],
            )
            .await?;
        }
        Ok(())
    }

    async fn get_by_order_id(&self, order_id: Uuid) -> Result<Vec<OrderItem>, RepositoryError> {
        let query = r#"
            SELECT id, product_id, quantity, price
            FROM order_items WHERE order_id = $1
        "#;
        let client = self.pool.get().await?;
        let rows = client.query(query, &[&order_id]).await?;
        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            items.push(OrderItem {
                id: row.get("id"),
                product_id: row.get("product_id"),
                quantity: row.get("quantity"),
                price: row.get("price"),
            });
        }
        Ok(items)
    }
}
