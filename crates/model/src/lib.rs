use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// OrderStatus - Lifecycle state of an order.
///
/// The happy path walks RECEIVED -> PROCESSING -> PROCESSED in memory and
/// persists only the final state. FAILED and CANCELLED are terminal states
/// reachable through the dead-letter repair path; no backward transitions
/// are allowed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Received,
    Processing,
    Processed,
    Failed,
    Cancelled,
}

impl OrderStatus {
    /// Storage representation, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Received => "RECEIVED",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Processed => "PROCESSED",
            OrderStatus::Failed => "FAILED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }

    /// Parses the storage representation back into a status.
    pub fn parse(s: &str) -> Option<OrderStatus> {
        match s {
            "RECEIVED" => Some(OrderStatus::Received),
            "PROCESSING" => Some(OrderStatus::Processing),
            "PROCESSED" => Some(OrderStatus::Processed),
            "FAILED" => Some(OrderStatus::Failed),
            "CANCELLED" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal states admit no further transitions from the ingest or
    /// dead-letter paths.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Processed | OrderStatus::Failed | OrderStatus::Cancelled
        )
    }
}

/// OrderItem - Individual order line.
///
/// Items are owned by their order as plain values; the owning order id is
/// reattached at the persistence boundary through the foreign-key column.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderItem {
    /// Server-minted identifier, assigned on first persistence
    pub id: Uuid,
    /// External product reference
    #[serde(rename = "productId")]
    pub product_id: String,
    /// Ordered quantity, at least 1
    pub quantity: i32,
    /// Unit price, fixed-point with scale 2
    pub price: Decimal,
}

/// Order - Main aggregate of the ingestion pipeline.
///
/// Holds the caller-supplied idempotency key (unique in the store), the
/// computed total, and the owned item lines. `version` backs optimistic
/// concurrency on updates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    /// Server-minted identifier, assigned on first persistence
    pub id: Uuid,
    /// Caller-supplied key, globally unique
    #[serde(rename = "idempotencyKey")]
    pub idempotency_key: String,
    /// Current lifecycle state
    pub status: OrderStatus,
    /// Sum of price * quantity over the items, scale 2
    pub total: Decimal,
    /// Owned item lines; at least one for any non-FAILED order
    pub items: Vec<OrderItem>,
    /// Populated only for FAILED and CANCELLED orders
    #[serde(rename = "failureReason", skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Insert timestamp, maintained by the store
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    /// Last-update timestamp, maintained by the store
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency counter, incremented on every update
    pub version: i32,
}

/// OrderItemRequest - One line of an inbound order request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderItemRequest {
    #[serde(rename = "productId")]
    pub product_id: String,
    pub quantity: i32,
    pub price: Decimal,
}

/// OrderRequest - Inbound JSON payload consumed from the primary topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderRequest {
    pub items: Vec<OrderItemRequest>,
}

/// OrderProcessedEvent - Completion notification for the outbound topic.
///
/// Published strictly after the database transaction has committed, keyed
/// by the order id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderProcessedEvent {
    #[serde(rename = "orderId")]
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub total: Decimal,
    /// Local date-time of the PROCESSED transition, ISO-8601 without offset
    #[serde(rename = "processedAt")]
    pub processed_at: NaiveDateTime,
    pub items: Vec<OrderItemRequest>,
}

impl OrderProcessedEvent {
    /// Builds the completion event for a persisted order.
    pub fn for_order(order: &Order, processed_at: NaiveDateTime) -> Self {
        Self {
            order_id: order.id,
            status: order.status,
            total: order.total,
            processed_at,
            items: order
                .items
                .iter()
                .map(|it| OrderItemRequest {
                    product_id: it.product_id.clone(),
                    quantity: it.quantity,
                    price: it.price,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_deserialize_order_request_from_json() {
        let json = r#"
        {
           "items": [
              { "productId": "P1", "quantity": 2, "price": 10.00 },
              { "productId": "P2", "quantity": 1, "price": 5.25 }
           ]
        }
        "#;
        let request: OrderRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.items.len(), 2);
        assert_eq!(request.items[0].product_id, "P1");
        assert_eq!(request.items[0].quantity, 2);
        assert_eq!(request.items[0].price, dec!(10.00));
        assert_eq!(request.items[1].price, dec!(5.25));
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            OrderStatus::Received,
            OrderStatus::Processing,
            OrderStatus::Processed,
            OrderStatus::Failed,
            OrderStatus::Cancelled,
        ] {
            assert_eq!(OrderStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OrderStatus::parse("SHIPPED"), None);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!OrderStatus::Received.is_terminal());
        assert!(!OrderStatus::Processing.is_terminal());
        assert!(OrderStatus::Processed.is_terminal());
        assert!(OrderStatus::Failed.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_completion_event_shape() {
        let order = Order {
            id: Uuid::new_v4(),
            idempotency_key: "K1".to_string(),
            status: OrderStatus::Processed,
            total: dec!(25.25),
            items: vec![OrderItem {
                id: Uuid::new_v4(),
                product_id: "P1".to_string(),
                quantity: 2,
                price: dec!(10.00),
            }],
            failure_reason: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            version: 1,
        };

        let processed_at = chrono::NaiveDate::from_ymd_opt(2025, 6, 1)
            .unwrap()
            .and_hms_opt(12, 30, 0)
            .unwrap();
        let event = OrderProcessedEvent::for_order(&order, processed_at);
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["orderId"], order.id.to_string());
        assert_eq!(json["status"], "PROCESSED");
        assert_eq!(json["processedAt"], "2025-06-01T12:30:00");
        assert_eq!(json["items"][0]["productId"], "P1");
        assert_eq!(json["items"][0]["quantity"], 2);
    }
}
