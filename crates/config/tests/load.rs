use app_config::AppConfig;
use std::time::Duration;

#[test]
fn test_load_default_config() {
    let cfg = AppConfig::load().unwrap();
    assert_eq!(cfg.orders_received_topic, "orders.received");
    assert_eq!(cfg.orders_dlt_topic, "orders.dlt");
    assert_eq!(cfg.orders_processed_topic, "orders.processed");
    assert_eq!(cfg.dlt_group_id(), "order-pipeline-dlt");
    assert_eq!(cfg.retry_max_attempts, 3);
    assert_eq!(cfg.retry_initial_interval, Duration::from_secs(1));
    assert_eq!(cfg.retry_max_interval, Duration::from_secs(5));
    assert_eq!(cfg.idempotency_processing_ttl, Duration::from_secs(3600));
    assert_eq!(cfg.idempotency_processed_ttl, Duration::from_secs(86400));
}
