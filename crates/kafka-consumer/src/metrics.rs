//! Prometheus counters for the ingestion pipeline.

use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

/// PipelineMetrics collects counters for both consumers.
///
/// Registered into the shared registry exposed by the ops HTTP server.
pub struct PipelineMetrics {
    /// Orders persisted as PROCESSED.
    pub orders_processed: IntCounter,
    /// Records skipped at the gate, labelled by the claim outcome.
    pub orders_skipped: IntCounterVec,
    /// Processor invocations repeated after a transient failure.
    pub processing_retries: IntCounter,
    /// Records routed to the dead-letter topic, labelled by error class.
    pub orders_dead_lettered: IntCounterVec,
    /// Dead-letter records reconciled, labelled by repair outcome.
    pub dlt_reconciled: IntCounterVec,
    /// Reconciliation attempts that themselves failed (logged and dropped).
    pub dlt_reconcile_failures: IntCounter,
}

impl PipelineMetrics {
    pub fn new(registry: &Registry) -> Self {
        let orders_processed = IntCounter::with_opts(Opts::new(
            "orders_processed_total",
            "Orders persisted as PROCESSED",
        ))
        .expect("Failed to create orders_processed_total metric");

        let orders_skipped = IntCounterVec::new(
            Opts::new(
                "orders_skipped_total",
                "Records skipped at the idempotency gate",
            ),
            &["reason"],
        )
        .expect("Failed to create orders_skipped_total metric");

        let processing_retries = IntCounter::with_opts(Opts::new(
            "processing_retries_total",
            "Processor invocations repeated after a transient failure",
        ))
        .expect("Failed to create processing_retries_total metric");

        let orders_dead_lettered = IntCounterVec::new(
            Opts::new(
                "orders_dead_lettered_total",
                "Records routed to the dead-letter topic",
            ),
            &["error_class"],
        )
        .expect("Failed to create orders_dead_lettered_total metric");

        let dlt_reconciled = IntCounterVec::new(
            Opts::new(
                "dlt_reconciled_total",
                "Dead-letter records reconciled against the store",
            ),
            &["outcome"],
        )
        .expect("Failed to create dlt_reconciled_total metric");

        let dlt_reconcile_failures = IntCounter::with_opts(Opts::new(
            "dlt_reconcile_failures_total",
            "Dead-letter reconciliation attempts that failed",
        ))
        .expect("Failed to create dlt_reconcile_failures_total metric");

        registry
            .register(Box::new(orders_processed.clone()))
            .expect("Failed to register orders_processed_total metric");
        registry
            .register(Box::new(orders_skipped.clone()))
            .expect("Failed to register orders_skipped_total metric");
        registry
            .register(Box::new(processing_retries.clone()))
            .expect("Failed to register processing_retries_total metric");
        registry
            .register(Box::new(orders_dead_lettered.clone()))
            .expect("Failed to register orders_dead_lettered_total metric");
        registry
            .register(Box::new(dlt_reconciled.clone()))
            .expect("Failed to register dlt_reconciled_total metric");
        registry
            .register(Box::new(dlt_reconcile_failures.clone()))
            .expect("Failed to register dlt_reconcile_failures_total metric");

        Self {
            orders_processed,
            orders_skipped,
            processing_retries,
            orders_dead_lettered,
            dlt_reconciled,
            dlt_reconcile_failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_once() {
        let registry = Registry::new();
        let metrics = PipelineMetrics::new(&registry);
        metrics.orders_processed.inc();
        metrics.orders_skipped.with_label_values(&["duplicate"]).inc();
        assert!(!registry.gather().is_empty());
    }
}
