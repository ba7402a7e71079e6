//! # Prometheus Metrics
//!
//! Operational metrics for the Chally node, scraped at `/metrics` on the
//! metrics listener. All metrics live in a dedicated
//! [`prometheus::Registry`] so they cannot collide with any default
//! global registry consumers.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

/// Holds all Prometheus metric handles for the node.
///
/// Clone-friendly (prometheus handles are internally shared) so it can
/// be passed to request handlers and the settlement worker alike.
#[derive(Clone)]
pub struct ChallyMetrics {
    /// Registry that owns every metric below.
    registry: Registry,
    /// Deposits credited through the webhook path.
    pub deposits_credited_total: IntCounter,
    /// Tokens credited by those deposits.
    pub deposit_tokens_total: IntCounter,
    /// Webhook deliveries accepted (verified, whatever their effect).
    pub webhook_events_total: IntCounter,
    /// Webhook deliveries rejected (bad signature, stale timestamp).
    pub webhook_rejected_total: IntCounter,
    /// Withdrawal requests that refunded anything.
    pub withdrawals_total: IntCounter,
    /// Withdrawals that completed partially.
    pub withdrawals_partial_total: IntCounter,
    /// Tokens refunded out through the processor.
    pub refund_tokens_total: IntCounter,
    /// Challenges settled.
    pub settlements_total: IntCounter,
    /// Tokens forfeited to the platform treasury.
    pub forfeited_tokens_total: IntCounter,
    /// Settlement jobs currently waiting in the durable queue.
    pub settlement_queue_depth: IntGauge,
    /// Latency of wallet-mutating API operations, in seconds.
    pub wallet_op_seconds: Histogram,
}

impl ChallyMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("chally".into()), None)
            .expect("failed to create prometheus registry");

        fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
            let c = IntCounter::new(name, help).expect("metric creation");
            registry.register(Box::new(c.clone())).expect("metric registration");
            c
        }

        let deposits_credited_total = counter(
            &registry,
            "deposits_credited_total",
            "Deposits credited through the webhook path",
        );
        let deposit_tokens_total = counter(
            &registry,
            "deposit_tokens_total",
            "Tokens credited by confirmed deposits",
        );
        let webhook_events_total = counter(
            &registry,
            "webhook_events_total",
            "Webhook deliveries that passed signature verification",
        );
        let webhook_rejected_total = counter(
            &registry,
            "webhook_rejected_total",
            "Webhook deliveries rejected at the signature boundary",
        );
        let withdrawals_total = counter(
            &registry,
            "withdrawals_total",
            "Withdrawal requests that refunded at least one token",
        );
        let withdrawals_partial_total = counter(
            &registry,
            "withdrawals_partial_total",
            "Withdrawals that completed only partially",
        );
        let refund_tokens_total = counter(
            &registry,
            "refund_tokens_total",
            "Tokens refunded out through the payment processor",
        );
        let settlements_total =
            counter(&registry, "settlements_total", "Challenges settled");
        let forfeited_tokens_total = counter(
            &registry,
            "forfeited_tokens_total",
            "Tokens forfeited to the platform treasury",
        );

        let settlement_queue_depth = IntGauge::new(
            "settlement_queue_depth",
            "Settlement jobs waiting in the durable queue",
        )
        .expect("metric creation");
        registry
            .register(Box::new(settlement_queue_depth.clone()))
            .expect("metric registration");

        let wallet_op_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "wallet_op_seconds",
                "Latency of wallet-mutating API operations in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
        )
        .expect("metric creation");
        registry
            .register(Box::new(wallet_op_seconds.clone()))
            .expect("metric registration");

        Self {
            registry,
            deposits_credited_total,
            deposit_tokens_total,
            webhook_events_total,
            webhook_rejected_total,
            withdrawals_total,
            withdrawals_partial_total,
            refund_tokens_total,
            settlements_total,
            forfeited_tokens_total,
            settlement_queue_depth,
            wallet_op_seconds,
        }
    }

    /// Encodes all registered metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer).expect("prometheus output is valid utf-8"))
    }
}

impl Default for ChallyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared metrics handle passed through application state.
pub type SharedMetrics = Arc<ChallyMetrics>;

/// Axum handler rendering `/metrics` in Prometheus text format.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_and_encode() {
        let metrics = ChallyMetrics::new();
        metrics.deposits_credited_total.inc();
        metrics.deposit_tokens_total.inc_by(1000);
        metrics.settlement_queue_depth.set(3);
        metrics.wallet_op_seconds.observe(0.02);

        let text = metrics.encode().expect("encode");
        assert!(text.contains("chally_deposits_credited_total 1"));
        assert!(text.contains("chally_deposit_tokens_total 1000"));
        assert!(text.contains("chally_settlement_queue_depth 3"));
    }

    #[test]
    fn two_instances_do_not_collide() {
        // Each instance owns its registry, so constructing twice is fine
        // (one per test, one per dev server, etc.).
        let _a = ChallyMetrics::new();
        let _b = ChallyMetrics::new();
    }
}
