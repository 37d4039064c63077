//! Metrics and monitoring using Prometheus.
//!
//! The embedded emulator counts what it does to messages and serves the
//! counters in text format on `/metrics`:
//!
//! - **Counters**: messages published, delivered, acknowledged, nacked,
//!   expired, dead-lettered; push attempts and failures; API requests
//! - **Gauges**: topic and subscription counts

use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;
use tracing::error;

/// Global metrics registry
static METRICS_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Global metrics instance
pub static METRICS: Lazy<Arc<Metrics>> = Lazy::new(|| {
    let metrics = Metrics::new();
    if let Err(e) = metrics.register(&METRICS_REGISTRY) {
        error!("Failed to register metrics: {}", e);
    }
    Arc::new(metrics)
});

/// Metrics collector for the embedded emulator
pub struct Metrics {
    /// Messages accepted by publish, per topic
    pub messages_published_total: IntCounterVec,
    /// Messages handed out, per subscription and mode (pull or push)
    pub messages_delivered_total: IntCounterVec,
    /// Messages acknowledged, per subscription
    pub messages_acked_total: IntCounterVec,
    /// Messages nacked via a zero ack deadline, per subscription
    pub messages_nacked_total: IntCounterVec,
    /// Outstanding messages whose ack deadline expired, per subscription
    pub ack_deadlines_expired_total: IntCounterVec,
    /// Messages forwarded to a dead-letter topic, per subscription
    pub messages_dead_lettered_total: IntCounterVec,
    /// Push delivery attempts, per subscription and outcome
    pub push_attempts_total: IntCounterVec,
    /// REST requests, per operation and status
    pub api_requests_total: IntCounterVec,
    /// Current number of topics
    pub topic_count: IntGauge,
    /// Current number of subscriptions
    pub subscription_count: IntGauge,
}

/// Build a counter vector; metric names and labels here are static and valid.
fn counter(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    match IntCounterVec::new(Opts::new(name, help), labels) {
        Ok(c) => c,
        Err(e) => unreachable!("invalid metric definition {}: {}", name, e),
    }
}

fn gauge(name: &str, help: &str) -> IntGauge {
    match IntGauge::new(name, help) {
        Ok(g) => g,
        Err(e) => unreachable!("invalid metric definition {}: {}", name, e),
    }
}

impl Metrics {
    /// Create a new Metrics instance
    pub fn new() -> Self {
        Self {
            messages_published_total: counter(
                "pubsub_testkit_messages_published_total",
                "Messages accepted by publish",
                &["topic"],
            ),
            messages_delivered_total: counter(
                "pubsub_testkit_messages_delivered_total",
                "Messages delivered to subscribers",
                &["subscription", "mode"],
            ),
            messages_acked_total: counter(
                "pubsub_testkit_messages_acked_total",
                "Messages acknowledged",
                &["subscription"],
            ),
            messages_nacked_total: counter(
                "pubsub_testkit_messages_nacked_total",
                "Messages nacked",
                &["subscription"],
            ),
            ack_deadlines_expired_total: counter(
                "pubsub_testkit_ack_deadlines_expired_total",
                "Outstanding messages whose ack deadline expired",
                &["subscription"],
            ),
            messages_dead_lettered_total: counter(
                "pubsub_testkit_messages_dead_lettered_total",
                "Messages forwarded to a dead-letter topic",
                &["subscription"],
            ),
            push_attempts_total: counter(
                "pubsub_testkit_push_attempts_total",
                "Push delivery attempts",
                &["subscription", "outcome"],
            ),
            api_requests_total: counter(
                "pubsub_testkit_api_requests_total",
                "REST API requests",
                &["operation", "status"],
            ),
            topic_count: gauge("pubsub_testkit_topic_count", "Current number of topics"),
            subscription_count: gauge(
                "pubsub_testkit_subscription_count",
                "Current number of subscriptions",
            ),
        }
    }

    /// Register all metrics with the registry
    fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.messages_published_total.clone()))?;
        registry.register(Box::new(self.messages_delivered_total.clone()))?;
        registry.register(Box::new(self.messages_acked_total.clone()))?;
        registry.register(Box::new(self.messages_nacked_total.clone()))?;
        registry.register(Box::new(self.ack_deadlines_expired_total.clone()))?;
        registry.register(Box::new(self.messages_dead_lettered_total.clone()))?;
        registry.register(Box::new(self.push_attempts_total.clone()))?;
        registry.register(Box::new(self.api_requests_total.clone()))?;
        registry.register(Box::new(self.topic_count.clone()))?;
        registry.register(Box::new(self.subscription_count.clone()))?;
        Ok(())
    }

    /// Gather metrics in Prometheus text format
    pub fn gather(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = METRICS_REGISTRY.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Get the global metrics instance
pub fn get_metrics() -> &'static Arc<Metrics> {
    &METRICS
}

/// Count a REST request.
pub fn record_api_request(operation: &str, status: u16) {
    let status = status.to_string();
    METRICS
        .api_requests_total
        .with_label_values(&[operation, status.as_str()])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_gather_contains_counters() {
        get_metrics()
            .messages_published_total
            .with_label_values(&["projects/metrics-test/topics/t1"])
            .inc();
        record_api_request("publish", 200);

        let output = get_metrics().gather().unwrap();
        assert!(output.contains("pubsub_testkit_messages_published_total"));
        assert!(output.contains("pubsub_testkit_api_requests_total"));
    }
}
