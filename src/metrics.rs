//! Prometheus metrics.
//!
//! Exposed in text format on the reserved `/-/metrics` route.

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub method: String,
    pub status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PolicyLabels {
    pub policy: String,
}

/// Metric families of the proxy.
pub struct GatewayMetrics {
    registry: Registry,
    requests_total: Family<RequestLabels, Counter>,
    policy_denials_total: Family<PolicyLabels, Counter>,
    policy_evaluation_seconds: Family<PolicyLabels, Histogram>,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "authgate_http_requests",
            "HTTP requests handled by the proxy",
            requests_total.clone(),
        );

        let policy_denials_total = Family::<PolicyLabels, Counter>::default();
        registry.register(
            "authgate_policy_denials",
            "Requests denied by policy evaluation",
            policy_denials_total.clone(),
        );

        let policy_evaluation_seconds =
            Family::<PolicyLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.0001, 2.0, 12))
            });
        registry.register(
            "authgate_policy_evaluation_seconds",
            "Policy evaluation duration",
            policy_evaluation_seconds.clone(),
        );

        Self {
            registry,
            requests_total,
            policy_denials_total,
            policy_evaluation_seconds,
        }
    }

    pub fn record_request(&self, method: &str, status: u16) {
        self.requests_total
            .get_or_create(&RequestLabels {
                method: method.to_string(),
                status: status.to_string(),
            })
            .inc();
    }

    pub fn record_denial(&self, policy: &str) {
        self.policy_denials_total
            .get_or_create(&PolicyLabels {
                policy: policy.to_string(),
            })
            .inc();
    }

    pub fn record_evaluation(&self, policy: &str, seconds: f64) {
        self.policy_evaluation_seconds
            .get_or_create(&PolicyLabels {
                policy: policy.to_string(),
            })
            .observe(seconds);
    }

    /// Text exposition of the registry.
    pub fn render(&self) -> String {
        let mut buffer = String::new();
        if encode(&mut buffer, &self.registry).is_err() {
            buffer.clear();
        }
        buffer
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_appear_in_exposition() {
        let metrics = GatewayMetrics::new();
        metrics.record_request("GET", 200);
        metrics.record_request("POST", 403);
        metrics.record_denial("allow");
        metrics.record_evaluation("allow", 0.0005);

        let rendered = metrics.render();
        assert!(rendered.contains("authgate_http_requests"));
        assert!(rendered.contains("method=\"GET\""));
        assert!(rendered.contains("status=\"403\""));
        assert!(rendered.contains("authgate_policy_denials"));
        assert!(rendered.contains("authgate_policy_evaluation_seconds"));
    }
}
