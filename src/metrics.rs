//! Metrics Collection for Shopguard
//!
//! Counters for every protection decision the middleware makes:
//! - Authentication outcomes, broken down by error code
//! - Rate-limit rejections and fail-open events
//! - Budget rejections and low-budget warnings
//! - Cache hits, misses and (recovered) cache errors
//! - Webhook outcomes
//!
//! One [`Metrics`] instance is created at startup and shared through the
//! application state; rendered in Prometheus text format on `/metrics`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

/// Thread-safe metrics collector
#[derive(Debug, Default)]
pub struct Metrics {
    // === Counters ===
    /// Successful authentications
    pub auth_success_total: AtomicU64,
    /// Requests rejected by a rate limiter
    pub rate_limited_total: AtomicU64,
    /// Requests allowed because the limiter store failed
    pub rate_limit_fail_open_total: AtomicU64,
    /// Upstream calls refused for lack of budget
    pub budget_rejections_total: AtomicU64,
    /// Low-remaining-budget warnings emitted
    pub budget_low_total: AtomicU64,
    pub cache_hits_total: AtomicU64,
    pub cache_misses_total: AtomicU64,
    /// Cache-layer errors absorbed by the fallback path
    pub cache_errors_total: AtomicU64,

    // === Labeled counters ===
    auth_failures_by_code: RwLock<BTreeMap<&'static str, u64>>,
    rate_limited_by_limiter: RwLock<BTreeMap<String, u64>>,
    webhooks_by_outcome: RwLock<BTreeMap<&'static str, u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_auth_success(&self) {
        self.auth_success_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an authentication failure by its public code
    pub fn record_auth_failure(&self, code: &'static str) {
        *self.auth_failures_by_code.write().entry(code).or_insert(0) += 1;
    }

    /// Record a request rejected by the named limiter
    pub fn record_rate_limited(&self, limiter: &str) {
        self.rate_limited_total.fetch_add(1, Ordering::Relaxed);
        *self
            .rate_limited_by_limiter
            .write()
            .entry(limiter.to_string())
            .or_insert(0) += 1;
    }

    pub fn record_fail_open(&self) {
        self.rate_limit_fail_open_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_budget_rejection(&self) {
        self.budget_rejections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_budget_low(&self) {
        self.budget_low_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_error(&self) {
        self.cache_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a webhook outcome (`processed`, `duplicate`, `rejected`, ...)
    pub fn record_webhook(&self, outcome: &'static str) {
        *self.webhooks_by_outcome.write().entry(outcome).or_insert(0) += 1;
    }

    /// Number of auth failures recorded for a code
    pub fn auth_failures(&self, code: &str) -> u64 {
        self.auth_failures_by_code
            .read()
            .get(code)
            .copied()
            .unwrap_or(0)
    }

    /// Number of webhooks recorded for an outcome
    pub fn webhooks(&self, outcome: &str) -> u64 {
        self.webhooks_by_outcome
            .read()
            .get(outcome)
            .copied()
            .unwrap_or(0)
    }

    /// Convert metrics to Prometheus text format
    pub fn to_prometheus_format(&self) -> String {
        let mut output = String::new();

        let counters = [
            ("shopguard_auth_success_total", &self.auth_success_total),
            ("shopguard_rate_limited_total", &self.rate_limited_total),
            (
                "shopguard_rate_limit_fail_open_total",
                &self.rate_limit_fail_open_total,
            ),
            (
                "shopguard_budget_rejections_total",
                &self.budget_rejections_total,
            ),
            ("shopguard_budget_low_total", &self.budget_low_total),
            ("shopguard_cache_hits_total", &self.cache_hits_total),
            ("shopguard_cache_misses_total", &self.cache_misses_total),
            ("shopguard_cache_errors_total", &self.cache_errors_total),
        ];
        for (name, counter) in counters {
            output.push_str(&format!("{name} {}\n", counter.load(Ordering::Relaxed)));
        }

        for (code, count) in self.auth_failures_by_code.read().iter() {
            output.push_str(&format!(
                "shopguard_auth_failures_total{{code=\"{code}\"}} {count}\n"
            ));
        }
        for (limiter, count) in self.rate_limited_by_limiter.read().iter() {
            output.push_str(&format!(
                "shopguard_rate_limited_by_limiter_total{{limiter=\"{limiter}\"}} {count}\n"
            ));
        }
        for (outcome, count) in self.webhooks_by_outcome.read().iter() {
            output.push_str(&format!(
                "shopguard_webhooks_total{{outcome=\"{outcome}\"}} {count}\n"
            ));
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = Metrics::new();

        metrics.record_auth_success();
        metrics.record_auth_failure("SHOP_NOT_FOUND");
        metrics.record_auth_failure("SHOP_NOT_FOUND");
        metrics.record_rate_limited("api");
        metrics.record_webhook("processed");

        assert_eq!(metrics.auth_success_total.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.auth_failures("SHOP_NOT_FOUND"), 2);
        assert_eq!(metrics.auth_failures("AUTH_REQUIRED"), 0);
        assert_eq!(metrics.rate_limited_total.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.webhooks("processed"), 1);
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = Metrics::new();
        metrics.record_cache_hit();
        metrics.record_rate_limited("auth");
        metrics.record_auth_failure("AUTH_REQUIRED");

        let output = metrics.to_prometheus_format();
        assert!(output.contains("shopguard_cache_hits_total 1\n"));
        assert!(output.contains("shopguard_rate_limited_by_limiter_total{limiter=\"auth\"} 1\n"));
        assert!(output.contains("shopguard_auth_failures_total{code=\"AUTH_REQUIRED\"} 1\n"));
    }
}
