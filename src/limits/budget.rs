//! Per-tenant upstream cost budget.
//!
//! Tracks point cost spent against the platform API in a fixed window so
//! callers can check before issuing an expensive query. Windows reset lazily
//! on the first read after `reset_at`; the sweeper only reclaims memory.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::deadline::expires_after;
use crate::error::Error;
use crate::metrics::Metrics;
use crate::tenant::ShopDomain;

/// Budget state for one tenant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    pub current_cost: i64,
    pub max_cost: i64,
    pub reset_at: Instant,
    low_warned: bool,
}

impl Budget {
    fn fresh(max_cost: i64, window: Duration) -> Self {
        Self {
            current_cost: 0,
            max_cost,
            reset_at: expires_after(Instant::now(), window),
            low_warned: false,
        }
    }

    /// Points left in this window. May be negative after an overrun.
    pub fn remaining(&self) -> i64 {
        self.max_cost - self.current_cost
    }

    /// Time until the window resets
    pub fn reset_after(&self) -> Duration {
        self.reset_at.saturating_duration_since(Instant::now())
    }
}

/// Tracks upstream point cost per tenant
#[derive(Debug)]
pub struct BudgetTracker {
    max_cost: i64,
    window: Duration,
    warn_threshold: i64,
    budgets: DashMap<ShopDomain, Budget>,
    metrics: Option<Arc<Metrics>>,
}

impl BudgetTracker {
    /// Create a tracker with the given per-window point budget
    pub fn new(max_cost: i64, window: Duration) -> Self {
        Self {
            max_cost,
            window,
            warn_threshold: 100,
            budgets: DashMap::new(),
            metrics: None,
        }
    }

    /// Set the remaining-points threshold for low-budget warnings
    pub fn with_warn_threshold(mut self, threshold: i64) -> Self {
        self.warn_threshold = threshold;
        self
    }

    /// Attach a metrics sink
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Current budget for a tenant, resetting it if the window has passed
    pub fn get_budget(&self, tenant: &ShopDomain) -> Budget {
        *self.current(tenant)
    }

    fn current(&self, tenant: &ShopDomain) -> dashmap::mapref::one::RefMut<'_, ShopDomain, Budget> {
        let mut budget = self
            .budgets
            .entry(tenant.clone())
            .or_insert_with(|| Budget::fresh(self.max_cost, self.window));
        if Instant::now() > budget.reset_at {
            *budget = Budget::fresh(self.max_cost, self.window);
        }
        budget
    }

    /// Record points spent. Returns the updated budget.
    pub fn add_cost(&self, tenant: &ShopDomain, cost: i64) -> Budget {
        let mut budget = self.current(tenant);
        budget.current_cost = budget.current_cost.saturating_add(cost);
        self.warn_if_low(tenant, &mut budget);
        debug!(shop = %tenant, cost, remaining = budget.remaining(), "Recorded upstream cost");
        *budget
    }

    /// Whether an operation of the estimated cost fits in the remaining budget
    pub fn can_make_request(&self, tenant: &ShopDomain, estimated_cost: i64) -> bool {
        self.current(tenant).remaining() >= estimated_cost
    }

    /// Points left for a tenant in the current window
    pub fn remaining(&self, tenant: &ShopDomain) -> i64 {
        self.current(tenant).remaining()
    }

    /// Check the budget, failing with [`Error::BudgetExceeded`] if the
    /// operation does not fit.
    pub fn ensure(&self, tenant: &ShopDomain, estimated_cost: i64) -> Result<Budget, Error> {
        let budget = *self.current(tenant);
        if budget.remaining() >= estimated_cost {
            return Ok(budget);
        }

        warn!(
            target: "shopguard::monitor",
            shop = %tenant,
            estimated_cost,
            remaining = budget.remaining(),
            "Upstream budget exhausted"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_budget_rejection();
        }
        Err(Error::BudgetExceeded {
            remaining: budget.remaining(),
            retry_after: budget.reset_after(),
        })
    }

    /// Sync the budget with the platform's reported throttle status.
    ///
    /// The platform is authoritative: after this call `remaining()` equals
    /// `currently_available` and the ceiling equals `maximum`.
    pub fn record_throttle_status(
        &self,
        tenant: &ShopDomain,
        currently_available: i64,
        maximum: i64,
    ) -> Budget {
        let mut budget = self.current(tenant);
        budget.max_cost = maximum;
        budget.current_cost = maximum - currently_available;
        self.warn_if_low(tenant, &mut budget);
        *budget
    }

    fn warn_if_low(&self, tenant: &ShopDomain, budget: &mut Budget) {
        let remaining = budget.remaining();
        if remaining < self.warn_threshold && !budget.low_warned {
            budget.low_warned = true;
            warn!(
                target: "shopguard::monitor",
                shop = %tenant,
                remaining,
                max_cost = budget.max_cost,
                "Upstream budget running low"
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_budget_low();
            }
        }
    }

    /// Drop budgets whose window has passed. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.budgets.len();
        self.budgets.retain(|_, budget| now <= budget.reset_at);
        before.saturating_sub(self.budgets.len())
    }

    /// Number of tenants currently tracked
    pub fn tracked(&self) -> usize {
        self.budgets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn shop() -> ShopDomain {
        ShopDomain::parse("acme.myshopify.com").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_and_reset() {
        let tracker = BudgetTracker::new(1000, Duration::from_secs(60));

        tracker.add_cost(&shop(), 600);
        tracker.add_cost(&shop(), 500);

        assert!(!tracker.can_make_request(&shop(), 1));
        assert_eq!(tracker.remaining(&shop()), -100);

        tokio::time::advance(Duration::from_secs(61)).await;

        assert!(tracker.can_make_request(&shop(), 1));
        assert_eq!(tracker.remaining(&shop()), 1000);
    }

    #[tokio::test]
    async fn test_oversized_window_does_not_overflow() {
        let tracker = BudgetTracker::new(100, Duration::MAX);
        let budget = tracker.add_cost(&shop(), 10);
        assert_eq!(budget.remaining(), 90);
        assert!(budget.reset_after() <= crate::deadline::MAX_TTL);
    }

    #[tokio::test]
    async fn test_exact_fit_is_allowed() {
        let tracker = BudgetTracker::new(100, Duration::from_secs(60));
        tracker.add_cost(&shop(), 60);
        assert!(tracker.can_make_request(&shop(), 40));
        assert!(!tracker.can_make_request(&shop(), 41));
    }

    #[tokio::test]
    async fn test_ensure_reports_budget_exceeded() {
        let metrics = Arc::new(Metrics::new());
        let tracker =
            BudgetTracker::new(50, Duration::from_secs(60)).with_metrics(metrics.clone());
        tracker.add_cost(&shop(), 45);

        assert!(tracker.ensure(&shop(), 5).is_ok());
        let err = tracker.ensure(&shop(), 10).unwrap_err();
        assert!(matches!(err, Error::BudgetExceeded { remaining: 5, .. }));
        assert_eq!(
            metrics
                .budget_rejections_total
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn test_throttle_status_is_authoritative() {
        let tracker = BudgetTracker::new(1000, Duration::from_secs(60));
        tracker.add_cost(&shop(), 10);

        let budget = tracker.record_throttle_status(&shop(), 250, 2000);
        assert_eq!(budget.max_cost, 2000);
        assert_eq!(budget.remaining(), 250);
        assert_eq!(tracker.remaining(&shop()), 250);
    }

    #[tokio::test]
    async fn test_low_budget_warns_once_per_window() {
        let metrics = Arc::new(Metrics::new());
        let tracker = BudgetTracker::new(1000, Duration::from_secs(60))
            .with_warn_threshold(100)
            .with_metrics(metrics.clone());

        tracker.add_cost(&shop(), 950);
        tracker.add_cost(&shop(), 10);
        assert_eq!(
            metrics
                .budget_low_total
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let tracker = BudgetTracker::new(1000, Duration::from_secs(60));
        tracker.add_cost(&shop(), 1);
        assert_eq!(tracker.tracked(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(tracker.purge_expired(), 1);
        assert_eq!(tracker.tracked(), 0);
    }
}
