//! Property-based tests for shopguard invariants.
//!
//! Covers shop domain normalisation, glob key matching, retry backoff
//! bounds and fixed-window counting.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use shopguard::cache::keys;
use shopguard::cache::GlobPattern;
use shopguard::limits::{CallerInfo, MemoryRateLimitStore, RateLimitSubject, RateLimiter};
use shopguard::retry::RetryPolicy;
use shopguard::tenant::ShopDomain;

// ============================================================================
// STRATEGIES
// ============================================================================

/// Valid shop names: alphanumeric first char, then alphanumerics and dashes
fn arb_shop_name() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9][a-zA-Z0-9-]{0,30}"
}

/// Key fragments free of glob metacharacters
fn arb_literal() -> impl Strategy<Value = String> {
    "[a-z0-9.:_/-]{1,24}"
}

proptest! {
    #[test]
    fn prop_shop_domain_normalises(name in arb_shop_name()) {
        let raw = format!("  {name}.MyShopify.com ");
        let parsed = ShopDomain::parse(&raw).unwrap();
        prop_assert_eq!(parsed.as_str(), format!("{}.myshopify.com", name.to_ascii_lowercase()));
        // Parsing is idempotent
        prop_assert_eq!(ShopDomain::parse(parsed.as_str()).unwrap(), parsed);
    }

    #[test]
    fn prop_shop_domain_rejects_foreign_suffix(name in arb_shop_name(), tld in "[a-z]{2,6}") {
        let raw = format!("{name}.myshopify.com.{tld}");
        prop_assert!(ShopDomain::parse(&raw).is_err());
    }

    #[test]
    fn prop_literal_pattern_matches_only_itself(key in arb_literal(), other in arb_literal()) {
        let pattern = GlobPattern::new(&key).unwrap();
        prop_assert!(pattern.matches(&key));
        prop_assert_eq!(pattern.matches(&other), key == other);
    }

    #[test]
    fn prop_prefix_pattern(prefix in arb_literal(), rest in arb_literal()) {
        let pattern = GlobPattern::new(&format!("{prefix}*")).unwrap();
        let key = format!("{}{}", prefix, rest);
        prop_assert!(pattern.matches(&key));
        prop_assert!(pattern.matches(&prefix));
    }

    #[test]
    fn prop_tenant_patterns_are_isolated(a in arb_shop_name(), b in arb_shop_name(), rest in arb_literal()) {
        let shop_a = ShopDomain::parse(&format!("{a}.myshopify.com")).unwrap();
        let shop_b = ShopDomain::parse(&format!("{b}.myshopify.com")).unwrap();
        prop_assume!(shop_a != shop_b);

        let pattern = GlobPattern::new(&keys::products_pattern(&shop_a)).unwrap();
        prop_assert!(pattern.matches(&keys::products(&shop_a, &rest)));
        prop_assert!(!pattern.matches(&keys::products(&shop_b, &rest)));
    }

    #[test]
    fn prop_retry_delay_bounded(retry in 0u32..64, base_ms in 1u64..5_000) {
        let policy = RetryPolicy::new(5, Duration::from_millis(base_ms));
        let delay = policy.delay(retry);
        prop_assert!(delay <= Duration::from_secs(30));

        let without = RetryPolicy::new(5, Duration::from_millis(base_ms)).without_jitter();
        let expected = base_ms.saturating_mul(2u64.saturating_pow(retry)).min(30_000);
        prop_assert_eq!(without.delay(retry), Duration::from_millis(expected));
    }

    #[test]
    fn prop_window_admits_exactly_max(max in 1u32..20, extra in 1u32..10) {
        let allowed = tokio_test::block_on(async {
            let limiter = RateLimiter::new(
                "prop",
                max,
                Duration::from_secs(60),
                Arc::new(MemoryRateLimitStore::new()),
            );
            let subject = RateLimitSubject::Anonymous;
            let caller = CallerInfo::default();
            let mut allowed = 0;
            for _ in 0..(max + extra) {
                if limiter.check(&subject, "/api", &caller).await.is_allowed() {
                    allowed += 1;
                }
            }
            allowed
        });
        prop_assert_eq!(allowed, max);
    }
}
