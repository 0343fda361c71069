//! Caching for upstream reads
//!
//! Keys are `<namespace>:<shop domain>:<rest>` so that everything cached for
//! one tenant can be dropped with [`keys::tenant_pattern`].

pub mod pattern;
pub mod store;

pub use pattern::GlobPattern;
pub use store::{CacheBackend, CacheStore, MemoryCacheBackend};

/// Cache key builders
pub mod keys {
    use crate::tenant::ShopDomain;

    /// Key for a tenant-scoped entry
    pub fn tenant_key(namespace: &str, shop: &ShopDomain, rest: &str) -> String {
        format!("{namespace}:{shop}:{rest}")
    }

    /// Key for a product listing or detail
    pub fn products(shop: &ShopDomain, rest: &str) -> String {
        tenant_key("products", shop, rest)
    }

    /// Pattern matching every product entry of a tenant
    pub fn products_pattern(shop: &ShopDomain) -> String {
        format!("products:{shop}:*")
    }

    /// Pattern matching every entry of a tenant
    pub fn tenant_pattern(shop: &ShopDomain) -> String {
        format!("*:{shop}:*")
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::cache::GlobPattern;

        #[test]
        fn test_tenant_pattern_isolates_tenants() {
            let acme = ShopDomain::parse("acme.myshopify.com").unwrap();
            let other = ShopDomain::parse("other.myshopify.com").unwrap();

            let pattern = GlobPattern::new(&tenant_pattern(&acme)).unwrap();
            assert!(pattern.matches(&products(&acme, "list")));
            assert!(pattern.matches(&tenant_key("collections", &acme, "1")));
            assert!(!pattern.matches(&products(&other, "list")));

            let products_only = GlobPattern::new(&products_pattern(&acme)).unwrap();
            assert!(!products_only.matches(&tenant_key("collections", &acme, "1")));
        }
    }
}
