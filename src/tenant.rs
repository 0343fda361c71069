//! Tenant records and the directory contract.
//!
//! The directory is an external collaborator (normally database-backed).
//! Shopguard only needs the narrow read/write contract in
//! [`TenantDirectory`]; [`MemoryTenantDirectory`] implements it in-process
//! for tests and single-node deployments.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{AuthError, DirectoryError};

/// Domain suffix every tenant domain must carry
pub const PLATFORM_DOMAIN_SUFFIX: &str = ".myshopify.com";

/// A validated, lower-cased tenant domain such as `acme.myshopify.com`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ShopDomain(String);

impl ShopDomain {
    /// Parse and normalise a shop domain.
    ///
    /// Accepts `<name>.myshopify.com` where `<name>` starts with an ASCII
    /// letter or digit and otherwise contains only letters, digits and `-`.
    pub fn parse(raw: &str) -> Result<Self, AuthError> {
        let domain = raw.trim().to_ascii_lowercase();
        let name = domain
            .strip_suffix(PLATFORM_DOMAIN_SUFFIX)
            .ok_or(AuthError::InvalidShop)?;

        let mut chars = name.chars();
        match chars.next() {
            Some(first) if first.is_ascii_alphanumeric() => {}
            _ => return Err(AuthError::InvalidShop),
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(AuthError::InvalidShop);
        }

        Ok(Self(domain))
    }

    /// The domain as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShopDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ShopDomain {
    type Error = AuthError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ShopDomain> for String {
    fn from(value: ShopDomain) -> Self {
        value.0
    }
}

/// One installation of the app for a merchant domain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    /// Unique, immutable key
    pub domain: ShopDomain,
    /// Access token sealed by the credential vault
    pub encrypted_access_token: String,
    /// Scopes granted at the last install
    #[serde(default)]
    pub scopes: Vec<String>,
    pub installed_at: DateTime<Utc>,
    /// `None` while the app is installed
    pub uninstalled_at: Option<DateTime<Utc>>,
    /// Opaque settings blob owned by the UI layer
    #[serde(default)]
    pub settings: serde_json::Value,
    pub last_active_at: Option<DateTime<Utc>>,
}

impl Tenant {
    /// A tenant is active iff it has not been uninstalled
    pub fn is_active(&self) -> bool {
        self.uninstalled_at.is_none()
    }
}

/// Result of a soft-delete request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UninstallOutcome {
    /// The tenant was active and is now marked uninstalled
    Uninstalled,
    /// The tenant was already uninstalled; nothing changed
    AlreadyUninstalled,
    /// No tenant exists for the domain; nothing changed
    NotFound,
}

/// Read/write contract for tenant records
#[async_trait]
pub trait TenantDirectory: Send + Sync + 'static {
    /// Look up a tenant by domain
    async fn find(&self, domain: &ShopDomain) -> Result<Option<Tenant>, DirectoryError>;

    /// Create the tenant, or re-activate it on re-install.
    ///
    /// Re-install clears `uninstalled_at` and replaces the stored token.
    async fn upsert_installation(
        &self,
        domain: &ShopDomain,
        encrypted_access_token: String,
        scopes: Vec<String>,
        at: DateTime<Utc>,
    ) -> Result<Tenant, DirectoryError>;

    /// Soft-delete the tenant.
    ///
    /// Sets `uninstalled_at` only if it is currently unset and leaves the
    /// token intact, so repeated calls are no-ops.
    async fn mark_uninstalled(
        &self,
        domain: &ShopDomain,
        at: DateTime<Utc>,
    ) -> Result<UninstallOutcome, DirectoryError>;

    /// Record activity for the tenant
    async fn touch_last_active(
        &self,
        domain: &ShopDomain,
        at: DateTime<Utc>,
    ) -> Result<(), DirectoryError>;
}

/// In-process tenant directory
#[derive(Debug, Default)]
pub struct MemoryTenantDirectory {
    tenants: RwLock<HashMap<ShopDomain, Tenant>>,
}

impl MemoryTenantDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record verbatim
    pub fn insert(&self, tenant: Tenant) {
        self.tenants.write().insert(tenant.domain.clone(), tenant);
    }

    /// Synchronous snapshot of a record
    pub fn get(&self, domain: &ShopDomain) -> Option<Tenant> {
        self.tenants.read().get(domain).cloned()
    }

    pub fn len(&self) -> usize {
        self.tenants.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.read().is_empty()
    }
}

#[async_trait]
impl TenantDirectory for MemoryTenantDirectory {
    async fn find(&self, domain: &ShopDomain) -> Result<Option<Tenant>, DirectoryError> {
        Ok(self.get(domain))
    }

    async fn upsert_installation(
        &self,
        domain: &ShopDomain,
        encrypted_access_token: String,
        scopes: Vec<String>,
        at: DateTime<Utc>,
    ) -> Result<Tenant, DirectoryError> {
        let mut tenants = self.tenants.write();
        let tenant = tenants
            .entry(domain.clone())
            .and_modify(|t| {
                t.encrypted_access_token = encrypted_access_token.clone();
                t.scopes = scopes.clone();
                t.installed_at = at;
                t.uninstalled_at = None;
                t.last_active_at = Some(at);
            })
            .or_insert_with(|| Tenant {
                domain: domain.clone(),
                encrypted_access_token: encrypted_access_token.clone(),
                scopes: scopes.clone(),
                installed_at: at,
                uninstalled_at: None,
                settings: serde_json::Value::Object(Default::default()),
                last_active_at: Some(at),
            });
        Ok(tenant.clone())
    }

    async fn mark_uninstalled(
        &self,
        domain: &ShopDomain,
        at: DateTime<Utc>,
    ) -> Result<UninstallOutcome, DirectoryError> {
        let mut tenants = self.tenants.write();
        let Some(tenant) = tenants.get_mut(domain) else {
            return Ok(UninstallOutcome::NotFound);
        };
        if tenant.uninstalled_at.is_some() {
            return Ok(UninstallOutcome::AlreadyUninstalled);
        }
        tenant.uninstalled_at = Some(at);
        Ok(UninstallOutcome::Uninstalled)
    }

    async fn touch_last_active(
        &self,
        domain: &ShopDomain,
        at: DateTime<Utc>,
    ) -> Result<(), DirectoryError> {
        if let Some(tenant) = self.tenants.write().get_mut(domain) {
            tenant.last_active_at = Some(at);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn shop() -> ShopDomain {
        ShopDomain::parse("acme.myshopify.com").unwrap()
    }

    #[test]
    fn test_shop_domain_accepts_platform_domains() {
        assert_eq!(
            ShopDomain::parse(" ACME-store.myshopify.com ").unwrap().as_str(),
            "acme-store.myshopify.com"
        );
        assert!(ShopDomain::parse("a1.myshopify.com").is_ok());
    }

    #[test]
    fn test_shop_domain_rejects_malformed() {
        for raw in [
            "",
            "myshopify.com",
            ".myshopify.com",
            "-acme.myshopify.com",
            "acme.example.com",
            "acme.myshopify.com.evil.com",
            "ac_me.myshopify.com",
            "evil.com/acme.myshopify.com",
            "sub.acme.myshopify.com",
        ] {
            assert_eq!(ShopDomain::parse(raw), Err(AuthError::InvalidShop), "{raw}");
        }
    }

    #[test]
    fn test_shop_domain_serde_validates() {
        let ok: ShopDomain = serde_json::from_str("\"acme.myshopify.com\"").unwrap();
        assert_eq!(ok, shop());
        assert!(serde_json::from_str::<ShopDomain>("\"evil.com\"").is_err());
    }

    #[tokio::test]
    async fn test_upsert_and_reinstall() {
        let dir = MemoryTenantDirectory::new();
        let t0 = Utc::now();
        let tenant = dir
            .upsert_installation(&shop(), "v1:one".into(), vec![], t0)
            .await
            .unwrap();
        assert!(tenant.is_active());

        dir.mark_uninstalled(&shop(), t0 + Duration::seconds(5))
            .await
            .unwrap();
        assert!(!dir.get(&shop()).unwrap().is_active());

        let reinstalled = dir
            .upsert_installation(&shop(), "v1:two".into(), vec![], t0 + Duration::seconds(10))
            .await
            .unwrap();
        assert!(reinstalled.is_active());
        assert_eq!(reinstalled.encrypted_access_token, "v1:two");
        assert_eq!(dir.len(), 1);
    }

    #[tokio::test]
    async fn test_mark_uninstalled_is_idempotent() {
        let dir = MemoryTenantDirectory::new();
        let t0 = Utc::now();
        dir.upsert_installation(&shop(), "v1:tok".into(), vec![], t0)
            .await
            .unwrap();

        let first = t0 + Duration::seconds(1);
        assert_eq!(
            dir.mark_uninstalled(&shop(), first).await.unwrap(),
            UninstallOutcome::Uninstalled
        );
        assert_eq!(
            dir.mark_uninstalled(&shop(), first + Duration::seconds(30))
                .await
                .unwrap(),
            UninstallOutcome::AlreadyUninstalled
        );

        let tenant = dir.get(&shop()).unwrap();
        assert_eq!(tenant.uninstalled_at, Some(first));
        assert_eq!(tenant.encrypted_access_token, "v1:tok");
    }

    #[tokio::test]
    async fn test_mark_uninstalled_unknown_tenant() {
        let dir = MemoryTenantDirectory::new();
        assert_eq!(
            dir.mark_uninstalled(&shop(), Utc::now()).await.unwrap(),
            UninstallOutcome::NotFound
        );
        assert!(dir.is_empty());
    }
}
