//! Request authentication
//!
//! [`session`] turns raw request credentials into an [`AuthMode`];
//! [`middleware`] combines that with one tenant lookup to build the
//! per-request [`AuthContext`].

pub mod middleware;
pub mod session;

pub use middleware::{
    flexible_auth, optional_session, reauth_redirect, require_session, Auth, Authenticator,
    MaybeAuth,
};
pub use session::{AuthMode, Credentials, SessionClaims, SessionResolver, VerifiedSession};

use crate::error::AuthError;
use crate::tenant::{ShopDomain, Tenant};
use crate::vault::CredentialVault;

/// Who is calling, built once per request and never persisted
#[derive(Debug, Clone, PartialEq)]
pub struct AuthContext {
    pub tenant_domain: ShopDomain,
    /// Present only when a verified session token was used
    pub session_principal: Option<String>,
    /// Snapshot of the tenant record taken during authentication
    pub tenant: Tenant,
}

impl AuthContext {
    /// Whether the request was authenticated by a session token
    pub fn is_session(&self) -> bool {
        self.session_principal.is_some()
    }

    /// Decrypt the tenant's platform access token.
    ///
    /// A decryption failure means the tenant has to reinstall the app.
    pub fn access_token(&self, vault: &CredentialVault) -> Result<String, AuthError> {
        vault
            .decrypt(&self.tenant.encrypted_access_token)
            .map_err(|_| {
                tracing::warn!(shop = %self.tenant_domain, "Stored access token is unreadable");
                AuthError::TokenDecryptFailed
            })
    }
}
