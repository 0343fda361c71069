//! Browser install flow: `GET /auth` and `GET /auth/callback`.
//!
//! Callback checks run in a fixed order: HMAC (403), shop domain (400),
//! state nonce (403, single use). Everything after that is a browser
//! redirect back to `/auth?shop=` on failure rather than a raw status.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, RawQuery, State};
use axum::response::{IntoResponse, Redirect, Response};
use chrono::Utc;
use dashmap::DashMap;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

use crate::auth::reauth_redirect;
use crate::cache::{keys, CacheStore};
use crate::config::AppConfig;
use crate::deadline::expires_after;
use crate::error::{AuthError, Error, SignatureError};
use crate::oauth::client::{AccessTokenResponse, PlatformClient};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::signature::HmacVerifier;
use crate::tenant::{ShopDomain, TenantDirectory};
use crate::vault::CredentialVault;

/// How long an issued state nonce stays valid
pub const STATE_TTL: Duration = Duration::from_secs(10 * 60);

/// Single-use OAuth `state` nonces
#[derive(Debug)]
pub struct InstallStateStore {
    states: DashMap<String, (ShopDomain, Instant)>,
    ttl: Duration,
}

impl Default for InstallStateStore {
    fn default() -> Self {
        Self::new(STATE_TTL)
    }
}

impl InstallStateStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            states: DashMap::new(),
            ttl,
        }
    }

    /// Issue a nonce bound to a shop
    pub fn issue(&self, shop: &ShopDomain) -> String {
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let expires_at = expires_after(Instant::now(), self.ttl);
        self.states.insert(nonce.clone(), (shop.clone(), expires_at));
        nonce
    }

    /// Consume a nonce. Succeeds at most once, only for the shop it was
    /// issued to and only before it expires.
    pub fn consume(&self, nonce: &str, shop: &ShopDomain) -> bool {
        match self.states.remove(nonce) {
            Some((_, (issued_for, expires_at))) => {
                &issued_for == shop && Instant::now() < expires_at
            }
            None => false,
        }
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.states.len();
        self.states.retain(|_, (_, expires_at)| now < *expires_at);
        before.saturating_sub(self.states.len())
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// Everything the install endpoints need
#[derive(Clone)]
pub struct InstallFlow {
    pub(crate) config: Arc<AppConfig>,
    pub(crate) verifier: HmacVerifier,
    pub(crate) states: Arc<InstallStateStore>,
    pub(crate) client: Arc<dyn PlatformClient>,
    pub(crate) vault: Arc<CredentialVault>,
    pub(crate) directory: Arc<dyn TenantDirectory>,
    pub(crate) cache: CacheStore,
    pub(crate) retry: RetryExecutor,
}

impl std::fmt::Debug for InstallFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallFlow")
            .field("app_url", &self.config.app_url)
            .finish_non_exhaustive()
    }
}

impl InstallFlow {
    pub fn new(
        config: Arc<AppConfig>,
        client: Arc<dyn PlatformClient>,
        vault: Arc<CredentialVault>,
        directory: Arc<dyn TenantDirectory>,
        cache: CacheStore,
    ) -> Self {
        let retry = RetryExecutor::new(RetryPolicy::new(
            config.upstream_max_retries,
            Duration::from_millis(1000),
        ));
        Self {
            verifier: HmacVerifier::new(config.api_secret()),
            states: Arc::new(InstallStateStore::default()),
            config,
            client,
            vault,
            directory,
            cache,
            retry,
        }
    }

    /// Override the retry policy for the code exchange
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = RetryExecutor::new(policy);
        self
    }

    pub fn states(&self) -> &Arc<InstallStateStore> {
        &self.states
    }

    /// Platform authorize URL for a shop and nonce
    pub fn authorize_url(&self, shop: &ShopDomain, state: &str) -> String {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("client_id", &self.config.api_key)
            .append_pair("scope", &self.config.scopes.join(","))
            .append_pair(
                "redirect_uri",
                &format!("{}/auth/callback", self.config.app_url),
            )
            .append_pair("state", state)
            .finish();
        format!("https://{shop}/admin/oauth/authorize?{query}")
    }

    async fn exchange(&self, shop: &ShopDomain, code: &str) -> Result<AccessTokenResponse, Error> {
        let timeout = self.config.upstream_timeout;
        self.retry
            .run(|| async {
                match tokio::time::timeout(timeout, self.client.exchange_code(shop, code)).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!("token exchange timed out after {timeout:?}")),
                }
            })
            .await
            .map_err(|e| Error::upstream(format!("{e:#}")))
    }
}

/// Query of `GET /auth`
#[derive(Debug, Deserialize)]
pub struct BeginInstallQuery {
    pub shop: Option<String>,
}

/// `GET /auth?shop=`: start an install
#[instrument(skip_all)]
pub async fn begin_install(
    State(flow): State<InstallFlow>,
    Query(query): Query<BeginInstallQuery>,
) -> Response {
    let shop = match query.shop.as_deref().map(ShopDomain::parse) {
        Some(Ok(shop)) => shop,
        _ => return AuthError::InvalidShop.into_response(),
    };

    let state = flow.states.issue(&shop);
    info!(shop = %shop, "Starting install");
    Redirect::to(&flow.authorize_url(&shop, &state)).into_response()
}

/// `GET /auth/callback`: finish an install
#[instrument(skip_all)]
pub async fn complete_install(
    State(flow): State<InstallFlow>,
    RawQuery(query): RawQuery,
) -> Response {
    let params: Vec<(String, String)> = query
        .as_deref()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();
    let param = |name: &str| {
        params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    };

    if !flow.verifier.verify_install_callback(params.iter().map(|(k, v)| (k, v))) {
        warn!(
            target: "shopguard::monitor",
            shop = param("shop").unwrap_or("-"),
            "Install callback signature rejected"
        );
        return Error::from(SignatureError::InvalidHmac).into_response();
    }

    let shop = match param("shop").map(ShopDomain::parse) {
        Some(Ok(shop)) => shop,
        _ => return AuthError::InvalidShop.into_response(),
    };

    if !param("state").is_some_and(|state| flow.states.consume(state, &shop)) {
        warn!(target: "shopguard::monitor", shop = %shop, "Install callback state rejected");
        return Error::from(SignatureError::InvalidState).into_response();
    }

    let Some(code) = param("code").filter(|c| !c.is_empty()) else {
        return Error::MalformedPayload("missing authorization code".to_string()).into_response();
    };

    match finish(&flow, &shop, code).await {
        Ok(()) => {
            let location = format!(
                "{}/?{}",
                flow.config.app_url,
                url::form_urlencoded::Serializer::new(String::new())
                    .append_pair("shop", shop.as_str())
                    .finish()
            );
            Redirect::to(&location).into_response()
        }
        Err(e) => {
            error!(shop = %shop, error = %e, "Install failed; sending merchant back through auth");
            reauth_redirect(Some(&shop))
        }
    }
}

async fn finish(flow: &InstallFlow, shop: &ShopDomain, code: &str) -> Result<(), Error> {
    let token = flow.exchange(shop, code).await?;
    let encrypted = flow.vault.encrypt(&token.access_token)?;

    let tenant = flow
        .directory
        .upsert_installation(shop, encrypted, token.scopes(), Utc::now())
        .await?;

    if let Err(e) = flow.cache.delete_pattern(&keys::tenant_pattern(shop)).await {
        warn!(shop = %shop, error = %e, "Failed to clear tenant cache after install");
    }

    info!(shop = %tenant.domain, scopes = ?tenant.scopes, "Tenant installed");
    Ok(())
}
