//! Upstream platform client used by the install flow

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::tenant::ShopDomain;

/// Response of the OAuth code exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTokenResponse {
    pub access_token: String,
    /// Comma separated granted scopes
    #[serde(default)]
    pub scope: String,
}

impl AccessTokenResponse {
    pub fn scopes(&self) -> Vec<String> {
        self.scope
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Calls the platform makes on behalf of a tenant
#[async_trait]
pub trait PlatformClient: Send + Sync + 'static {
    /// Exchange an authorization code for a permanent access token
    async fn exchange_code(&self, shop: &ShopDomain, code: &str)
        -> anyhow::Result<AccessTokenResponse>;
}

#[derive(Serialize)]
struct ExchangeRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    code: &'a str,
}

/// [`PlatformClient`] over HTTPS
pub struct HttpPlatformClient {
    http: reqwest::Client,
    api_key: String,
    api_secret: String,
}

impl std::fmt::Debug for HttpPlatformClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpPlatformClient")
            .field("api_key", &self.api_key)
            .finish_non_exhaustive()
    }
}

impl HttpPlatformClient {
    pub fn new(
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("shopguard/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        })
    }
}

#[async_trait]
impl PlatformClient for HttpPlatformClient {
    async fn exchange_code(
        &self,
        shop: &ShopDomain,
        code: &str,
    ) -> anyhow::Result<AccessTokenResponse> {
        let url = format!("https://{shop}/admin/oauth/access_token");
        debug!(shop = %shop, "Exchanging OAuth code");

        let response = self
            .http
            .post(&url)
            .json(&ExchangeRequest {
                client_id: &self.api_key,
                client_secret: &self.api_secret,
                code,
            })
            .send()
            .await
            .with_context(|| format!("token exchange request to {shop} failed"))?
            .error_for_status()
            .with_context(|| format!("token exchange for {shop} was refused"))?;

        response
            .json::<AccessTokenResponse>()
            .await
            .context("token exchange returned an unexpected body")
    }
}
