//! Session token verification and credential resolution.
//!
//! Session tokens are HS256 JWTs minted by the platform for the embedded
//! admin app, signed with the app's API secret. Time claims are checked here
//! (with leeway) instead of inside `jsonwebtoken` so the clock can be
//! injected in tests.

use std::time::Duration;

use axum::http::{header, HeaderMap, Uri};
use chrono::Utc;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::AppConfig;
use crate::error::AuthError;
use crate::tenant::ShopDomain;

/// Claims carried by a platform session token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Issuer, `https://<shop>/admin`
    #[serde(default)]
    pub iss: Option<String>,
    /// Destination, `https://<shop>`
    pub dest: String,
    /// Audience, the app's API key
    pub aud: String,
    /// Staff user id
    #[serde(default)]
    pub sub: Option<String>,
    pub exp: i64,
    #[serde(default)]
    pub nbf: Option<i64>,
    #[serde(default)]
    pub iat: Option<i64>,
    #[serde(default)]
    pub jti: Option<String>,
    #[serde(default)]
    pub sid: Option<String>,
}

/// A session token that passed every check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedSession {
    pub shop: ShopDomain,
    pub principal: Option<String>,
    pub claims: SessionClaims,
}

/// Raw credentials found on a request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// Value of the `Authorization` header, `Bearer ` prefix removed
    pub session_token: Option<String>,
    /// Value of the `shop` query parameter
    pub shop: Option<String>,
}

impl Credentials {
    /// Collect credentials from request headers and query string
    pub fn from_request(headers: &HeaderMap, uri: &Uri) -> Self {
        let session_token = headers
            .get(header::AUTHORIZATION)
            .map(|value| {
                let value = value.to_str().unwrap_or_default().trim();
                strip_bearer(value).to_string()
            });

        let shop = uri.query().and_then(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .find(|(key, _)| key == "shop")
                .map(|(_, value)| value.into_owned())
        });

        Self {
            session_token,
            shop,
        }
    }

    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    pub fn with_shop(mut self, shop: impl Into<String>) -> Self {
        self.shop = Some(shop.into());
        self
    }
}

fn strip_bearer(value: &str) -> &str {
    match value.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => token.trim(),
        _ => value,
    }
}

/// How a request authenticated, in resolution order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMode {
    /// A verified session token
    Session(VerifiedSession),
    /// Only a well-formed `shop` parameter (weak authentication)
    ShopParameter(ShopDomain),
    /// No credentials at all
    None,
}

/// Validates session tokens against the app's key and secret
pub struct SessionResolver {
    api_key: String,
    decoding_key: DecodingKey,
    leeway: Duration,
}

impl std::fmt::Debug for SessionResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionResolver")
            .field("api_key", &self.api_key)
            .field("leeway", &self.leeway)
            .finish_non_exhaustive()
    }
}

impl SessionResolver {
    pub fn new(api_key: impl Into<String>, api_secret: &str, leeway: Duration) -> Self {
        Self {
            api_key: api_key.into(),
            decoding_key: DecodingKey::from_secret(api_secret.as_bytes()),
            leeway,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.api_key.clone(),
            config.api_secret(),
            config.session_leeway,
        )
    }

    /// Verify a session token against the current time
    pub fn verify(&self, token: &str) -> Result<VerifiedSession, AuthError> {
        self.verify_at(token, Utc::now().timestamp())
    }

    /// Verify a session token against the given epoch seconds.
    ///
    /// Every failure maps to [`AuthError::InvalidSession`]; the reason only
    /// goes to the debug log.
    pub fn verify_at(&self, token: &str, now: i64) -> Result<VerifiedSession, AuthError> {
        let reject = |reason: &str| {
            debug!(reason, "Session token rejected");
            AuthError::InvalidSession
        };

        if token.is_empty() {
            return Err(reject("empty token"));
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims = ["exp".to_string()].into_iter().collect();

        let claims = decode::<SessionClaims>(token, &self.decoding_key, &validation)
            .map_err(|e| {
                debug!(error = %e, "Session token failed to decode");
                AuthError::InvalidSession
            })?
            .claims;

        let leeway = self.leeway.as_secs() as i64;
        if claims.exp < now - leeway {
            return Err(reject("expired"));
        }
        if matches!(claims.nbf, Some(nbf) if nbf > now + leeway) {
            return Err(reject("not yet valid"));
        }
        if claims.aud != self.api_key {
            return Err(reject("audience mismatch"));
        }

        let host = claims
            .dest
            .strip_prefix("https://")
            .ok_or_else(|| reject("destination is not https"))?;
        let shop = ShopDomain::parse(host).map_err(|_| reject("destination is not a shop"))?;

        Ok(VerifiedSession {
            shop,
            principal: claims.sub.clone(),
            claims,
        })
    }

    /// Resolve credentials into an [`AuthMode`].
    ///
    /// A session token, when present, always wins; an invalid token is an
    /// error and never falls back to the shop parameter.
    pub fn resolve(&self, credentials: &Credentials) -> Result<AuthMode, AuthError> {
        if let Some(token) = &credentials.session_token {
            return self.verify(token).map(AuthMode::Session);
        }
        if let Some(shop) = &credentials.shop {
            return ShopDomain::parse(shop).map(AuthMode::ShopParameter);
        }
        Ok(AuthMode::None)
    }
}
