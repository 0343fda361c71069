//! Authentication strategies and their axum middleware.
//!
//! ```text
//! credentials ─> SessionResolver ─> AuthMode ─> TenantDirectory (one lookup) ─> AuthContext
//! ```
//!
//! | strategy           | failure                 | status |
//! |--------------------|-------------------------|--------|
//! | `require_session`  | no/invalid token        | 401 `AUTH_ERROR` |
//! |                    | tenant unknown          | 404 `SHOP_NOT_FOUND` |
//! |                    | tenant uninstalled      | 403 `SHOP_UNINSTALLED` |
//! | `optional_session` | any                     | request continues unauthenticated |
//! | `flexible_auth`    | no credentials          | 401 `AUTH_REQUIRED` |
//! |                    | malformed shop          | 400 `INVALID_SHOP` |
//! |                    | tenant unknown          | 404 `SHOP_NOT_FOUND` |
//! |                    | tenant uninstalled      | 404 `SHOP_INVALID` |
//! |                    | directory failure       | 500 `AUTH_ERROR` |

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use chrono::Utc;
use tracing::{debug, error, warn};

use crate::auth::session::{AuthMode, Credentials, SessionResolver, VerifiedSession};
use crate::auth::AuthContext;
use crate::error::AuthError;
use crate::metrics::Metrics;
use crate::tenant::{ShopDomain, Tenant, TenantDirectory};

enum Lookup {
    Active(Tenant),
    Uninstalled,
    Missing,
    Failed,
}

/// Composes session resolution with tenant lookups
#[derive(Clone)]
pub struct Authenticator {
    resolver: Arc<SessionResolver>,
    directory: Arc<dyn TenantDirectory>,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("resolver", &self.resolver)
            .finish_non_exhaustive()
    }
}

impl Authenticator {
    pub fn new(
        resolver: Arc<SessionResolver>,
        directory: Arc<dyn TenantDirectory>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            resolver,
            directory,
            metrics,
        }
    }

    pub fn resolver(&self) -> &SessionResolver {
        &self.resolver
    }

    /// Session token mandatory; tenant must exist and be active
    pub async fn require_session(&self, credentials: &Credentials) -> Result<AuthContext, AuthError> {
        let result = self.require_session_inner(credentials).await;
        self.record(&result);
        result
    }

    async fn require_session_inner(
        &self,
        credentials: &Credentials,
    ) -> Result<AuthContext, AuthError> {
        let token = credentials
            .session_token
            .as_deref()
            .ok_or(AuthError::InvalidSession)?;
        let session = self.resolver.verify(token)?;

        match self.lookup(&session.shop).await {
            Lookup::Active(tenant) => Ok(self.context(session.shop.clone(), Some(session), tenant)),
            Lookup::Missing => Err(AuthError::ShopNotFound),
            Lookup::Uninstalled => Err(AuthError::ShopUninstalled),
            Lookup::Failed => Err(AuthError::Unexpected),
        }
    }

    /// Same checks as [`require_session`](Self::require_session), but any
    /// failure yields `None`.
    pub async fn optional_session(&self, credentials: &Credentials) -> Option<AuthContext> {
        credentials.session_token.as_ref()?;
        match self.require_session(credentials).await {
            Ok(context) => Some(context),
            Err(e) => {
                debug!(code = e.code(), "Optional session not established");
                None
            }
        }
    }

    /// Session token first, then the `shop` query parameter
    pub async fn flexible_auth(&self, credentials: &Credentials) -> Result<AuthContext, AuthError> {
        let result = self.flexible_auth_inner(credentials).await;
        self.record(&result);
        result
    }

    async fn flexible_auth_inner(
        &self,
        credentials: &Credentials,
    ) -> Result<AuthContext, AuthError> {
        let (shop, session) = match self.resolver.resolve(credentials)? {
            AuthMode::Session(session) => (session.shop.clone(), Some(session)),
            AuthMode::ShopParameter(shop) => (shop, None),
            AuthMode::None => return Err(AuthError::AuthRequired),
        };

        match self.lookup(&shop).await {
            Lookup::Active(tenant) => Ok(self.context(shop, session, tenant)),
            Lookup::Missing => Err(AuthError::ShopNotFound),
            Lookup::Uninstalled => Err(AuthError::ShopInvalid),
            Lookup::Failed => Err(AuthError::Unexpected),
        }
    }

    /// The only directory read of a request
    async fn lookup(&self, shop: &ShopDomain) -> Lookup {
        match self.directory.find(shop).await {
            Ok(Some(tenant)) if tenant.is_active() => Lookup::Active(tenant),
            Ok(Some(_)) => Lookup::Uninstalled,
            Ok(None) => Lookup::Missing,
            Err(e) => {
                error!(shop = %shop, error = %e, "Tenant lookup failed");
                Lookup::Failed
            }
        }
    }

    fn context(
        &self,
        shop: ShopDomain,
        session: Option<VerifiedSession>,
        tenant: Tenant,
    ) -> AuthContext {
        self.touch_last_active(&shop);
        AuthContext {
            tenant_domain: shop,
            session_principal: session.and_then(|s| s.principal),
            tenant,
        }
    }

    /// Fire-and-forget activity update; never delays the response
    fn touch_last_active(&self, shop: &ShopDomain) {
        let directory = self.directory.clone();
        let shop = shop.clone();
        tokio::spawn(async move {
            if let Err(e) = directory.touch_last_active(&shop, Utc::now()).await {
                warn!(shop = %shop, error = %e, "Failed to update last activity");
            }
        });
    }

    fn record(&self, result: &Result<AuthContext, AuthError>) {
        match result {
            Ok(_) => self.metrics.record_auth_success(),
            Err(e) => self.metrics.record_auth_failure(e.code()),
        }
    }
}

/// Reject the request unless it carries a valid session for an active tenant
pub async fn require_session(
    State(auth): State<Authenticator>,
    mut request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let credentials = Credentials::from_request(request.headers(), request.uri());
    let context = auth.require_session(&credentials).await?;
    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}

/// Attach an [`AuthContext`] when a valid session is present; never rejects
pub async fn optional_session(
    State(auth): State<Authenticator>,
    mut request: Request,
    next: Next,
) -> Response {
    let credentials = Credentials::from_request(request.headers(), request.uri());
    if let Some(context) = auth.optional_session(&credentials).await {
        request.extensions_mut().insert(context);
    }
    next.run(request).await
}

/// Accept a session token or, failing that, a `shop` query parameter
pub async fn flexible_auth(
    State(auth): State<Authenticator>,
    mut request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let credentials = Credentials::from_request(request.headers(), request.uri());
    let context = auth.flexible_auth(&credentials).await?;
    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}

/// Browser-flow rendering of an auth failure: redirect to the install
/// endpoint instead of returning a status code.
pub fn reauth_redirect(shop: Option<&ShopDomain>) -> Response {
    let location = match shop {
        Some(shop) => format!(
            "/auth?{}",
            url::form_urlencoded::Serializer::new(String::new())
                .append_pair("shop", shop.as_str())
                .finish()
        ),
        None => "/auth".to_string(),
    };
    Redirect::to(&location).into_response()
}

/// Extractor for routes behind [`require_session`] or [`flexible_auth`]
#[derive(Debug, Clone)]
pub struct Auth(pub AuthContext);

#[axum::async_trait]
impl<S> FromRequestParts<S> for Auth
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthContext>()
            .cloned()
            .map(Auth)
            .ok_or_else(|| {
                error!("AuthContext missing; is the auth middleware applied to this route?");
                AuthError::Unexpected
            })
    }
}

impl std::ops::Deref for Auth {
    type Target = AuthContext;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Extractor for routes behind [`optional_session`]
#[derive(Debug, Clone)]
pub struct MaybeAuth(pub Option<AuthContext>);

#[axum::async_trait]
impl<S> FromRequestParts<S> for MaybeAuth
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(MaybeAuth(parts.extensions.get::<AuthContext>().cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::session::test_tokens::{token_for, API_KEY, API_SECRET};
    use crate::error::DirectoryError;
    use crate::tenant::{MemoryTenantDirectory, UninstallOutcome};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, StatusCode};
    use axum::routing::get;
    use axum::{middleware, Router};
    use std::time::Duration;
    use tower::ServiceExt;

    const SHOP: &str = "acme.myshopify.com";

    struct DownDirectory;

    #[async_trait]
    impl TenantDirectory for DownDirectory {
        async fn find(&self, _: &ShopDomain) -> Result<Option<Tenant>, DirectoryError> {
            Err(DirectoryError::Unavailable("db down".into()))
        }
        async fn upsert_installation(
            &self,
            _: &ShopDomain,
            _: String,
            _: Vec<String>,
            _: chrono::DateTime<Utc>,
        ) -> Result<Tenant, DirectoryError> {
            Err(DirectoryError::Unavailable("db down".into()))
        }
        async fn mark_uninstalled(
            &self,
            _: &ShopDomain,
            _: chrono::DateTime<Utc>,
        ) -> Result<UninstallOutcome, DirectoryError> {
            Err(DirectoryError::Unavailable("db down".into()))
        }
        async fn touch_last_active(
            &self,
            _: &ShopDomain,
            _: chrono::DateTime<Utc>,
        ) -> Result<(), DirectoryError> {
            Ok(())
        }
    }

    fn shop() -> ShopDomain {
        ShopDomain::parse(SHOP).unwrap()
    }

    async fn setup(installed: bool) -> (Authenticator, Arc<MemoryTenantDirectory>, Arc<Metrics>) {
        let directory = Arc::new(MemoryTenantDirectory::new());
        directory
            .upsert_installation(&shop(), "v1:token".into(), vec![], Utc::now())
            .await
            .unwrap();
        if !installed {
            directory.mark_uninstalled(&shop(), Utc::now()).await.unwrap();
        }
        let metrics = Arc::new(Metrics::new());
        let resolver = Arc::new(SessionResolver::new(
            API_KEY,
            API_SECRET,
            Duration::from_secs(5),
        ));
        (
            Authenticator::new(resolver, directory.clone(), metrics.clone()),
            directory,
            metrics,
        )
    }

    fn session() -> Credentials {
        Credentials::default().with_session_token(token_for(SHOP))
    }

    #[tokio::test]
    async fn test_require_session_success() {
        let (auth, _, metrics) = setup(true).await;
        let context = auth.require_session(&session()).await.unwrap();
        assert_eq!(context.tenant_domain, shop());
        assert_eq!(context.session_principal.as_deref(), Some("42"));
        assert_eq!(
            metrics
                .auth_success_total
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn test_require_session_failures() {
        let (auth, _, metrics) = setup(true).await;
        assert_eq!(
            auth.require_session(&Credentials::default()).await.unwrap_err(),
            AuthError::InvalidSession
        );
        // A shop parameter is not enough
        let shop_only = Credentials::default().with_shop(SHOP);
        assert_eq!(
            auth.require_session(&shop_only).await.unwrap_err(),
            AuthError::InvalidSession
        );
        assert_eq!(metrics.auth_failures("AUTH_ERROR"), 2);

        let unknown = Credentials::default().with_session_token(token_for("ghost.myshopify.com"));
        assert_eq!(
            auth.require_session(&unknown).await.unwrap_err(),
            AuthError::ShopNotFound
        );

        let (auth, _, _) = setup(false).await;
        assert_eq!(
            auth.require_session(&session()).await.unwrap_err(),
            AuthError::ShopUninstalled
        );
    }

    #[tokio::test]
    async fn test_optional_session_degrades() {
        let (auth, _, _) = setup(false).await;
        assert!(auth.optional_session(&session()).await.is_none());
        assert!(auth.optional_session(&Credentials::default()).await.is_none());

        let (auth, _, _) = setup(true).await;
        assert!(auth.optional_session(&session()).await.is_some());
    }

    #[tokio::test]
    async fn test_flexible_auth_paths() {
        let (auth, _, _) = setup(true).await;

        assert_eq!(
            auth.flexible_auth(&Credentials::default()).await.unwrap_err(),
            AuthError::AuthRequired
        );
        assert_eq!(
            auth.flexible_auth(&Credentials::default().with_shop("acme.example.com"))
                .await
                .unwrap_err(),
            AuthError::InvalidShop
        );
        assert_eq!(
            auth.flexible_auth(&Credentials::default().with_shop("ghost.myshopify.com"))
                .await
                .unwrap_err(),
            AuthError::ShopNotFound
        );

        let weak = auth
            .flexible_auth(&Credentials::default().with_shop(SHOP))
            .await
            .unwrap();
        assert_eq!(weak.session_principal, None);

        let strong = auth.flexible_auth(&session()).await.unwrap();
        assert_eq!(strong.session_principal.as_deref(), Some("42"));

        let (auth, _, _) = setup(false).await;
        assert_eq!(
            auth.flexible_auth(&Credentials::default().with_shop(SHOP))
                .await
                .unwrap_err(),
            AuthError::ShopInvalid
        );
    }

    #[tokio::test]
    async fn test_directory_failure_is_unexpected() {
        let resolver = Arc::new(SessionResolver::new(API_KEY, API_SECRET, Duration::from_secs(5)));
        let auth = Authenticator::new(resolver, Arc::new(DownDirectory), Arc::new(Metrics::new()));

        let err = auth
            .flexible_auth(&Credentials::default().with_shop(SHOP))
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::Unexpected);
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_last_active_updated_in_background() {
        let (auth, directory, _) = setup(true).await;
        let before = directory.get(&shop()).unwrap().last_active_at;

        tokio::time::sleep(Duration::from_millis(5)).await;
        auth.flexible_auth(&session()).await.unwrap();

        for _ in 0..50 {
            tokio::task::yield_now().await;
            if directory.get(&shop()).unwrap().last_active_at != before {
                return;
            }
        }
        panic!("last_active_at was not updated");
    }

    #[tokio::test]
    async fn test_flexible_auth_middleware_responses() {
        let (auth, _, _) = setup(true).await;
        let app = Router::new()
            .route(
                "/api/me",
                get(|Auth(ctx): Auth| async move { ctx.tenant_domain.to_string() }),
            )
            .layer(middleware::from_fn_with_state(auth, flexible_auth));

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/api/me").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], "AUTH_REQUIRED");

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/me")
                    .header(header::AUTHORIZATION, format!("Bearer {}", token_for(SHOP)))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_reauth_redirect_location() {
        let response = reauth_redirect(Some(&shop()));
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(
            response.headers()[header::LOCATION],
            "/auth?shop=acme.myshopify.com"
        );
        assert_eq!(reauth_redirect(None).headers()[header::LOCATION], "/auth");
    }
}
