//! Application wiring: shared state, router and the maintenance sweeper.
//!
//! ```text
//! /health, /status, /metrics          operational, unauthenticated
//! /auth, /auth/callback               install flow, auth limiter (per IP)
//! POST /webhooks                      HMAC-verified lifecycle events
//! /api/session                        rejection guard (per IP) -> flexible_auth
//!                                     -> api limiter (per tenant)
//! ```

use std::sync::Arc;

use axum::extract::{FromRef, State};
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::auth::{flexible_auth, Auth, Authenticator, SessionResolver};
use crate::cache::CacheStore;
use crate::config::AppConfig;
use crate::cors::cors_layer;
use crate::error::Result;
use crate::handlers::{health_handler, metrics_handler, status_handler, track_requests, ServerStats};
use crate::limits::{
    rate_limit_middleware, rejected_request_guard, BudgetTracker, MemoryRateLimitStore,
    RateLimiter,
};
use crate::metrics::Metrics;
use crate::oauth::{begin_install, complete_install, InstallFlow, PlatformClient};
use crate::signature::HmacVerifier;
use crate::tenant::TenantDirectory;
use crate::vault::CredentialVault;
use crate::webhook::{webhook_handler, IdempotencyStore, InMemoryIdempotencyStore, WebhookProcessor};

/// Name of the per-tenant API limiter
pub const API_LIMITER: &str = "api";
/// Name of the per-IP install limiter
pub const AUTH_LIMITER: &str = "auth";
/// Name of the per-IP limiter counting rejected API requests
pub const API_REJECTION_LIMITER: &str = "api_rejected";

/// Everything the router shares between requests
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub metrics: Arc<Metrics>,
    pub stats: Arc<ServerStats>,
    pub vault: Arc<CredentialVault>,
    pub directory: Arc<dyn TenantDirectory>,
    pub cache: CacheStore,
    pub api_limiter: Arc<RateLimiter>,
    /// Shares the API limit, keyed by client IP, counting only rejections
    pub api_rejection_limiter: Arc<RateLimiter>,
    pub auth_limiter: Arc<RateLimiter>,
    pub budget: Arc<BudgetTracker>,
    pub authenticator: Authenticator,
    pub webhooks: WebhookProcessor,
    pub install: InstallFlow,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("api_limiter", &self.api_limiter)
            .field("api_rejection_limiter", &self.api_rejection_limiter)
            .field("auth_limiter", &self.auth_limiter)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Build every subsystem from configuration.
    ///
    /// Fails only if the encryption key is unusable.
    pub fn from_config(
        config: AppConfig,
        directory: Arc<dyn TenantDirectory>,
        client: Arc<dyn PlatformClient>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let metrics = Arc::new(Metrics::new());
        let vault = Arc::new(CredentialVault::new(config.encryption_key())?);
        let cache = CacheStore::in_memory(config.cache_ttl).with_metrics(metrics.clone());

        let api_limiter = RateLimiter::new(
            API_LIMITER,
            config.api_rate_limit,
            config.api_rate_window,
            Arc::new(MemoryRateLimitStore::new()),
        )
        .with_metrics(metrics.clone());
        let api_rejection_limiter = RateLimiter::new(
            API_REJECTION_LIMITER,
            config.api_rate_limit,
            config.api_rate_window,
            Arc::new(MemoryRateLimitStore::new()),
        )
        .with_metrics(metrics.clone());
        let auth_limiter = RateLimiter::new(
            AUTH_LIMITER,
            config.auth_rate_limit,
            config.auth_rate_window,
            Arc::new(MemoryRateLimitStore::new()),
        )
        .with_metrics(metrics.clone());

        let budget = BudgetTracker::new(config.budget_max_cost, config.budget_window)
            .with_warn_threshold(config.budget_warn_threshold)
            .with_metrics(metrics.clone());

        let authenticator = Authenticator::new(
            Arc::new(SessionResolver::from_config(&config)),
            directory.clone(),
            metrics.clone(),
        );

        let idempotency: Arc<dyn IdempotencyStore> =
            Arc::new(InMemoryIdempotencyStore::new(config.webhook_dedup_ttl));
        let webhooks = WebhookProcessor::new(
            HmacVerifier::new(config.api_secret()),
            directory.clone(),
            cache.clone(),
            idempotency,
            metrics.clone(),
        )
        .with_apply_timeout(config.webhook_timeout);

        let install = InstallFlow::new(
            config.clone(),
            client,
            vault.clone(),
            directory.clone(),
            cache.clone(),
        );

        Ok(Self {
            config,
            metrics,
            stats: Arc::new(ServerStats::new()),
            vault,
            directory,
            cache,
            api_limiter: Arc::new(api_limiter),
            api_rejection_limiter: Arc::new(api_rejection_limiter),
            auth_limiter: Arc::new(auth_limiter),
            budget: Arc::new(budget),
            authenticator,
            webhooks,
            install,
        })
    }

    /// One maintenance pass over every in-process store
    pub async fn sweep(&self) -> SweepReport {
        let (cache, api_windows, rejection_windows, auth_windows, webhook_deliveries) =
            futures::join!(
                self.cache.purge_expired(),
                self.api_limiter.store().purge_expired(),
                self.api_rejection_limiter.store().purge_expired(),
                self.auth_limiter.store().purge_expired(),
                self.webhooks.idempotency().purge_expired(),
            );

        let cache_entries = cache.unwrap_or_else(|e| {
            warn!(error = %e, "Cache sweep failed");
            0
        });

        SweepReport {
            cache_entries,
            rate_windows: api_windows + rejection_windows + auth_windows,
            budgets: self.budget.purge_expired(),
            install_states: self.install.states().purge_expired(),
            webhook_deliveries,
        }
    }
}

impl FromRef<AppState> for Arc<Metrics> {
    fn from_ref(state: &AppState) -> Self {
        state.metrics.clone()
    }
}

impl FromRef<AppState> for Arc<ServerStats> {
    fn from_ref(state: &AppState) -> Self {
        state.stats.clone()
    }
}

impl FromRef<AppState> for Arc<BudgetTracker> {
    fn from_ref(state: &AppState) -> Self {
        state.budget.clone()
    }
}

impl FromRef<AppState> for WebhookProcessor {
    fn from_ref(state: &AppState) -> Self {
        state.webhooks.clone()
    }
}

impl FromRef<AppState> for InstallFlow {
    fn from_ref(state: &AppState) -> Self {
        state.install.clone()
    }
}

/// Entries removed by one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub cache_entries: usize,
    pub rate_windows: usize,
    pub budgets: usize,
    pub install_states: usize,
    pub webhook_deliveries: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.cache_entries
            + self.rate_windows
            + self.budgets
            + self.install_states
            + self.webhook_deliveries
    }
}

/// Run [`AppState::sweep`] every `sweep_interval` until the task is aborted
pub fn spawn_sweeper(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(state.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let report = state.sweep().await;
            if report.total() > 0 {
                info!(
                    cache_entries = report.cache_entries,
                    rate_windows = report.rate_windows,
                    budgets = report.budgets,
                    install_states = report.install_states,
                    webhook_deliveries = report.webhook_deliveries,
                    "Maintenance sweep"
                );
            } else {
                debug!("Maintenance sweep found nothing to remove");
            }
        }
    })
}

/// Body of `GET /api/session`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub shop: String,
    /// `session` or `shop_parameter`
    pub auth: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal: Option<String>,
    pub scopes: Vec<String>,
    pub budget_remaining: i64,
    pub budget_max: i64,
}

/// `GET /api/session`: who the caller is and what budget remains
#[instrument(skip_all, fields(shop = %auth.tenant_domain))]
pub async fn session_info(
    State(budget): State<Arc<BudgetTracker>>,
    auth: Auth,
) -> Json<SessionInfo> {
    let current = budget.get_budget(&auth.tenant_domain);
    Json(SessionInfo {
        shop: auth.tenant_domain.to_string(),
        auth: if auth.is_session() { "session" } else { "shop_parameter" }.to_string(),
        principal: auth.session_principal.clone(),
        scopes: auth.tenant.scopes.clone(),
        budget_remaining: current.remaining(),
        budget_max: current.max_cost,
    })
}

/// Build the full router
pub fn router(state: AppState) -> Router {
    // The last route_layer runs first: the rejection guard refuses noisy IPs
    // before any directory lookup, then flexible_auth, then the tenant limiter.
    let api = Router::new()
        .route("/api/session", get(session_info))
        .route_layer(from_fn_with_state(
            state.api_limiter.clone(),
            rate_limit_middleware,
        ))
        .route_layer(from_fn_with_state(
            state.authenticator.clone(),
            flexible_auth,
        ))
        .route_layer(from_fn_with_state(
            state.api_rejection_limiter.clone(),
            rejected_request_guard,
        ));

    let install = Router::new()
        .route("/auth", get(begin_install))
        .route("/auth/callback", get(complete_install))
        .route_layer(from_fn_with_state(
            state.auth_limiter.clone(),
            rate_limit_middleware,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/metrics", get(metrics_handler))
        .route("/webhooks", post(webhook_handler))
        .merge(install)
        .merge(api)
        .layer(from_fn_with_state(state.stats.clone(), track_requests))
        .layer(cors_layer())
        .with_state(state)
}
