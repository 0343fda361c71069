//! Process configuration
//!
//! All secrets come from environment variables. A missing API key, API
//! secret or encryption key is a startup-fatal [`ConfigError`], never a
//! per-request error.
//!
//! - `SHOPIFY_API_KEY` (required)
//! - `SHOPIFY_API_SECRET` (required): signs install callbacks, webhooks and session tokens
//! - `SHOPGUARD_ENCRYPTION_KEY` (required): at least 32 characters
//! - `SHOPGUARD_APP_URL`: public base URL of the app (default `http://localhost:3000`)
//! - `SHOPIFY_SCOPES`: comma separated OAuth scopes
//! - `SHOPGUARD_API_RATE_LIMIT`: tenant API requests per minute (default 100)
//! - `SHOPGUARD_AUTH_RATE_LIMIT`: install attempts per IP per 15 minutes (default 10)
//! - `SHOPGUARD_BUDGET_MAX_COST`: upstream points per window (default 1000)
//! - `SHOPGUARD_BUDGET_WINDOW_SECS`: upstream budget window (default 60)
//! - `SHOPGUARD_CACHE_TTL_SECS`: default cache TTL (default 300)
//! - `SHOPGUARD_SWEEP_INTERVAL_SECS`: maintenance sweep interval (default 300)
//!
//! `*_SECS` values must be between 1 and [`MAX_DURATION_SECS`].

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::ConfigError;

/// Minimum accepted length of the token encryption key
pub const MIN_ENCRYPTION_KEY_LEN: usize = 32;

/// Upper bound for every `*_SECS` variable (30 days)
pub const MAX_DURATION_SECS: u64 = 30 * 24 * 60 * 60;

/// Application configuration
#[derive(Clone)]
pub struct AppConfig {
    /// Platform API key (OAuth client id, session token audience)
    pub api_key: String,
    api_secret: String,
    encryption_key: String,
    /// Public base URL of this app
    pub app_url: String,
    /// OAuth scopes requested on install
    pub scopes: Vec<String>,
    /// Tenant API requests allowed per `api_rate_window`
    pub api_rate_limit: u32,
    pub api_rate_window: Duration,
    /// Install/callback attempts allowed per IP per `auth_rate_window`
    pub auth_rate_limit: u32,
    pub auth_rate_window: Duration,
    /// Upstream point budget per tenant per `budget_window`
    pub budget_max_cost: i64,
    pub budget_window: Duration,
    /// Remaining-points threshold below which a warning is emitted
    pub budget_warn_threshold: i64,
    /// Default TTL for cached upstream reads
    pub cache_ttl: Duration,
    /// Interval of the maintenance sweeper
    pub sweep_interval: Duration,
    /// Allowed clock skew when checking session token times
    pub session_leeway: Duration,
    /// Upper bound on webhook APPLY work
    pub webhook_timeout: Duration,
    /// How long processed webhook ids are remembered
    pub webhook_dedup_ttl: Duration,
    /// Timeout for a single upstream request
    pub upstream_timeout: Duration,
    /// Retries for transient upstream failures
    pub upstream_max_retries: u32,
}

// Secrets stay out of Debug output.
impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .field("encryption_key", &"<redacted>")
            .field("app_url", &self.app_url)
            .field("scopes", &self.scopes)
            .field("api_rate_limit", &self.api_rate_limit)
            .field("auth_rate_limit", &self.auth_rate_limit)
            .field("budget_max_cost", &self.budget_max_cost)
            .field("cache_ttl", &self.cache_ttl)
            .finish_non_exhaustive()
    }
}

impl AppConfig {
    /// Build a configuration with default tuning for the given secrets.
    pub fn new(
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        encryption_key: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            encryption_key: encryption_key.into(),
            app_url: "http://localhost:3000".to_string(),
            scopes: vec!["read_products".to_string()],
            api_rate_limit: 100,
            api_rate_window: Duration::from_secs(60),
            auth_rate_limit: 10,
            auth_rate_window: Duration::from_secs(15 * 60),
            budget_max_cost: 1000,
            budget_window: Duration::from_secs(60),
            budget_warn_threshold: 100,
            cache_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(300),
            session_leeway: Duration::from_secs(5),
            webhook_timeout: Duration::from_secs(4),
            webhook_dedup_ttl: Duration::from_secs(24 * 60 * 60),
            upstream_timeout: Duration::from_secs(10),
            upstream_max_retries: 3,
        }
    }

    /// Load configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] when a required secret is absent and
    /// [`ConfigError::Invalid`] when a value cannot be used.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = required("SHOPIFY_API_KEY")?;
        let api_secret = required("SHOPIFY_API_SECRET")?;
        let encryption_key = required("SHOPGUARD_ENCRYPTION_KEY")?;

        if encryption_key.len() < MIN_ENCRYPTION_KEY_LEN {
            return Err(ConfigError::Invalid {
                name: "SHOPGUARD_ENCRYPTION_KEY",
                reason: format!("must be at least {MIN_ENCRYPTION_KEY_LEN} characters"),
            });
        }

        let mut config = Self::new(api_key, api_secret, encryption_key);

        if let Ok(url) = env::var("SHOPGUARD_APP_URL") {
            let parsed = url::Url::parse(&url).map_err(|e| ConfigError::Invalid {
                name: "SHOPGUARD_APP_URL",
                reason: e.to_string(),
            })?;
            if parsed.scheme() != "https" {
                warn!("SHOPGUARD_APP_URL is not https; only use this for local development");
            }
            config.app_url = url.trim_end_matches('/').to_string();
        }

        if let Ok(scopes) = env::var("SHOPIFY_SCOPES") {
            config.scopes = scopes
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        config.api_rate_limit = positive("SHOPGUARD_API_RATE_LIMIT", config.api_rate_limit)?;
        config.auth_rate_limit = positive("SHOPGUARD_AUTH_RATE_LIMIT", config.auth_rate_limit)?;
        config.budget_max_cost = positive("SHOPGUARD_BUDGET_MAX_COST", config.budget_max_cost)?;
        config.budget_window = seconds("SHOPGUARD_BUDGET_WINDOW_SECS", config.budget_window)?;
        config.cache_ttl = seconds("SHOPGUARD_CACHE_TTL_SECS", config.cache_ttl)?;
        config.sweep_interval = seconds("SHOPGUARD_SWEEP_INTERVAL_SECS", config.sweep_interval)?;

        info!(
            api_rate_limit = config.api_rate_limit,
            auth_rate_limit = config.auth_rate_limit,
            budget_max_cost = config.budget_max_cost,
            cache_ttl_secs = config.cache_ttl.as_secs(),
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Shared secret for HMAC and session token verification
    pub fn api_secret(&self) -> &str {
        &self.api_secret
    }

    /// Key material for the credential vault
    pub fn encryption_key(&self) -> &str {
        &self.encryption_key
    }

    /// Set the public app URL
    pub fn with_app_url(mut self, url: impl Into<String>) -> Self {
        self.app_url = url.into();
        self
    }

    /// Set the tenant API rate limit
    pub fn with_api_rate_limit(mut self, max_requests: u32, window: Duration) -> Self {
        self.api_rate_limit = max_requests;
        self.api_rate_window = window;
        self
    }

    /// Set the install flow rate limit
    pub fn with_auth_rate_limit(mut self, max_requests: u32, window: Duration) -> Self {
        self.auth_rate_limit = max_requests;
        self.auth_rate_window = window;
        self
    }

    /// Set the upstream budget
    pub fn with_budget(mut self, max_cost: i64, window: Duration) -> Self {
        self.budget_max_cost = max_cost;
        self.budget_window = window;
        self
    }

    /// Set the default cache TTL
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Set the webhook APPLY timeout
    pub fn with_webhook_timeout(mut self, timeout: Duration) -> Self {
        self.webhook_timeout = timeout;
        self
    }

    /// Set upstream retry count
    pub fn with_upstream_retries(mut self, retries: u32) -> Self {
        self.upstream_max_retries = retries;
        self
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(name)),
    }
}

fn positive<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default + Copy,
    T::Err: fmt::Display,
{
    let Ok(raw) = env::var(name) else {
        return Ok(default);
    };

    let value = raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        name,
        reason: e.to_string(),
    })?;

    if value <= T::default() {
        return Err(ConfigError::Invalid {
            name,
            reason: "must be greater than zero".to_string(),
        });
    }

    Ok(value)
}

/// A positive `*_SECS` variable no larger than [`MAX_DURATION_SECS`]
fn seconds(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    let secs = positive(name, default.as_secs())?;
    within_max_duration(name, secs).map(Duration::from_secs)
}

fn within_max_duration(name: &'static str, secs: u64) -> Result<u64, ConfigError> {
    if secs > MAX_DURATION_SECS {
        return Err(ConfigError::Invalid {
            name,
            reason: format!("must be at most {MAX_DURATION_SECS} seconds"),
        });
    }
    Ok(secs)
}
