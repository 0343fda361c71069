//! Fixed-window rate limiting keyed by limiter, tenant-or-IP and endpoint.
//!
//! # Fail-open policy
//!
//! Protection is best-effort. When the backing [`RateLimitStore`] fails, the
//! request is **allowed**, a `warn!` is emitted on the `shopguard::monitor`
//! target and the fail-open counter is bumped. The limiter must never be the
//! cause of an outage.
//!
//! ```text
//! Request -> key(limiter, subject, endpoint) -> store.increment -> count <= max ?
//!                                                   |                  |
//!                                              store error         429 + headers
//!                                                   v
//!                                              allow (fail open)
//! ```
//!
//! [`rejected_request_guard`] reuses the same limiter in front of the auth
//! layer, counting only rejected requests per client IP.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{ConnectInfo, MatchedPath, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::auth::AuthContext;
use crate::deadline::{expires_after, MAX_TTL};
use crate::error::{Error, RateLimitStoreError};
use crate::metrics::Metrics;
use crate::tenant::ShopDomain;

/// Count observed for a key in its current window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Requests seen in the window, including this one
    pub count: u32,
    /// When the window ends
    pub reset_at: Instant,
}

/// Backing store for window counters.
///
/// `increment` must be atomic per key: concurrent calls for the same key
/// must observe distinct counts.
#[async_trait]
pub trait RateLimitStore: Send + Sync + 'static {
    /// Count one request for `key`, opening a new window if the current one
    /// has passed.
    async fn increment(&self, key: &str, window: Duration)
        -> Result<WindowCount, RateLimitStoreError>;

    /// Count in the open window for `key` without counting a request.
    /// `None` when no window is open.
    async fn current(&self, key: &str) -> Result<Option<WindowCount>, RateLimitStoreError>;

    /// Drop counters whose window has passed. Returns how many were removed.
    async fn purge_expired(&self) -> usize {
        0
    }
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    count: u32,
    reset_at: Instant,
}

/// In-process counter store
#[derive(Debug, Default)]
pub struct MemoryRateLimitStore {
    counters: DashMap<String, Counter>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn increment(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<WindowCount, RateLimitStoreError> {
        let now = Instant::now();

        // The entry guard holds the shard lock for the whole read-modify-write.
        let mut counter = self.counters.entry(key.to_string()).or_insert(Counter {
            count: 0,
            reset_at: expires_after(now, window),
        });

        if now > counter.reset_at {
            *counter = Counter {
                count: 0,
                reset_at: expires_after(now, window),
            };
        }

        counter.count = counter.count.saturating_add(1);

        Ok(WindowCount {
            count: counter.count,
            reset_at: counter.reset_at,
        })
    }

    async fn current(&self, key: &str) -> Result<Option<WindowCount>, RateLimitStoreError> {
        let now = Instant::now();
        Ok(self
            .counters
            .get(key)
            .filter(|counter| now <= counter.reset_at)
            .map(|counter| WindowCount {
                count: counter.count,
                reset_at: counter.reset_at,
            }))
    }

    async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let stale: Vec<String> = self
            .counters
            .iter()
            .filter(|entry| now > entry.reset_at)
            .map(|entry| entry.key().clone())
            .collect();

        stale
            .into_iter()
            .filter(|key| self.counters.remove_if(key, |_, c| now > c.reset_at).is_some())
            .count()
    }
}

/// Who is being limited
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateLimitSubject {
    /// Authenticated request, keyed by tenant
    Tenant(ShopDomain),
    /// Unauthenticated request, keyed by client IP
    Ip(IpAddr),
    /// Client address unknown
    Anonymous,
}

impl fmt::Display for RateLimitSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tenant(shop) => write!(f, "shop:{shop}"),
            Self::Ip(ip) => write!(f, "ip:{ip}"),
            Self::Anonymous => f.write_str("anonymous"),
        }
    }
}

/// Caller details attached to violation events
#[derive(Debug, Clone, Default)]
pub struct CallerInfo {
    pub ip: Option<IpAddr>,
    pub user_agent: Option<String>,
}

/// Outcome of a rate limit check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub count: u32,
    pub remaining: u32,
    /// Time until the window resets
    pub reset_after: Duration,
    /// Wall-clock reset time
    pub reset_at: DateTime<Utc>,
    /// True when the store failed and the request was let through
    pub degraded: bool,
}

impl RateLimitDecision {
    /// Check if the request is allowed
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    /// Rate limit response headers
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_at.timestamp().to_string()),
            (
                "X-RateLimit-Reset-Ms",
                self.reset_at.timestamp_millis().to_string(),
            ),
        ];
        if !self.allowed {
            headers.push((
                "Retry-After",
                self.reset_after.as_secs().max(1).to_string(),
            ));
        }
        headers
    }

    /// Convert a rejection into [`Error::RateLimitExceeded`]
    pub fn into_result(self) -> Result<Self, Error> {
        if self.allowed {
            Ok(self)
        } else {
            Err(Error::RateLimitExceeded {
                limit: self.limit,
                retry_after: self.reset_after,
            })
        }
    }

    /// Write the rate limit headers onto a header map
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        for (name, value) in self.headers() {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                headers.insert(name, value);
            }
        }
    }
}

/// A named fixed-window limiter
#[derive(Clone)]
pub struct RateLimiter {
    name: String,
    max_requests: u32,
    window: Duration,
    store: Arc<dyn RateLimitStore>,
    metrics: Option<Arc<Metrics>>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("max_requests", &self.max_requests)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Create a limiter over the given store
    pub fn new(
        name: impl Into<String>,
        max_requests: u32,
        window: Duration,
        store: Arc<dyn RateLimitStore>,
    ) -> Self {
        Self {
            name: name.into(),
            max_requests,
            window,
            store,
            metrics: None,
        }
    }

    /// Attach a metrics sink
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn store(&self) -> &Arc<dyn RateLimitStore> {
        &self.store
    }

    fn key(&self, subject: &RateLimitSubject, endpoint: &str) -> String {
        format!("{}:{}:{}", self.name, subject, endpoint)
    }

    /// Count a request and decide whether it may proceed
    pub async fn check(
        &self,
        subject: &RateLimitSubject,
        endpoint: &str,
        caller: &CallerInfo,
    ) -> RateLimitDecision {
        let key = self.key(subject, endpoint);
        let counted = self.store.increment(&key, self.window).await.map(Some);
        self.decide(&key, subject, endpoint, caller, counted, 0)
    }

    /// Decide whether one more request may proceed, without counting it
    pub async fn peek(
        &self,
        subject: &RateLimitSubject,
        endpoint: &str,
        caller: &CallerInfo,
    ) -> RateLimitDecision {
        let key = self.key(subject, endpoint);
        let current = self.store.current(&key).await;
        self.decide(&key, subject, endpoint, caller, current, 1)
    }

    /// `pending` requests are added to the stored count before comparing
    fn decide(
        &self,
        key: &str,
        subject: &RateLimitSubject,
        endpoint: &str,
        caller: &CallerInfo,
        counted: Result<Option<WindowCount>, RateLimitStoreError>,
        pending: u32,
    ) -> RateLimitDecision {
        let counted = match counted {
            Ok(counted) => counted,
            Err(e) => {
                warn!(
                    target: "shopguard::monitor",
                    limiter = %self.name,
                    subject = %subject,
                    error = %e,
                    "Rate limiter store failed; allowing request"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_fail_open();
                }
                return RateLimitDecision {
                    allowed: true,
                    limit: self.max_requests,
                    count: 0,
                    remaining: self.max_requests,
                    reset_after: self.window.min(MAX_TTL),
                    reset_at: wall_clock_after(self.window.min(MAX_TTL)),
                    degraded: true,
                };
            }
        };

        let (count, reset_after) = match counted {
            Some(counted) => (
                counted.count,
                counted.reset_at.saturating_duration_since(Instant::now()),
            ),
            None => (0, self.window.min(MAX_TTL)),
        };
        let allowed = count.saturating_add(pending) <= self.max_requests;
        let decision = RateLimitDecision {
            allowed,
            limit: self.max_requests,
            count,
            remaining: self.max_requests.saturating_sub(count),
            reset_after,
            reset_at: wall_clock_after(reset_after),
            degraded: false,
        };

        if allowed {
            debug!(limiter = %self.name, key = %key, count, "Rate limit check passed");
        } else {
            warn!(
                target: "shopguard::monitor",
                limiter = %self.name,
                subject = %subject,
                endpoint = endpoint,
                count,
                limit = self.max_requests,
                ip = ?caller.ip,
                user_agent = ?caller.user_agent,
                "Rate limit exceeded"
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_rate_limited(&self.name);
            }
        }

        decision
    }
}

fn wall_clock_after(delay: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(delay.min(MAX_TTL))
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(now)
}

/// Extract client IP from request, considering proxy headers.
pub fn extract_client_ip(headers: &HeaderMap, fallback: Option<SocketAddr>) -> Option<IpAddr> {
    if let Some(forwarded_for) = headers.get("x-forwarded-for").and_then(|h| h.to_str().ok()) {
        // X-Forwarded-For can contain multiple IPs, take the first one
        if let Some(first_ip) = forwarded_for.split(',').next() {
            if let Ok(ip) = first_ip.trim().parse() {
                return Some(ip);
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|h| h.to_str().ok()) {
        if let Ok(ip) = real_ip.trim().parse() {
            return Some(ip);
        }
    }

    fallback.map(|addr| addr.ip())
}

/// Caller details for a request
pub fn caller_info(request: &Request) -> CallerInfo {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    CallerInfo {
        ip: extract_client_ip(request.headers(), peer),
        user_agent: request
            .headers()
            .get(axum::http::header::USER_AGENT)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string),
    }
}

/// Rate limiting middleware.
///
/// Keys authenticated requests by tenant (the [`AuthContext`] must already be
/// in the request extensions) and everything else by client IP. Allowed
/// responses carry informational headers; rejections are `429` with
/// `Retry-After`.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let caller = caller_info(&request);
    let subject = match request.extensions().get::<AuthContext>() {
        Some(auth) => RateLimitSubject::Tenant(auth.tenant_domain.clone()),
        None => caller
            .ip
            .map(RateLimitSubject::Ip)
            .unwrap_or(RateLimitSubject::Anonymous),
    };
    let endpoint = endpoint_of(&request);

    let decision = limiter.check(&subject, &endpoint, &caller).await;

    let mut response = match decision.clone().into_result() {
        Ok(_) => next.run(request).await,
        Err(err) => err.into_response(),
    };
    decision.apply_headers(response.headers_mut());
    response
}

/// Per-IP guard for routes behind authentication.
///
/// Layered outside the auth middleware. Only rejected requests are counted
/// (see [`is_rejection`]); once a client IP has filled the window, further
/// requests get `429` before authentication runs and never reach the tenant
/// directory. Requests that succeed pass through without headers, leaving
/// the tenant-keyed limiter's headers intact.
pub async fn rejected_request_guard(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let caller = caller_info(&request);
    let subject = caller
        .ip
        .map(RateLimitSubject::Ip)
        .unwrap_or(RateLimitSubject::Anonymous);
    let endpoint = endpoint_of(&request);

    let decision = limiter.peek(&subject, &endpoint, &caller).await;
    if let Err(err) = decision.clone().into_result() {
        let mut response = err.into_response();
        decision.apply_headers(response.headers_mut());
        return response;
    }

    let response = next.run(request).await;
    if is_rejection(response.status()) {
        limiter.check(&subject, &endpoint, &caller).await;
    }
    response
}

/// Statuses the auth layer answers with for bad or unknown credentials
pub fn is_rejection(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_REQUEST
            | StatusCode::UNAUTHORIZED
            | StatusCode::FORBIDDEN
            | StatusCode::NOT_FOUND
    )
}

fn endpoint_of(request: &Request) -> String {
    request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string())
}
