//! Operational endpoints: `/health`, `/status` and `/metrics`.
//!
//! ```text
//! request ──> track_requests ──> route ──> response
//!                   │
//!                   ▼
//!             ServerStats (latency histogram, request/error counters)
//! ```
//!
//! `/status` combines [`ServerStats`] with the protection counters from
//! [`Metrics`] and a sysinfo snapshot of the process. `/metrics` renders the
//! same counters in Prometheus text format.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use hdrhistogram::Histogram;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, instrument};

use crate::metrics::Metrics;

pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const SERVER_NAME: &str = env!("CARGO_PKG_NAME");

/// Content type of the Prometheus text exposition format
pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "healthy".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub name: String,
    pub uptime_seconds: u64,
    pub total_requests: u64,
    /// Responses with a 5xx status
    pub error_count: u64,
    pub protection: ProtectionSummary,
    pub memory: MemoryMetrics,
    pub latency: LatencyMetrics,
    pub status: String,
    pub timestamp: String,
}

/// What the middleware has refused or absorbed since startup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtectionSummary {
    pub auth_success: u64,
    pub rate_limited: u64,
    pub rate_limit_fail_open: u64,
    pub budget_rejections: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Hits over lookups, `None` before the first lookup
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_hit_ratio: Option<f64>,
    pub webhooks_processed: u64,
    pub webhooks_rejected: u64,
}

impl ProtectionSummary {
    pub fn from_metrics(metrics: &Metrics) -> Self {
        let cache_hits = metrics.cache_hits_total.load(Ordering::Relaxed);
        let cache_misses = metrics.cache_misses_total.load(Ordering::Relaxed);
        let lookups = cache_hits + cache_misses;
        Self {
            auth_success: metrics.auth_success_total.load(Ordering::Relaxed),
            rate_limited: metrics.rate_limited_total.load(Ordering::Relaxed),
            rate_limit_fail_open: metrics.rate_limit_fail_open_total.load(Ordering::Relaxed),
            budget_rejections: metrics.budget_rejections_total.load(Ordering::Relaxed),
            cache_hits,
            cache_misses,
            cache_hit_ratio: (lookups > 0).then(|| cache_hits as f64 / lookups as f64),
            webhooks_processed: metrics.webhooks("processed"),
            webhooks_rejected: metrics.webhooks("rejected"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryMetrics {
    pub rss_bytes: u64,
    pub virtual_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencyMetrics {
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub total_requests: u64,
    pub mean_ms: f64,
    pub max_ms: f64,
}

/// Request latency in microseconds, 1us to 60s at 3 significant figures
#[derive(Debug)]
pub struct LatencyHistogram {
    inner: RwLock<Histogram<u64>>,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        // Bounds are constant and valid, so construction cannot fail.
        let histogram = Histogram::new_with_bounds(1, 60_000_000, 3)
            .expect("constant histogram bounds are valid");
        Self {
            inner: RwLock::new(histogram),
        }
    }

    pub fn record_duration(&self, duration: std::time::Duration) {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        // Out-of-range samples are saturated into the top bucket
        self.inner.write().saturating_record(micros.max(1));
    }

    pub fn count(&self) -> u64 {
        self.inner.read().len()
    }

    pub fn metrics(&self) -> LatencyMetrics {
        let hist = self.inner.read();
        if hist.len() == 0 {
            return LatencyMetrics::default();
        }
        LatencyMetrics {
            p50_ms: hist.value_at_quantile(0.50) as f64 / 1000.0,
            p95_ms: hist.value_at_quantile(0.95) as f64 / 1000.0,
            p99_ms: hist.value_at_quantile(0.99) as f64 / 1000.0,
            total_requests: hist.len(),
            mean_ms: hist.mean() / 1000.0,
            max_ms: hist.max() as f64 / 1000.0,
        }
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-level request statistics
#[derive(Debug)]
pub struct ServerStats {
    start_time: Instant,
    latency: LatencyHistogram,
    total_requests: AtomicU64,
    error_count: AtomicU64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            latency: LatencyHistogram::new(),
            total_requests: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Record one finished request
    pub fn record_request(&self, duration: std::time::Duration, status: StatusCode) {
        self.latency.record_duration(duration);
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if status.is_server_error() {
            self.error_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn latency_metrics(&self) -> LatencyMetrics {
        self.latency.metrics()
    }

    pub fn to_prometheus_format(&self) -> String {
        let latency = self.latency_metrics();
        format!(
            "shopguard_uptime_seconds {}\n\
             shopguard_http_requests_total {}\n\
             shopguard_http_errors_total {}\n\
             shopguard_http_latency_p50_ms {}\n\
             shopguard_http_latency_p99_ms {}\n",
            self.uptime_seconds(),
            self.total_requests(),
            self.error_count(),
            latency.p50_ms,
            latency.p99_ms,
        )
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

fn collect_memory_metrics() -> MemoryMetrics {
    let pid = Pid::from_u32(std::process::id());
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

    match system.process(pid) {
        Some(process) => MemoryMetrics {
            rss_bytes: process.memory(),
            virtual_bytes: process.virtual_memory(),
        },
        None => {
            debug!("Could not find current process in sysinfo");
            MemoryMetrics::default()
        }
    }
}

/// Middleware feeding [`ServerStats`]
pub async fn track_requests(
    State(stats): State<Arc<ServerStats>>,
    request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let response = next.run(request).await;
    stats.record_request(started.elapsed(), response.status());
    response
}

#[instrument(skip_all)]
pub async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse::default()))
}

#[instrument(skip_all)]
pub async fn status_handler(
    State(stats): State<Arc<ServerStats>>,
    State(metrics): State<Arc<Metrics>>,
) -> impl IntoResponse {
    debug!("Status requested");

    let response = StatusResponse {
        version: SERVER_VERSION.to_string(),
        name: SERVER_NAME.to_string(),
        uptime_seconds: stats.uptime_seconds(),
        total_requests: stats.total_requests(),
        error_count: stats.error_count(),
        protection: ProtectionSummary::from_metrics(&metrics),
        memory: collect_memory_metrics(),
        latency: stats.latency_metrics(),
        status: "running".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    };

    (StatusCode::OK, Json(response))
}

#[instrument(skip_all)]
pub async fn metrics_handler(
    State(stats): State<Arc<ServerStats>>,
    State(metrics): State<Arc<Metrics>>,
) -> impl IntoResponse {
    let mut body = metrics.to_prometheus_format();
    body.push_str(&stats.to_prometheus_format());
    ([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], body)
}
