//! CORS for the embedded admin surface
//!
//! The app runs inside the platform admin, so browser calls come from
//! `https://admin.shopify.com` or a tenant's own `https://<name>.myshopify.com`.
//! Local development origins can be enabled through [`CorsConfig`].

use std::time::Duration;

use http::header::{HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use http::Method;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::tenant::ShopDomain;

/// Admin origin the embedded app is framed by
pub const ADMIN_ORIGIN: &str = "https://admin.shopify.com";

pub const ALLOWED_HEADERS: [HeaderName; 2] = [CONTENT_TYPE, AUTHORIZATION];

pub const ALLOWED_METHODS: [Method; 3] = [Method::GET, Method::POST, Method::OPTIONS];

/// Rate-limit headers readable by the embedded frontend
pub const EXPOSED_HEADERS: [&str; 4] = [
    "x-ratelimit-limit",
    "x-ratelimit-remaining",
    "x-ratelimit-reset",
    "retry-after",
];

pub const DEFAULT_MAX_AGE_SECS: u64 = 3600;

#[derive(Debug, Clone)]
pub struct CorsConfig {
    /// Also accept `http(s)://localhost[:port]` and `127.0.0.1`
    pub allow_localhost: bool,
    pub max_age_secs: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allow_localhost: false,
            max_age_secs: DEFAULT_MAX_AGE_SECS,
        }
    }
}

impl CorsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_localhost(mut self, allow: bool) -> Self {
        self.allow_localhost = allow;
        self
    }

    pub fn with_max_age(mut self, secs: u64) -> Self {
        self.max_age_secs = secs;
        self
    }
}

/// Layer with the default configuration
pub fn cors_layer() -> CorsLayer {
    cors_layer_with_config(CorsConfig::default())
}

pub fn cors_layer_with_config(config: CorsConfig) -> CorsLayer {
    let allow_localhost = config.allow_localhost;
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin, _| {
            is_platform_origin(origin) || (allow_localhost && is_localhost_origin(origin))
        }))
        .allow_methods(ALLOWED_METHODS)
        .allow_headers(ALLOWED_HEADERS)
        .expose_headers(EXPOSED_HEADERS.map(HeaderName::from_static))
        .max_age(Duration::from_secs(config.max_age_secs))
}

/// `https://admin.shopify.com` or `https://<valid shop domain>`
pub fn is_platform_origin(origin: &HeaderValue) -> bool {
    let Ok(origin) = origin.to_str() else {
        return false;
    };
    if origin.eq_ignore_ascii_case(ADMIN_ORIGIN) {
        return true;
    }
    origin
        .strip_prefix("https://")
        .is_some_and(|host| ShopDomain::parse(host).is_ok())
}

/// `http(s)://localhost` or `http(s)://127.0.0.1`, with an optional port
pub fn is_localhost_origin(origin: &HeaderValue) -> bool {
    let Ok(origin) = origin.to_str() else {
        return false;
    };
    let origin = origin.to_ascii_lowercase();
    let Some(rest) = origin
        .strip_prefix("http://")
        .or_else(|| origin.strip_prefix("https://"))
    else {
        return false;
    };

    let (host, port) = match rest.split_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (rest, None),
    };
    let valid_port = port.map_or(true, |p| p.parse::<u16>().is_ok());
    matches!(host, "localhost" | "127.0.0.1") && valid_port
}
