//! Error types for Shopguard
//!
//! Every subsystem has its own `thiserror` enum; they fold into [`Error`],
//! which carries an [`ErrorKind`] and renders as the structured
//! `{error, code, kind, retryable}` JSON body used by every API response.

use std::time::Duration;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// The main error type for Shopguard operations
#[derive(Error, Debug)]
pub enum Error {
    /// Caller could not be authenticated or the tenant is not usable
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// HMAC verification failed. Terminal, never retried.
    #[error("Signature error: {0}")]
    Signature(#[from] SignatureError),

    /// Fixed-window request limit reached
    #[error("Rate limit exceeded: {limit} requests per window")]
    RateLimitExceeded {
        /// Configured limit for the window
        limit: u32,
        /// Time until the window resets
        retry_after: Duration,
    },

    /// Upstream point-cost budget exhausted for the tenant
    #[error("Upstream cost budget exhausted ({remaining} points remaining)")]
    BudgetExceeded {
        /// Remaining points at the time of the check
        remaining: i64,
        /// Time until the budget window resets
        retry_after: Duration,
    },

    /// Inbound payload could not be parsed
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Credential encryption or decryption failed
    #[error("Credential vault error: {0}")]
    Vault(#[from] VaultError),

    /// Tenant directory I/O failed
    #[error("Tenant directory error: {0}")]
    Directory(#[from] DirectoryError),

    /// Cache layer failure
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Rate limiter backing store failure
    #[error("Rate limiter error: {0}")]
    RateLimiter(#[from] RateLimitStoreError),

    /// Startup configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Upstream platform call failed
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with message
    #[error("{0}")]
    Internal(String),
}

/// Result type alias for Shopguard operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`], stable across releases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Auth,
    Signature,
    RateLimit,
    Budget,
    MalformedPayload,
    Cache,
    RateLimiter,
    Config,
    Upstream,
    Internal,
}

/// Authentication failure codes surfaced to API callers.
///
/// The code is intentionally coarse: it never reveals which credential field
/// failed validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Session token missing, malformed, expired or badly signed
    #[error("invalid or missing session")]
    InvalidSession,

    /// Neither a session token nor a shop parameter was supplied
    #[error("authentication required")]
    AuthRequired,

    /// The shop domain is not a well-formed platform domain
    #[error("invalid shop domain")]
    InvalidShop,

    /// No tenant is installed for the domain
    #[error("shop not found")]
    ShopNotFound,

    /// The tenant exists but has uninstalled the app
    #[error("shop has uninstalled the app")]
    ShopUninstalled,

    /// The tenant is not usable (shop-parameter path; does not say why)
    #[error("shop is not valid")]
    ShopInvalid,

    /// The stored access token can no longer be decrypted; reinstall required
    #[error("stored credentials are unreadable")]
    TokenDecryptFailed,

    /// Unexpected failure while authenticating
    #[error("authentication failed")]
    Unexpected,
}

impl AuthError {
    /// Machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidSession | Self::Unexpected => "AUTH_ERROR",
            Self::AuthRequired => "AUTH_REQUIRED",
            Self::InvalidShop => "INVALID_SHOP",
            Self::ShopNotFound => "SHOP_NOT_FOUND",
            Self::ShopUninstalled => "SHOP_UNINSTALLED",
            Self::ShopInvalid => "SHOP_INVALID",
            Self::TokenDecryptFailed => "TOKEN_DECRYPT_FAILED",
        }
    }

    /// HTTP status for API flows
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidSession | Self::AuthRequired | Self::TokenDecryptFailed => {
                StatusCode::UNAUTHORIZED
            }
            Self::InvalidShop => StatusCode::BAD_REQUEST,
            Self::ShopNotFound | Self::ShopInvalid => StatusCode::NOT_FOUND,
            Self::ShopUninstalled => StatusCode::FORBIDDEN,
            Self::Unexpected => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a browser flow should send the merchant back through install
    pub fn requires_reinstall(&self) -> bool {
        matches!(
            self,
            Self::ShopNotFound | Self::ShopUninstalled | Self::ShopInvalid | Self::TokenDecryptFailed
        )
    }
}

/// HMAC verification failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("invalid hmac")]
    InvalidHmac,

    /// OAuth `state` nonce unknown, expired or already used
    #[error("invalid oauth state")]
    InvalidState,
}

impl SignatureError {
    /// Machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidHmac => "INVALID_HMAC",
            Self::InvalidState => "INVALID_STATE",
        }
    }
}

/// Credential vault errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VaultError {
    /// Refusing to encrypt an empty token
    #[error("token must not be empty")]
    InvalidInput,

    /// Ciphertext is corrupt or was produced under a different key
    #[error("ciphertext could not be decrypted")]
    Decryption,

    /// Key material is unusable
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),
}

/// Tenant directory errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("tenant store unavailable: {0}")]
    Unavailable(String),

    #[error("tenant store rejected write: {0}")]
    WriteFailed(String),
}

/// Cache layer errors. Always recovered locally.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Backend(String),

    #[error("cache value could not be encoded: {0}")]
    Encode(String),

    #[error("cache value could not be decoded: {0}")]
    Decode(String),

    #[error("invalid cache pattern: {0}")]
    Pattern(String),
}

/// Rate limiter backing store errors. Always recovered by failing open.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RateLimitStoreError {
    #[error("rate limit store unavailable: {0}")]
    Unavailable(String),
}

/// Configuration errors. Fatal at startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} environment variable not set")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid {
        /// Variable name
        name: &'static str,
        /// Why it was rejected
        reason: String,
    },
}

/// Structured error body returned by API flows
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub error: String,
    pub code: String,
    pub kind: ErrorKind,
    pub retryable: bool,
}

impl Error {
    /// Create a generic internal error from a string
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    /// Create an upstream error from a string
    pub fn upstream<S: Into<String>>(msg: S) -> Self {
        Error::Upstream(msg.into())
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Auth(_) | Error::Vault(VaultError::Decryption) => ErrorKind::Auth,
            Error::Signature(_) => ErrorKind::Signature,
            Error::RateLimitExceeded { .. } => ErrorKind::RateLimit,
            Error::BudgetExceeded { .. } => ErrorKind::Budget,
            Error::MalformedPayload(_) | Error::Json(_) => ErrorKind::MalformedPayload,
            Error::Cache(_) => ErrorKind::Cache,
            Error::RateLimiter(_) => ErrorKind::RateLimiter,
            Error::Config(_) => ErrorKind::Config,
            Error::Upstream(_) => ErrorKind::Upstream,
            Error::Vault(_) | Error::Directory(_) | Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the caller may retry the same request later
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Error::RateLimitExceeded { .. }
                | Error::BudgetExceeded { .. }
                | Error::Upstream(_)
                | Error::Directory(_)
                | Error::Cache(_)
                | Error::RateLimiter(_)
        )
    }

    /// Machine-readable code for the response body
    pub fn code(&self) -> &'static str {
        match self {
            Error::Auth(auth) => auth.code(),
            Error::Vault(VaultError::Decryption) => AuthError::TokenDecryptFailed.code(),
            Error::Signature(sig) => sig.code(),
            Error::RateLimitExceeded { .. } => "RATE_LIMITED",
            Error::BudgetExceeded { .. } => "BUDGET_EXCEEDED",
            Error::MalformedPayload(_) | Error::Json(_) => "MALFORMED_PAYLOAD",
            Error::Upstream(_) => "UPSTREAM_ERROR",
            _ => "INTERNAL_ERROR",
        }
    }

    /// HTTP status for API flows
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Auth(auth) => auth.status(),
            Error::Vault(VaultError::Decryption) => AuthError::TokenDecryptFailed.status(),
            Error::Signature(_) => StatusCode::FORBIDDEN,
            Error::RateLimitExceeded { .. } | Error::BudgetExceeded { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            Error::MalformedPayload(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
            Error::Upstream(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Time the caller should wait before retrying, if throttled
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimitExceeded { retry_after, .. }
            | Error::BudgetExceeded { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Build the structured response body.
    ///
    /// Internal details are not echoed for server-side failures.
    pub fn payload(&self) -> ErrorPayload {
        let message = match self {
            Error::Auth(auth) => auth.to_string(),
            Error::Vault(VaultError::Decryption) => AuthError::TokenDecryptFailed.to_string(),
            Error::Signature(_)
            | Error::RateLimitExceeded { .. }
            | Error::BudgetExceeded { .. }
            | Error::MalformedPayload(_) => self.to_string(),
            Error::Upstream(_) => "Upstream platform request failed".to_string(),
            _ => "Internal server error".to_string(),
        };

        ErrorPayload {
            error: message,
            code: self.code().to_string(),
            kind: self.kind(),
            retryable: self.retryable(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, kind = ?self.kind(), "Request failed");
        }

        let retry_after = self.retry_after();
        let mut response = (status, Json(self.payload())).into_response();

        if let Some(wait) = retry_after {
            let secs = wait.as_secs().max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        Error::Auth(self).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_error_status_table() {
        assert_eq!(AuthError::InvalidSession.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AuthError::AuthRequired.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AuthError::InvalidShop.status(), StatusCode::BAD_REQUEST);
        assert_eq!(AuthError::ShopNotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(AuthError::ShopInvalid.status(), StatusCode::NOT_FOUND);
        assert_eq!(AuthError::ShopUninstalled.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            AuthError::Unexpected.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_auth_error_codes() {
        assert_eq!(AuthError::InvalidSession.code(), "AUTH_ERROR");
        assert_eq!(AuthError::Unexpected.code(), "AUTH_ERROR");
        assert_eq!(AuthError::AuthRequired.code(), "AUTH_REQUIRED");
        assert_eq!(AuthError::TokenDecryptFailed.code(), "TOKEN_DECRYPT_FAILED");
    }

    #[test]
    fn test_decryption_failure_is_reinstall_not_transient() {
        let err = Error::Vault(VaultError::Decryption);
        assert_eq!(err.kind(), ErrorKind::Auth);
        assert_eq!(err.code(), "TOKEN_DECRYPT_FAILED");
        assert!(!err.retryable());
    }

    #[test]
    fn test_payload_hides_internal_details() {
        let err = Error::Directory(DirectoryError::Unavailable("pg: conn refused".into()));
        let payload = err.payload();
        assert_eq!(payload.error, "Internal server error");
        assert!(payload.retryable);
        assert_eq!(payload.kind, ErrorKind::Internal);
    }

    #[test]
    fn test_rate_limit_response_sets_retry_after() {
        let err = Error::RateLimitExceeded {
            limit: 10,
            retry_after: Duration::from_secs(42),
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            "42"
        );
    }

    #[test]
    fn test_signature_error_is_terminal() {
        let err = Error::from(SignatureError::InvalidHmac);
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert!(!err.retryable());
    }
}
