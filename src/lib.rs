//! Shopguard - tenant authentication, abuse protection and caching for
//! multi-tenant Shopify apps.
//!
//! One deployment serves many merchant tenants. Every request is resolved to
//! a tenant, checked against per-tenant limits and served from a shared
//! cache, while lifecycle webhooks keep tenant state current.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────┐
//! request ──────▶ │ Authenticator│──▶ TenantDirectory
//!                 └──────┬───────┘
//!                        ▼
//!                 ┌──────────────┐     ┌──────────────┐
//!                 │ RateLimiter  │     │ BudgetTracker│──▶ upstream API
//!                 └──────┬───────┘     └──────────────┘       (RetryExecutor)
//!                        ▼
//!                     handler ◀──────▶ CacheStore
//!
//! webhook ──▶ HmacVerifier ──▶ WebhookProcessor ──▶ TenantDirectory, CacheStore
//! install ──▶ HmacVerifier ──▶ InstallFlow ──▶ CredentialVault ──▶ TenantDirectory
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use shopguard::app::{router, spawn_sweeper, AppState};
//! use shopguard::config::AppConfig;
//! use shopguard::oauth::HttpPlatformClient;
//! use shopguard::tenant::MemoryTenantDirectory;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::from_env()?;
//!     let client = HttpPlatformClient::new(
//!         config.api_key.clone(),
//!         config.api_secret(),
//!         config.upstream_timeout,
//!     )?;
//!     let state = AppState::from_config(
//!         config,
//!         Arc::new(MemoryTenantDirectory::new()),
//!         Arc::new(client),
//!     )?;
//!     spawn_sweeper(state.clone());
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
//!     axum::serve(listener, router(state)).await?;
//!     Ok(())
//! }
//! ```

#![warn(rustdoc::missing_crate_level_docs)]

pub mod app;
pub mod auth;
pub mod cache;
pub mod config;
pub mod cors;
pub mod deadline;
pub mod error;
pub mod handlers;
pub mod limits;
pub mod metrics;
pub mod oauth;
pub mod retry;
pub mod signature;
pub mod tenant;
pub mod vault;
pub mod webhook;

// Re-exports for convenience
pub use app::{router, AppState};
pub use auth::{AuthContext, Authenticator, SessionResolver};
pub use cache::CacheStore;
pub use config::AppConfig;
pub use error::{Error, Result};
pub use limits::{BudgetTracker, RateLimiter};
pub use metrics::Metrics;
pub use retry::{with_retry, RetryExecutor, RetryPolicy};
pub use signature::HmacVerifier;
pub use tenant::{MemoryTenantDirectory, ShopDomain, TenantDirectory};
pub use vault::CredentialVault;
pub use webhook::WebhookProcessor;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
