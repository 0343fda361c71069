//! Platform Webhook Processing
//!
//! Lifecycle notifications from the platform, verified against the raw body
//! and applied idempotently.
//!
//! # Flow
//!
//! ```text
//! POST /webhooks -> HMAC verify -> parse -> de-duplicate -> apply -> ack
//! ```
//!
//! - `app/uninstalled` soft-deletes the tenant and drops its cache entries
//! - `products/*` invalidates the tenant's product cache
//! - `shop/update` invalidates the tenant's shop metadata cache
//! - privacy topics are acknowledged and logged
//! - anything else is acknowledged without changes

pub mod events;
pub mod handler;
pub mod idempotency;
pub mod processor;

pub use events::{WebhookEvent, WebhookTopic};
pub use handler::webhook_handler;
pub use idempotency::{DeliveryDecision, DeliveryStatus, IdempotencyStore, InMemoryIdempotencyStore};
pub use processor::{WebhookDelivery, WebhookOutcome, WebhookProcessor};
