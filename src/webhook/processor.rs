//! Webhook processing state machine
//!
//! ```text
//! RECEIVED
//!    |
//!    v
//! [HMAC verify] ---- fail ----> 403, terminal
//!    |
//!    v
//! [Parse] ---------- fail ----> 200, no mutation
//!    |
//!    v
//! [Idempotency] ---- completed -> 200 (duplicate)
//!    |
//!    v
//! [Apply w/ timeout] fail ----> 500, sender retries
//!    |
//!    v
//! ACK 200
//! ```
//!
//! Every APPLY effect is idempotent on its own: uninstall only sets
//! `uninstalled_at` when unset and pattern invalidation of already-removed
//! keys removes nothing. The idempotency store only saves repeated work.

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use chrono::Utc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::cache::{keys, CacheStore};
use crate::error::Error;
use crate::metrics::Metrics;
use crate::signature::HmacVerifier;
use crate::tenant::{ShopDomain, TenantDirectory, UninstallOutcome};
use crate::webhook::events::{WebhookEvent, WebhookTopic};
use crate::webhook::idempotency::{DeliveryDecision, IdempotencyStore};

/// One inbound delivery, borrowed from the HTTP request
#[derive(Debug, Clone, Copy, Default)]
pub struct WebhookDelivery<'a> {
    /// Exact bytes received
    pub raw_body: &'a [u8],
    /// Base64 HMAC header
    pub signature: Option<&'a str>,
    /// Sending tenant's domain header
    pub shop_domain: Option<&'a str>,
    pub topic: Option<&'a str>,
    /// Platform delivery id, used for de-duplication
    pub webhook_id: Option<&'a str>,
}

/// Terminal state of a delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// APPLY ran to completion
    Processed(WebhookTopic),
    /// Already processed under the same delivery id
    Duplicate,
    /// Payload could not be parsed; acked without mutation
    Malformed(String),
    /// Signature missing or wrong
    Rejected,
    /// APPLY failed or timed out; the sender should retry
    Failed(String),
}

impl WebhookOutcome {
    /// HTTP status to answer the sender with
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Processed(_) | Self::Duplicate | Self::Malformed(_) => StatusCode::OK,
            Self::Rejected => StatusCode::FORBIDDEN,
            Self::Failed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Metric label
    pub fn label(&self) -> &'static str {
        match self {
            Self::Processed(_) => "processed",
            Self::Duplicate => "duplicate",
            Self::Malformed(_) => "malformed",
            Self::Rejected => "rejected",
            Self::Failed(_) => "failed",
        }
    }
}

/// Verifies, parses and applies webhook deliveries
#[derive(Clone)]
pub struct WebhookProcessor {
    verifier: HmacVerifier,
    directory: Arc<dyn TenantDirectory>,
    cache: CacheStore,
    idempotency: Arc<dyn IdempotencyStore>,
    metrics: Arc<Metrics>,
    apply_timeout: Duration,
}

impl std::fmt::Debug for WebhookProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookProcessor")
            .field("apply_timeout", &self.apply_timeout)
            .finish_non_exhaustive()
    }
}

impl WebhookProcessor {
    pub fn new(
        verifier: HmacVerifier,
        directory: Arc<dyn TenantDirectory>,
        cache: CacheStore,
        idempotency: Arc<dyn IdempotencyStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            verifier,
            directory,
            cache,
            idempotency,
            metrics,
            apply_timeout: Duration::from_secs(4),
        }
    }

    /// Bound APPLY so the sender's own timeout is never hit
    pub fn with_apply_timeout(mut self, apply_timeout: Duration) -> Self {
        self.apply_timeout = apply_timeout;
        self
    }

    pub fn idempotency(&self) -> &Arc<dyn IdempotencyStore> {
        &self.idempotency
    }

    /// Run one delivery through the state machine
    pub async fn process(&self, delivery: WebhookDelivery<'_>) -> WebhookOutcome {
        let outcome = self.process_inner(delivery).await;
        self.metrics.record_webhook(outcome.label());
        outcome
    }

    async fn process_inner(&self, delivery: WebhookDelivery<'_>) -> WebhookOutcome {
        // HMAC_VERIFY
        let verified = delivery
            .signature
            .is_some_and(|sig| self.verifier.verify_webhook(delivery.raw_body, sig));
        if !verified {
            warn!(
                target: "shopguard::monitor",
                shop = delivery.shop_domain.unwrap_or("-"),
                topic = delivery.topic.unwrap_or("-"),
                "Webhook signature rejected"
            );
            return WebhookOutcome::Rejected;
        }

        // PARSE
        let (shop, event) = match parse(&delivery) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(
                    shop = delivery.shop_domain.unwrap_or("-"),
                    topic = delivery.topic.unwrap_or("-"),
                    error = %e,
                    "Acknowledging malformed webhook without changes"
                );
                return WebhookOutcome::Malformed(e.to_string());
            }
        };

        if let Some(id) = delivery.webhook_id {
            if self.idempotency.begin(id).await == DeliveryDecision::Duplicate {
                debug!(webhook_id = id, shop = %shop, "Duplicate webhook delivery");
                return WebhookOutcome::Duplicate;
            }
        }

        // APPLY
        let topic = event.topic();
        let result = match timeout(self.apply_timeout, self.apply(&shop, &event)).await {
            Ok(result) => result,
            Err(_) => Err(Error::internal(format!(
                "webhook apply timed out after {:?}",
                self.apply_timeout
            ))),
        };

        match result {
            Ok(()) => {
                if let Some(id) = delivery.webhook_id {
                    self.idempotency.mark_completed(id).await;
                }
                info!(shop = %shop, topic = %topic, "Webhook processed");
                WebhookOutcome::Processed(topic)
            }
            Err(e) => {
                if let Some(id) = delivery.webhook_id {
                    self.idempotency.mark_failed(id, &e.to_string()).await;
                }
                warn!(
                    target: "shopguard::monitor",
                    shop = %shop,
                    topic = %topic,
                    error = %e,
                    "Webhook processing failed"
                );
                WebhookOutcome::Failed(e.to_string())
            }
        }
    }

    async fn apply(&self, shop: &ShopDomain, event: &WebhookEvent) -> Result<(), Error> {
        match event {
            WebhookEvent::AppUninstalled(_) => {
                let outcome = self.directory.mark_uninstalled(shop, Utc::now()).await?;
                match outcome {
                    UninstallOutcome::Uninstalled => info!(shop = %shop, "Tenant uninstalled"),
                    UninstallOutcome::AlreadyUninstalled => {
                        debug!(shop = %shop, "Tenant already uninstalled")
                    }
                    UninstallOutcome::NotFound => {
                        warn!(shop = %shop, "Uninstall for unknown tenant")
                    }
                }
                // Stale entries only cost memory once the tenant is gone.
                if let Err(e) = self.cache.delete_pattern(&keys::tenant_pattern(shop)).await {
                    warn!(shop = %shop, error = %e, "Failed to drop tenant cache on uninstall");
                }
                Ok(())
            }
            WebhookEvent::ProductChanged { topic, product } => {
                let removed = self
                    .cache
                    .delete_pattern(&keys::products_pattern(shop))
                    .await?;
                debug!(shop = %shop, topic = %topic, product_id = product.id, removed, "Product cache invalidated");
                Ok(())
            }
            WebhookEvent::ShopUpdated(_) => {
                self.cache
                    .delete_pattern(&keys::tenant_key("shop", shop, "*"))
                    .await?;
                Ok(())
            }
            WebhookEvent::PrivacyRequest { topic, request } => {
                // Nothing customer-identifying is stored here; record the request.
                info!(
                    target: "shopguard::monitor",
                    shop = %shop,
                    topic = %topic,
                    shop_id = ?request.shop_id,
                    "Privacy request acknowledged"
                );
                Ok(())
            }
            WebhookEvent::Unknown { topic } => {
                debug!(shop = %shop, topic = %topic, "Ignoring unhandled webhook topic");
                Ok(())
            }
        }
    }
}

fn parse(delivery: &WebhookDelivery<'_>) -> Result<(ShopDomain, WebhookEvent), Error> {
    let shop = delivery
        .shop_domain
        .ok_or_else(|| Error::MalformedPayload("missing shop domain header".to_string()))
        .and_then(|raw| {
            ShopDomain::parse(raw)
                .map_err(|_| Error::MalformedPayload("invalid shop domain header".to_string()))
        })?;
    let topic = delivery
        .topic
        .ok_or_else(|| Error::MalformedPayload("missing topic header".to_string()))?;
    let event = WebhookEvent::parse(topic, delivery.raw_body)?;
    Ok((shop, event))
}
