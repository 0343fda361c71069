//! HTTP endpoint for webhook deliveries

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::instrument;

use crate::error::{Error, SignatureError};
use crate::webhook::processor::{WebhookDelivery, WebhookOutcome, WebhookProcessor};

/// Base64 HMAC-SHA256 of the raw body
pub const HMAC_HEADER: &str = "x-shopify-hmac-sha256";
/// Sending tenant's domain
pub const SHOP_DOMAIN_HEADER: &str = "x-shopify-shop-domain";
pub const TOPIC_HEADER: &str = "x-shopify-topic";
/// Unique per delivery, repeated on redelivery
pub const WEBHOOK_ID_HEADER: &str = "x-shopify-webhook-id";

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// `POST /webhooks`
///
/// The body is taken as raw bytes; it must not be parsed before the
/// signature is checked.
#[instrument(skip_all, fields(topic = header(&headers, TOPIC_HEADER).unwrap_or("-")))]
pub async fn webhook_handler(
    State(processor): State<WebhookProcessor>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let delivery = WebhookDelivery {
        raw_body: &body,
        signature: header(&headers, HMAC_HEADER),
        shop_domain: header(&headers, SHOP_DOMAIN_HEADER),
        topic: header(&headers, TOPIC_HEADER),
        webhook_id: header(&headers, WEBHOOK_ID_HEADER),
    };

    let outcome = processor.process(delivery).await;
    match &outcome {
        WebhookOutcome::Rejected => Error::Signature(SignatureError::InvalidHmac).into_response(),
        WebhookOutcome::Failed(_) => Error::internal("webhook processing failed").into_response(),
        _ => (outcome.status(), Json(json!({ "status": outcome.label() }))).into_response(),
    }
}
