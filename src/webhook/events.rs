//! Webhook topics and payloads
//!
//! Only the fields the processor acts on are modelled; everything else in the
//! platform's payloads is ignored.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::tenant::ShopDomain;

/// Webhook topics we handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WebhookTopic {
    #[serde(rename = "app/uninstalled")]
    AppUninstalled,

    // Catalog changes
    #[serde(rename = "products/create")]
    ProductsCreate,
    #[serde(rename = "products/update")]
    ProductsUpdate,
    #[serde(rename = "products/delete")]
    ProductsDelete,

    #[serde(rename = "shop/update")]
    ShopUpdate,

    // Mandatory privacy topics
    #[serde(rename = "customers/data_request")]
    CustomersDataRequest,
    #[serde(rename = "customers/redact")]
    CustomersRedact,
    #[serde(rename = "shop/redact")]
    ShopRedact,

    // Catch-all for topics we don't explicitly handle
    #[serde(other)]
    Unknown,
}

impl FromStr for WebhookTopic {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "app/uninstalled" => Self::AppUninstalled,
            "products/create" => Self::ProductsCreate,
            "products/update" => Self::ProductsUpdate,
            "products/delete" => Self::ProductsDelete,
            "shop/update" => Self::ShopUpdate,
            "customers/data_request" => Self::CustomersDataRequest,
            "customers/redact" => Self::CustomersRedact,
            "shop/redact" => Self::ShopRedact,
            _ => Self::Unknown,
        })
    }
}

impl WebhookTopic {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AppUninstalled => "app/uninstalled",
            Self::ProductsCreate => "products/create",
            Self::ProductsUpdate => "products/update",
            Self::ProductsDelete => "products/delete",
            Self::ShopUpdate => "shop/update",
            Self::CustomersDataRequest => "customers/data_request",
            Self::CustomersRedact => "customers/redact",
            Self::ShopRedact => "shop/redact",
            Self::Unknown => "unknown",
        }
    }

    /// Check if this is a catalog change
    pub fn is_product_event(&self) -> bool {
        matches!(
            self,
            Self::ProductsCreate | Self::ProductsUpdate | Self::ProductsDelete
        )
    }

    /// Check if this is a mandatory privacy topic
    pub fn is_privacy_event(&self) -> bool {
        matches!(
            self,
            Self::CustomersDataRequest | Self::CustomersRedact | Self::ShopRedact
        )
    }
}

impl fmt::Display for WebhookTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `app/uninstalled` and `shop/update` body (the shop object)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ShopPayload {
    pub id: i64,
    #[serde(default)]
    pub myshopify_domain: Option<String>,
}

/// `products/*` body
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProductPayload {
    pub id: i64,
}

/// Privacy topic body
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PrivacyPayload {
    pub shop_domain: String,
    #[serde(default)]
    pub shop_id: Option<i64>,
}

/// A parsed delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEvent {
    AppUninstalled(ShopPayload),
    ProductChanged {
        topic: WebhookTopic,
        product: ProductPayload,
    },
    ShopUpdated(ShopPayload),
    PrivacyRequest {
        topic: WebhookTopic,
        request: PrivacyPayload,
    },
    Unknown {
        topic: String,
    },
}

impl WebhookEvent {
    /// Parse a raw body for the given topic header
    pub fn parse(topic_header: &str, raw_body: &[u8]) -> Result<Self, Error> {
        let topic: WebhookTopic = topic_header.parse().unwrap_or(WebhookTopic::Unknown);

        let event = match topic {
            WebhookTopic::AppUninstalled => Self::AppUninstalled(decode(raw_body)?),
            WebhookTopic::ShopUpdate => Self::ShopUpdated(decode(raw_body)?),
            t if t.is_product_event() => Self::ProductChanged {
                topic: t,
                product: decode(raw_body)?,
            },
            t if t.is_privacy_event() => {
                let request: PrivacyPayload = decode(raw_body)?;
                ShopDomain::parse(&request.shop_domain).map_err(|_| {
                    Error::MalformedPayload("privacy request shop_domain is invalid".to_string())
                })?;
                Self::PrivacyRequest { topic: t, request }
            }
            _ => {
                // Unknown topics still have to be JSON
                decode::<serde_json::Value>(raw_body)?;
                Self::Unknown {
                    topic: topic_header.to_string(),
                }
            }
        };

        Ok(event)
    }

    pub fn topic(&self) -> WebhookTopic {
        match self {
            Self::AppUninstalled(_) => WebhookTopic::AppUninstalled,
            Self::ProductChanged { topic, .. } | Self::PrivacyRequest { topic, .. } => *topic,
            Self::ShopUpdated(_) => WebhookTopic::ShopUpdate,
            Self::Unknown { .. } => WebhookTopic::Unknown,
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(raw_body: &[u8]) -> Result<T, Error> {
    serde_json::from_slice(raw_body).map_err(|e| Error::MalformedPayload(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_round_trip() {
        for topic in [
            WebhookTopic::AppUninstalled,
            WebhookTopic::ProductsUpdate,
            WebhookTopic::CustomersRedact,
            WebhookTopic::ShopRedact,
        ] {
            assert_eq!(topic.as_str().parse::<WebhookTopic>().unwrap(), topic);
        }
        assert_eq!(
            "orders/create".parse::<WebhookTopic>().unwrap(),
            WebhookTopic::Unknown
        );
    }

    #[test]
    fn test_parse_uninstall() {
        let event = WebhookEvent::parse(
            "app/uninstalled",
            br#"{"id":1,"myshopify_domain":"acme.myshopify.com","name":"Acme"}"#,
        )
        .unwrap();
        assert_eq!(event.topic(), WebhookTopic::AppUninstalled);
    }

    #[test]
    fn test_parse_product() {
        let event = WebhookEvent::parse("products/update", br#"{"id":632910392,"title":"IPod"}"#)
            .unwrap();
        assert!(matches!(
            event,
            WebhookEvent::ProductChanged {
                product: ProductPayload { id: 632910392 },
                ..
            }
        ));
    }

    #[test]
    fn test_parse_failures_are_malformed() {
        for (topic, body) in [
            ("app/uninstalled", &b"not json"[..]),
            ("app/uninstalled", &br#"{"name":"no id"}"#[..]),
            ("products/delete", &br#"{"id":"abc"}"#[..]),
            ("customers/redact", &br#"{"shop_domain":"evil.com"}"#[..]),
            ("orders/create", &b"{"[..]),
        ] {
            let err = WebhookEvent::parse(topic, body).unwrap_err();
            assert!(matches!(err, Error::MalformedPayload(_)), "{topic}");
        }
    }

    #[test]
    fn test_unknown_topic_is_kept() {
        let event = WebhookEvent::parse("orders/create", br#"{"id":1}"#).unwrap();
        assert_eq!(
            event,
            WebhookEvent::Unknown {
                topic: "orders/create".to_string()
            }
        );
    }
}
