//! Delivery de-duplication keyed by the platform's webhook id.
//!
//! The platform delivers at least once. Completed deliveries are remembered
//! for a TTL so repeats can be acked without redoing work; failed or
//! in-flight deliveries may run again.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::deadline::expires_after;

/// State of a delivery id
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    InProgress,
    Completed,
    Failed(String),
}

/// What the caller should do with a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryDecision {
    /// First time seen, or a retry of a failed/in-flight delivery
    Proceed,
    /// Already completed; ack without work
    Duplicate,
}

/// Storage for delivery ids
#[async_trait]
pub trait IdempotencyStore: Send + Sync + 'static {
    /// Record the start of a delivery unless it already completed
    async fn begin(&self, delivery_id: &str) -> DeliveryDecision;

    async fn mark_completed(&self, delivery_id: &str);

    async fn mark_failed(&self, delivery_id: &str, error: &str);

    async fn status(&self, delivery_id: &str) -> Option<DeliveryStatus>;

    /// Forget records older than the TTL. Returns how many were removed.
    async fn purge_expired(&self) -> usize;
}

#[derive(Debug, Clone)]
struct Record {
    status: DeliveryStatus,
    expires_at: Instant,
}

/// In-process idempotency store
#[derive(Debug)]
pub struct InMemoryIdempotencyStore {
    records: DashMap<String, Record>,
    ttl: Duration,
}

impl InMemoryIdempotencyStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            records: DashMap::new(),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn set(&self, delivery_id: &str, status: DeliveryStatus) {
        self.records.insert(
            delivery_id.to_string(),
            Record {
                status,
                expires_at: expires_after(Instant::now(), self.ttl),
            },
        );
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn begin(&self, delivery_id: &str) -> DeliveryDecision {
        let now = Instant::now();
        let mut record = self
            .records
            .entry(delivery_id.to_string())
            .or_insert_with(|| Record {
                status: DeliveryStatus::InProgress,
                expires_at: expires_after(now, self.ttl),
            });

        if record.status == DeliveryStatus::Completed && now < record.expires_at {
            return DeliveryDecision::Duplicate;
        }

        record.status = DeliveryStatus::InProgress;
        record.expires_at = expires_after(now, self.ttl);
        DeliveryDecision::Proceed
    }

    async fn mark_completed(&self, delivery_id: &str) {
        self.set(delivery_id, DeliveryStatus::Completed);
    }

    async fn mark_failed(&self, delivery_id: &str, error: &str) {
        self.set(delivery_id, DeliveryStatus::Failed(error.to_string()));
    }

    async fn status(&self, delivery_id: &str) -> Option<DeliveryStatus> {
        self.records.get(delivery_id).map(|r| r.status.clone())
    }

    async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.records.len();
        self.records.retain(|_, record| now < record.expires_at);
        before.saturating_sub(self.records.len())
    }
}
