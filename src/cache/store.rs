//! TTL cache over a pluggable backend.
//!
//! Values are stored as JSON so any backend (in-process map, Redis, ...) can
//! hold them. Cache failures never reach callers of [`CacheStore::with_cache`]:
//! every error falls back to calling the fetcher directly.
//!
//! Concurrent misses on the same key each call the fetcher; there is no
//! single-flight coalescing.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::pattern::GlobPattern;
use crate::deadline::checked_expiry;
use crate::error::CacheError;
use crate::metrics::Metrics;

/// Storage backend for [`CacheStore`]
#[async_trait]
pub trait CacheBackend: Send + Sync + 'static {
    /// Fetch a live value. Expired entries read as `None`.
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError>;

    /// Store a value that expires `ttl` from now
    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), CacheError>;

    /// Remove one key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Remove every key matching the glob pattern. Returns the count removed.
    async fn delete_pattern(&self, pattern: &GlobPattern) -> Result<usize, CacheError>;

    /// Remove everything
    async fn clear(&self) -> Result<(), CacheError>;

    /// Drop expired entries. Returns the count removed.
    async fn purge_expired(&self) -> Result<usize, CacheError>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// In-process cache backend
#[derive(Debug, Default)]
pub struct MemoryCacheBackend {
    entries: DashMap<String, Entry>,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries currently held, including expired ones not yet purged
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        let now = Instant::now();
        let value = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
            Some(_) => None,
            None => return Ok(None),
        };

        // Expired: the read guard is released above, purge lazily.
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        Ok(value)
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), CacheError> {
        let expires_at = checked_expiry(Instant::now(), ttl)
            .ok_or_else(|| CacheError::Backend(format!("ttl {ttl:?} is out of range")))?;
        self.entries
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn delete_pattern(&self, pattern: &GlobPattern) -> Result<usize, CacheError> {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| pattern.matches(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        Ok(keys
            .iter()
            .filter(|key| self.entries.remove(key.as_str()).is_some())
            .count())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.entries.clear();
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, CacheError> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        Ok(expired
            .iter()
            .filter(|key| {
                self.entries
                    .remove_if(key.as_str(), |_, entry| entry.is_expired(now))
                    .is_some()
            })
            .count())
    }
}

/// Typed cache facade
#[derive(Clone)]
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    default_ttl: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("default_ttl", &self.default_ttl)
            .finish_non_exhaustive()
    }
}

impl CacheStore {
    pub fn new(backend: Arc<dyn CacheBackend>, default_ttl: Duration) -> Self {
        Self {
            backend,
            default_ttl,
            metrics: None,
        }
    }

    /// In-process store with the given default TTL
    pub fn in_memory(default_ttl: Duration) -> Self {
        Self::new(Arc::new(MemoryCacheBackend::new()), default_ttl)
    }

    /// Attach a metrics sink
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Read and decode a value
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.backend.get(key).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| CacheError::Decode(e.to_string())),
            None => Ok(None),
        }
    }

    /// Encode and store a value
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let value = serde_json::to_value(value).map_err(|e| CacheError::Encode(e.to_string()))?;
        self.backend.set(key, value, ttl).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.backend.delete(key).await
    }

    /// Remove every key matching a glob pattern such as `products:acme.myshopify.com:*`
    pub async fn delete_pattern(&self, pattern: &str) -> Result<usize, CacheError> {
        let pattern = GlobPattern::new(pattern)?;
        let removed = self.backend.delete_pattern(&pattern).await?;
        debug!(pattern = pattern.as_str(), removed, "Cache pattern invalidated");
        Ok(removed)
    }

    pub async fn clear(&self) -> Result<(), CacheError> {
        self.backend.clear().await
    }

    /// Drop expired entries
    pub async fn purge_expired(&self) -> Result<usize, CacheError> {
        self.backend.purge_expired().await
    }

    /// Read-through helper.
    ///
    /// Returns the cached value on a hit. On a miss, or on any cache error,
    /// calls `fetcher` and, if it succeeds, writes the result back on a best
    /// effort basis. Only the fetcher's own error is ever returned.
    pub async fn with_cache<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        fetcher: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.get::<T>(key).await {
            Ok(Some(value)) => {
                debug!(key, "Cache hit");
                self.record(|m| m.record_cache_hit());
                return Ok(value);
            }
            Ok(None) => {
                debug!(key, "Cache miss");
                self.record(|m| m.record_cache_miss());
            }
            Err(e) => {
                warn!(key, error = %e, "Cache read failed; falling back to fetcher");
                self.record(|m| m.record_cache_error());
            }
        }

        let value = fetcher().await?;

        if let Err(e) = self
            .set(key, &value, ttl.unwrap_or(self.default_ttl))
            .await
        {
            warn!(key, error = %e, "Cache write failed");
            self.record(|m| m.record_cache_error());
        }

        Ok(value)
    }

    fn record(&self, f: impl FnOnce(&Metrics)) {
        if let Some(metrics) = &self.metrics {
            f(metrics);
        }
    }
}
