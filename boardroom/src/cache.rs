//! Response caching with shared hit/miss bookkeeping.
//!
//! [`CacheMetrics`] is the mixin every concrete cache embeds: the cache owns
//! storage and TTL policy, the metrics own statistics and the enabled flag.
//! A concrete cache must call `record_hit`/`record_miss` inside its own
//! `get` — the metrics never intercept calls.
//!
//! Two concrete caches ship with the engine: [`KeyedCache`] (deterministic
//! string keys over an external key-value store) and [`SemanticCache`]
//! (embedding-similarity lookup for near-identical prompts).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::error::EngineResult;
use crate::model::SharedEmbeddingProvider;

/// Snapshot of cache statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub hits: u64,
    pub misses: u64,
    /// `hits / (hits + misses)`, 0.0 when there have been no requests.
    pub hit_rate: f64,
    pub ttl_seconds: u64,
}

/// Shared statistics bookkeeping embedded by every concrete cache.
#[derive(Debug)]
pub struct CacheMetrics {
    enabled: bool,
    ttl_seconds: u64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheMetrics {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            enabled: config.enabled,
            ttl_seconds: config.ttl_seconds,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Whether this cache instance is enabled. Fixed at construction.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn ttl_seconds(&self) -> u64 {
        self.ttl_seconds
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        };
        CacheStats {
            enabled: self.enabled,
            hits,
            misses,
            hit_rate,
            ttl_seconds: self.ttl_seconds,
        }
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

/// Cache contract: `get`/`set` plus the shared statistics surface.
#[async_trait]
pub trait ResponseCache<K, V>: Send + Sync
where
    K: Send + Sync,
    V: Send + Sync,
{
    async fn get(&self, key: &K) -> Option<V>;
    async fn set(&self, key: K, value: V);

    fn metrics(&self) -> &CacheMetrics;

    fn get_stats(&self) -> CacheStats {
        self.metrics().stats()
    }

    fn reset_stats(&self) {
        self.metrics().reset()
    }
}

/// Minimal key-value store contract satisfied by the external store
/// collaborator. The engine never assumes more than get/set/increment/expire.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> EngineResult<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> EngineResult<()>;
    async fn increment(&self, key: &str) -> EngineResult<i64>;
    async fn expire(&self, key: &str, ttl_seconds: u64) -> EngineResult<()>;
}

pub type SharedKeyValueStore = Arc<dyn KeyValueStore>;

struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

/// In-process key-value store honoring TTLs. Used by tests and
/// single-process deployments.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> SharedKeyValueStore {
        Arc::new(self)
    }

    fn expiry(ttl_seconds: u64) -> Option<Instant> {
        if ttl_seconds == 0 {
            None
        } else {
            Some(Instant::now() + std::time::Duration::from_secs(ttl_seconds))
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> EngineResult<Option<String>> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) => {
                if matches!(entry.expires_at, Some(at) if at <= Instant::now()) {
                    entries.remove(key);
                    Ok(None)
                } else {
                    Ok(Some(entry.value.clone()))
                }
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> EngineResult<()> {
        self.entries.lock().await.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: Self::expiry(ttl_seconds),
            },
        );
        Ok(())
    }

    async fn increment(&self, key: &str) -> EngineResult<i64> {
        let mut entries = self.entries.lock().await;
        let current: i64 = entries
            .get(key)
            .and_then(|e| e.value.parse().ok())
            .unwrap_or(0);
        let next = current + 1;
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: next.to_string(),
                expires_at: None,
            },
        );
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> EngineResult<()> {
        if let Some(entry) = self.entries.lock().await.get_mut(key) {
            entry.expires_at = Self::expiry(ttl_seconds);
        }
        Ok(())
    }
}

/// Deterministic-key cache: serializes values as JSON into the store under
/// a namespaced key.
pub struct KeyedCache<V> {
    namespace: String,
    store: SharedKeyValueStore,
    metrics: CacheMetrics,
    _value: std::marker::PhantomData<fn() -> V>,
}

impl<V> KeyedCache<V>
where
    V: Serialize + for<'de> Deserialize<'de> + Send + Sync,
{
    pub fn new(namespace: &str, store: SharedKeyValueStore, config: CacheConfig) -> Self {
        Self {
            namespace: namespace.to_string(),
            store,
            metrics: CacheMetrics::new(&config),
            _value: std::marker::PhantomData,
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }
}

#[async_trait]
impl<V> ResponseCache<String, V> for KeyedCache<V>
where
    V: Serialize + for<'de> Deserialize<'de> + Send + Sync,
{
    async fn get(&self, key: &String) -> Option<V> {
        if !self.metrics.enabled() {
            // Disabled lookups still count so hits + misses equals get calls.
            self.metrics.record_miss();
            return None;
        }
        let raw = match self.store.get(&self.full_key(key)).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(namespace = %self.namespace, error = %e, "cache store read failed, treating as miss");
                None
            }
        };
        match raw.and_then(|r| serde_json::from_str(&r).ok()) {
            Some(value) => {
                self.metrics.record_hit();
                Some(value)
            }
            None => {
                self.metrics.record_miss();
                None
            }
        }
    }

    async fn set(&self, key: String, value: V) {
        if !self.metrics.enabled() {
            return;
        }
        let raw = match serde_json::to_string(&value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(namespace = %self.namespace, error = %e, "cache value not serializable, skipping set");
                return;
            }
        };
        if let Err(e) = self
            .store
            .set(&self.full_key(&key), &raw, self.metrics.ttl_seconds())
            .await
        {
            warn!(namespace = %self.namespace, error = %e, "cache store write failed");
        }
    }

    fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }
}

struct SemanticEntry {
    text: String,
    embedding: Vec<f32>,
    value: String,
}

/// Similarity cache: a lookup hits when a previously cached text's embedding
/// is within `threshold` cosine similarity of the query.
pub struct SemanticCache {
    embeddings: SharedEmbeddingProvider,
    entries: Mutex<Vec<SemanticEntry>>,
    threshold: f64,
    metrics: CacheMetrics,
}

impl SemanticCache {
    pub fn new(embeddings: SharedEmbeddingProvider, threshold: f64, config: CacheConfig) -> Self {
        Self {
            embeddings,
            entries: Mutex::new(Vec::new()),
            threshold,
            metrics: CacheMetrics::new(&config),
        }
    }
}

#[async_trait]
impl ResponseCache<String, String> for SemanticCache {
    async fn get(&self, key: &String) -> Option<String> {
        if !self.metrics.enabled() {
            self.metrics.record_miss();
            return None;
        }
        let query = match self.embeddings.embed(key).await {
            Ok(query) => query,
            Err(e) => {
                warn!(error = %e, "embedding failed during semantic cache lookup, treating as miss");
                self.metrics.record_miss();
                return None;
            }
        };

        let entries = self.entries.lock().await;
        let best = entries
            .iter()
            .map(|e| (cosine_similarity(&query, &e.embedding), e))
            .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        match best {
            Some((similarity, entry)) if similarity >= self.threshold => {
                debug!(similarity, cached_text = %entry.text, "semantic cache hit");
                self.metrics.record_hit();
                Some(entry.value.clone())
            }
            _ => {
                self.metrics.record_miss();
                None
            }
        }
    }

    async fn set(&self, key: String, value: String) {
        if !self.metrics.enabled() {
            return;
        }
        match self.embeddings.embed(&key).await {
            Ok(embedding) => {
                self.entries.lock().await.push(SemanticEntry {
                    text: key,
                    embedding,
                    value,
                });
            }
            Err(e) => {
                warn!(error = %e, "embedding failed during semantic cache set, entry dropped");
            }
        }
    }

    fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }
}

/// Cosine similarity of two vectors; 0.0 for mismatched or zero-norm input.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64).powi(2);
        norm_b += (*y as f64).powi(2);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
