//! Resource registry — one rate limiter and cache per external API name.
//!
//! Passed into the orchestrator at construction instead of living as
//! process globals. Instances are created lazily on first use and live for
//! the registry's lifetime, so all callers sharing a registry share the
//! same throttling state per API.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::cache::{KeyValueStore, MemoryStore};
use crate::config::{CacheConfig, RateLimitConfig};
use crate::error::EngineResult;
use crate::rate_limit::RateLimiter;

pub struct ResourceRegistry {
    /// Fallback limiter configuration for APIs without an override.
    default_limits: RateLimitConfig,
    /// Per-API limiter overrides, keyed by API name.
    overrides: HashMap<String, RateLimitConfig>,
    cache_config: CacheConfig,
    limiters: Mutex<HashMap<String, Arc<RateLimiter>>>,
    store: Arc<dyn KeyValueStore>,
}

impl ResourceRegistry {
    pub fn new(default_limits: RateLimitConfig, cache_config: CacheConfig) -> Self {
        Self {
            default_limits,
            overrides: HashMap::new(),
            cache_config,
            limiters: Mutex::new(HashMap::new()),
            store: Arc::new(MemoryStore::new()),
        }
    }

    /// Use an external key-value store instead of the in-memory default.
    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = store;
        self
    }

    /// Set a limiter configuration for a specific API name.
    pub fn with_limit(mut self, api_name: &str, config: RateLimitConfig) -> Self {
        self.overrides.insert(api_name.to_string(), config);
        self
    }

    /// The limiter for an API, created on first use and shared thereafter.
    /// Fails only when the API's configured limits are invalid.
    pub async fn limiter(&self, api_name: &str) -> EngineResult<Arc<RateLimiter>> {
        let mut limiters = self.limiters.lock().await;
        if let Some(limiter) = limiters.get(api_name) {
            return Ok(Arc::clone(limiter));
        }
        let config = self
            .overrides
            .get(api_name)
            .cloned()
            .unwrap_or_else(|| self.default_limits.clone());
        debug!(api = api_name, "creating rate limiter");
        let limiter = Arc::new(RateLimiter::new(api_name, config)?);
        limiters.insert(api_name.to_string(), Arc::clone(&limiter));
        Ok(limiter)
    }

    /// The shared key-value store backing caches.
    pub fn store(&self) -> Arc<dyn KeyValueStore> {
        Arc::clone(&self.store)
    }

    pub fn cache_config(&self) -> &CacheConfig {
        &self.cache_config
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new(RateLimitConfig::default(), CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_limiter_is_shared_per_api_name() {
        let registry = ResourceRegistry::default();
        let a = registry.limiter("search").await.unwrap();
        let b = registry.limiter("search").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let c = registry.limiter("embeddings").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn test_override_applies_to_named_api() {
        let registry = ResourceRegistry::default()
            .with_limit("search", RateLimitConfig::new(2, 60.0));
        let limiter = registry.limiter("search").await.unwrap();
        assert_eq!(limiter.available_tokens().await as u32, 2);
    }

    #[tokio::test]
    async fn test_throttling_state_shared_across_callers() {
        let registry = ResourceRegistry::default()
            .with_limit("search", RateLimitConfig::new(3, 60.0));
        registry
            .limiter("search")
            .await
            .unwrap()
            .acquire(2)
            .await
            .unwrap();
        let remaining = registry
            .limiter("search")
            .await
            .unwrap()
            .available_tokens()
            .await;
        assert!(remaining <= 1.1);
    }

    #[tokio::test]
    async fn test_invalid_override_surfaces_on_first_use() {
        let registry = ResourceRegistry::default()
            .with_limit("bad", RateLimitConfig::new(0, 60.0));
        assert!(registry.limiter("bad").await.is_err());
    }
}
