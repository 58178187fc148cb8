//! Caching layer for query embeddings
//!
//! Repeated questions are common at query time, and embedding them is the
//! one remote call on the critical path before k-NN. The cache is keyed by
//! embedding mode and the full text, bounded by capacity and TTL.
//!
//! Uses the moka crate for thread-safe, async-compatible caching.

use async_trait::async_trait;
use kgr_core::{CacheConfig, EmbedMode, EmbeddingService, Result};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Embedding Cache
// ============================================================================

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct EmbeddingKey {
    mode: EmbedMode,
    text: String,
}

impl EmbeddingKey {
    fn new(text: &str, mode: EmbedMode) -> Self {
        Self {
            mode,
            text: text.to_string(),
        }
    }
}

/// Cache of embedding vectors keyed by mode and text
#[derive(Clone)]
pub struct EmbeddingCache {
    cache: Cache<EmbeddingKey, Vec<f32>>,
    stats: Arc<CacheStats>,
}

impl EmbeddingCache {
    /// Create a cache with default capacity and TTL
    pub fn new() -> Self {
        Self::with_config(&CacheConfig::default())
    }

    pub fn with_config(config: &CacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(Duration::from_secs(config.ttl_seconds))
            .build();

        Self {
            cache,
            stats: Arc::new(CacheStats::new("embedding")),
        }
    }

    /// Look up an embedding, recording a hit or miss
    pub async fn get(&self, text: &str, mode: EmbedMode) -> Option<Vec<f32>> {
        let result = self.cache.get(&EmbeddingKey::new(text, mode)).await;

        if result.is_some() {
            self.stats.record_hit();
        } else {
            self.stats.record_miss();
        }
        result
    }

    pub async fn put(&self, text: &str, mode: EmbedMode, embedding: Vec<f32>) {
        self.cache
            .insert(EmbeddingKey::new(text, mode), embedding)
            .await;
        self.stats.record_write();
    }

    /// Check presence without touching hit/miss counters
    pub fn contains(&self, text: &str, mode: EmbedMode) -> bool {
        self.cache.contains_key(&EmbeddingKey::new(text, mode))
    }

    pub async fn invalidate(&self, text: &str, mode: EmbedMode) {
        self.cache.invalidate(&EmbeddingKey::new(text, mode)).await;
        self.stats.record_invalidation();
    }

    /// Drop every entry and reset statistics
    pub async fn clear(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
        self.stats.reset();
    }

    pub fn stats(&self) -> Arc<CacheStats> {
        Arc::clone(&self.stats)
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl Default for EmbeddingCache {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Cached Embedder
// ============================================================================

/// An [`EmbeddingService`] that serves repeated texts from an [`EmbeddingCache`]
///
/// Failed embeddings are never cached.
pub struct CachedEmbedder<E: ?Sized = dyn EmbeddingService> {
    inner: Arc<E>,
    cache: EmbeddingCache,
}

impl<E: EmbeddingService + ?Sized> CachedEmbedder<E> {
    pub fn new(inner: Arc<E>, cache: EmbeddingCache) -> Self {
        Self { inner, cache }
    }

    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }
}

#[async_trait]
impl<E: EmbeddingService + ?Sized> EmbeddingService for CachedEmbedder<E> {
    async fn embed(&self, text: &str, mode: EmbedMode) -> Result<Vec<f32>> {
        if let Some(hit) = self.cache.get(text, mode).await {
            return Ok(hit);
        }

        let embedding = self.inner.embed(text, mode).await?;
        self.cache.put(text, mode, embedding.clone()).await;
        Ok(embedding)
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

// ============================================================================
// Cache Statistics
// ============================================================================

/// Atomic counters for cache performance monitoring
#[derive(Debug)]
pub struct CacheStats {
    name: String,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    invalidations: AtomicU64,
}

impl CacheStats {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.writes.store(0, Ordering::Relaxed);
        self.invalidations.store(0, Ordering::Relaxed);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }

    pub fn total_requests(&self) -> u64 {
        self.hits() + self.misses()
    }

    /// Hit rate in [0, 1]; 0 before any request
    pub fn hit_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            0.0
        } else {
            self.hits() as f64 / total as f64
        }
    }

    pub fn report(&self) -> CacheStatsReport {
        CacheStatsReport {
            name: self.name.clone(),
            hits: self.hits(),
            misses: self.misses(),
            writes: self.writes(),
            invalidations: self.invalidations(),
            hit_rate: self.hit_rate(),
        }
    }
}

/// Serializable snapshot of [`CacheStats`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStatsReport {
    pub name: String,
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub invalidations: u64,
    pub hit_rate: f64,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use kgr_core::KgrError;

    struct CountingEmbedder {
        calls: AtomicU64,
        fail: bool,
    }

    impl CountingEmbedder {
        fn new(fail: bool) -> Self {
            Self {
                calls: AtomicU64::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl EmbeddingService for CountingEmbedder {
        async fn embed(&self, text: &str, _mode: EmbedMode) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(KgrError::Embedding("backend down".to_string()));
            }
            Ok(vec![text.len() as f32, 1.0])
        }

        fn dimension(&self) -> usize {
            2
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    #[tokio::test]
    async fn test_embedding_cache_basic() {
        let cache = EmbeddingCache::new();

        assert!(cache.get("who owns acct 42", EmbedMode::Query).await.is_none());
        assert_eq!(cache.stats().misses(), 1);

        cache
            .put("who owns acct 42", EmbedMode::Query, vec![0.1, 0.2])
            .await;
        assert_eq!(
            cache.get("who owns acct 42", EmbedMode::Query).await,
            Some(vec![0.1, 0.2])
        );
        assert_eq!(cache.stats().hits(), 1);
        assert_eq!(cache.stats().writes(), 1);
    }

    #[tokio::test]
    async fn test_modes_are_separate_entries() {
        let cache = EmbeddingCache::new();
        cache.put("jane roe", EmbedMode::Query, vec![1.0]).await;

        assert!(cache.contains("jane roe", EmbedMode::Query));
        assert!(!cache.contains("jane roe", EmbedMode::Document));
        assert!(cache.get("jane roe", EmbedMode::Document).await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_and_clear() {
        let cache = EmbeddingCache::new();
        cache.put("a", EmbedMode::Query, vec![1.0]).await;
        cache.put("b", EmbedMode::Query, vec![2.0]).await;

        cache.invalidate("a", EmbedMode::Query).await;
        assert!(cache.get("a", EmbedMode::Query).await.is_none());
        assert_eq!(cache.stats().invalidations(), 1);

        cache.clear().await;
        assert!(cache.get("b", EmbedMode::Query).await.is_none());
        assert_eq!(cache.stats().hits(), 0);
    }

    #[tokio::test]
    async fn test_hit_rate() {
        let cache = EmbeddingCache::new();
        let stats = cache.stats();
        assert_eq!(stats.hit_rate(), 0.0);

        cache.get("q", EmbedMode::Query).await;
        cache.put("q", EmbedMode::Query, vec![1.0]).await;
        cache.get("q", EmbedMode::Query).await;
        cache.get("other", EmbedMode::Query).await;

        assert_eq!(stats.total_requests(), 3);
        assert!((stats.hit_rate() - 1.0 / 3.0).abs() < 0.001);

        let report = stats.report();
        assert_eq!(report.name, "embedding");
        assert_eq!(report.hits, 1);
    }

    #[tokio::test]
    async fn test_cached_embedder_serves_repeats() {
        let backend = Arc::new(CountingEmbedder::new(false));
        let embedder = CachedEmbedder::new(Arc::clone(&backend), EmbeddingCache::new());

        let first = embedder.embed("net worth of jane", EmbedMode::Query).await.unwrap();
        let second = embedder.embed("net worth of jane", EmbedMode::Query).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(embedder.cache().stats().hits(), 1);
        assert_eq!(embedder.name(), "counting");
    }

    #[tokio::test]
    async fn test_cached_embedder_over_trait_object() {
        let backend: Arc<dyn EmbeddingService> = Arc::new(CountingEmbedder::new(false));
        let embedder: CachedEmbedder = CachedEmbedder::new(backend, EmbeddingCache::new());
        assert_eq!(embedder.dimension(), 2);
        assert!(embedder.embed("x", EmbedMode::Document).await.is_ok());
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let backend = Arc::new(CountingEmbedder::new(true));
        let embedder = CachedEmbedder::new(Arc::clone(&backend), EmbeddingCache::new());

        assert!(embedder.embed("q", EmbedMode::Query).await.is_err());
        assert!(embedder.embed("q", EmbedMode::Query).await.is_err());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
        assert_eq!(embedder.cache().stats().writes(), 0);
    }

    #[tokio::test]
    async fn test_keys_distinguish_text_and_mode() {
        let cache = EmbeddingCache::new();
        cache.put("who is the trustee?", EmbedMode::Query, vec![1.0]).await;

        assert!(cache.contains("who is the trustee?", EmbedMode::Query));
        assert!(!cache.contains("who is the trustee?", EmbedMode::Document));
        assert!(!cache.contains("who is the trustee", EmbedMode::Query));
        assert_eq!(cache.get("who is the trustee", EmbedMode::Query).await, None);
        assert_eq!(
            cache.get("who is the trustee?", EmbedMode::Query).await,
            Some(vec![1.0])
        );
    }
}
