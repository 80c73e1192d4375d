//! Two-tier result cache
//!
//! Lookup order for every request:
//!
//! 1. exact key in the memory tier
//! 2. exact key in the durable tier (promoted into memory on a hit)
//! 3. best similarity match among fresh memory entries, if enabled
//! 4. miss: call the wrapped client and store the result in both tiers
//!
//! Expiry is evaluated when an entry is read and swept after every write;
//! there are no background timers. A stale entry is never served: the read
//! that finds it past its TTL evicts it and falls through.
//!
//! Concurrent misses on one key are serialized through a per-key gate so
//! the wrapped client sees at most one call per key at a time.

mod key;
mod store;

pub use key::{CacheKey, Characteristics};
pub use store::{DurableStore, FileStore, MemoryStore};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use gateway_core::{GenerationRequest, GenerationResult};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::Result;
use crate::config::CacheConfig;
use crate::failsafe::HealthMonitor;
use crate::provider::GenerationClient;

/// Durable key holding the list of stored keys, oldest first
const INDEX_KEY: &str = "__index__";

/// Rough per-entry bookkeeping cost added to the content size
const ENTRY_OVERHEAD_BYTES: usize = 256;

struct CacheEntry {
    result: GenerationResult,
    characteristics: Characteristics,
    created_at: Instant,
    /// Logical clock value of the last access (higher = more recent)
    last_used: u64,
    access_count: u64,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.created_at) < ttl
    }

    fn approx_bytes(&self) -> usize {
        let validation: usize = self
            .result
            .validation
            .warnings
            .iter()
            .chain(&self.result.validation.errors)
            .map(String::len)
            .sum();
        self.result.content.len() + self.result.metadata.model.len() + validation + ENTRY_OVERHEAD_BYTES
    }
}

/// On-disk form of a durable entry
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    result: GenerationResult,
    characteristics: Characteristics,
    /// Wall-clock creation time, Unix milliseconds
    created_at_ms: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DurableIndex {
    entries: Vec<IndexEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    key: String,
    created_at_ms: i64,
}

impl DurableIndex {
    /// Remove expired entries, then the oldest ones above `max_entries`
    fn prune(&mut self, max_entries: usize, ttl: Duration, now_ms: i64) -> Vec<IndexEntry> {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let (mut evicted, kept): (Vec<_>, Vec<_>) = self
            .entries
            .drain(..)
            .partition(|e| now_ms.saturating_sub(e.created_at_ms) >= ttl_ms);
        self.entries = kept;
        if self.entries.len() > max_entries {
            let excess = self.entries.len() - max_entries;
            evicted.extend(self.entries.drain(..excess));
        }
        evicted
    }
}

#[derive(Debug, Default)]
struct CacheCounters {
    exact_hits: AtomicU64,
    durable_hits: AtomicU64,
    similar_hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    stores: AtomicU64,
    tokens_saved: AtomicU64,
    storage_errors: AtomicU64,
}

enum Hit {
    Memory(GenerationResult),
    Durable(GenerationResult),
    Similar(GenerationResult, f64),
}

/// Caching layer in front of a [`GenerationClient`]
pub struct ResultCache<C> {
    inner: C,
    config: CacheConfig,
    entries: DashMap<String, CacheEntry>,
    store: Option<Arc<dyn DurableStore>>,
    in_flight: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    /// Serializes read-modify-write of the durable index
    index_lock: tokio::sync::Mutex<()>,
    clock: AtomicU64,
    counters: CacheCounters,
    monitor: Option<Arc<HealthMonitor>>,
}

impl<C: GenerationClient> ResultCache<C> {
    /// Memory-only cache around `inner`
    pub fn new(inner: C, config: &CacheConfig) -> Self {
        Self {
            inner,
            config: config.clone(),
            entries: DashMap::new(),
            store: None,
            in_flight: DashMap::new(),
            index_lock: tokio::sync::Mutex::new(()),
            clock: AtomicU64::new(0),
            counters: CacheCounters::default(),
            monitor: None,
        }
    }

    /// Add a durable tier
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Report hits and misses to a health monitor
    #[must_use]
    pub fn with_monitor(mut self, monitor: Arc<HealthMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Statistics snapshot
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> CacheStatsSnapshot {
        let c = &self.counters;
        let exact_hits = c.exact_hits.load(Ordering::Relaxed);
        let durable_hits = c.durable_hits.load(Ordering::Relaxed);
        let similar_hits = c.similar_hits.load(Ordering::Relaxed);
        let misses = c.misses.load(Ordering::Relaxed);
        let hits = exact_hits + durable_hits + similar_hits;
        let lookups = hits + misses;

        CacheStatsSnapshot {
            hits,
            exact_hits,
            durable_hits,
            similar_hits,
            misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            tokens_saved: c.tokens_saved.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            stores: c.stores.load(Ordering::Relaxed),
            storage_errors: c.storage_errors.load(Ordering::Relaxed),
            memory_entries: self.entries.len(),
            memory_bytes: self.memory_bytes(),
            durable_enabled: self.store.is_some(),
        }
    }

    /// Approximate size of the memory tier in bytes
    pub fn memory_bytes(&self) -> usize {
        self.entries.iter().map(|e| e.value().approx_bytes()).sum()
    }

    /// Entries in the memory tier (stale ones included until swept)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the memory tier is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop both tiers. Statistics are kept.
    pub async fn clear(&self) {
        self.entries.clear();
        let Some(store) = &self.store else {
            return;
        };

        let _guard = self.index_lock.lock().await;
        match self.load_index(store.as_ref()).await {
            Ok(index) => {
                for entry in &index.entries {
                    if let Err(e) = store.remove(&entry.key).await {
                        self.storage_error("remove", &entry.key, &e);
                    }
                }
            }
            Err(e) => self.storage_error("read", &self.index_key(), &e),
        }
        if let Err(e) = store.remove(&self.index_key()).await {
            self.storage_error("remove", &self.index_key(), &e);
        }
        debug!("Cache cleared");
    }

    /// Run the TTL and capacity sweep on both tiers now.
    ///
    /// Returns the number of entries evicted.
    pub async fn refresh(&self) -> usize {
        let mut evicted = self.sweep_memory(Instant::now());

        if let Some(store) = &self.store {
            let _guard = self.index_lock.lock().await;
            match self.load_index(store.as_ref()).await {
                Ok(mut index) => {
                    let stale = index.prune(
                        self.config.max_storage_entries,
                        self.config.default_ttl,
                        Utc::now().timestamp_millis(),
                    );
                    evicted += stale.len();
                    self.remove_durable(store.as_ref(), &stale).await;
                    if let Err(e) = self.save_index(store.as_ref(), &index).await {
                        self.storage_error("write", &self.index_key(), &e);
                    }
                }
                Err(e) => self.storage_error("read", &self.index_key(), &e),
            }
        }

        debug!(evicted, "Cache refreshed");
        evicted
    }

    // ── Lookup ───────────────────────────────────────────────────────

    async fn lookup(&self, key: &CacheKey) -> Option<Hit> {
        if let Some(result) = self.memory_exact(key) {
            return Some(Hit::Memory(result));
        }
        if let Some(result) = self.durable_exact(key).await {
            return Some(Hit::Durable(result));
        }
        if self.config.similarity_enabled {
            if let Some((result, score)) = self.best_similar(key) {
                return Some(Hit::Similar(result, score));
            }
        }
        None
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn memory_exact(&self, key: &CacheKey) -> Option<GenerationResult> {
        let now = Instant::now();
        let ttl = self.config.default_ttl;

        if let Some(mut entry) = self.entries.get_mut(key.as_str()) {
            if entry.is_fresh(now, ttl) {
                entry.last_used = self.tick();
                entry.access_count += 1;
                debug!(key = %key, accesses = entry.access_count, "Cache hit");
                return Some(entry.result.clone());
            }
        } else {
            return None;
        }

        if self
            .entries
            .remove_if(key.as_str(), |_, e| !e.is_fresh(now, ttl))
            .is_some()
        {
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Evicted stale entry on read");
        }
        None
    }

    async fn durable_exact(&self, key: &CacheKey) -> Option<GenerationResult> {
        let store = self.store.as_ref()?;
        let bytes = match store.get(key.as_str()).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                self.storage_error("read", key.as_str(), &e);
                return None;
            }
        };

        let stored: StoredEntry = match serde_json::from_slice(&bytes) {
            Ok(stored) => stored,
            Err(e) => {
                self.storage_error("decode", key.as_str(), &crate::Error::from(e));
                return None;
            }
        };

        let age_ms = Utc::now()
            .timestamp_millis()
            .saturating_sub(stored.created_at_ms)
            .max(0);
        let age = Duration::from_millis(u64::try_from(age_ms).unwrap_or(0));
        if age >= self.config.default_ttl {
            debug!(key = %key, "Durable entry expired");
            if let Err(e) = store.remove(key.as_str()).await {
                self.storage_error("remove", key.as_str(), &e);
            }
            return None;
        }

        let now = Instant::now();
        let created_at = now.checked_sub(age).unwrap_or(now);
        self.insert_memory(
            key.as_str(),
            stored.result.clone(),
            stored.characteristics,
            created_at,
        );
        debug!(key = %key, "Promoted durable entry");
        Some(stored.result)
    }

    fn best_similar(&self, key: &CacheKey) -> Option<(GenerationResult, f64)> {
        let now = Instant::now();
        let ttl = self.config.default_ttl;
        let wanted = key.characteristics();
        let threshold = self.config.similarity_threshold;

        let (best_key, score) = self
            .entries
            .iter()
            .filter(|e| e.value().is_fresh(now, ttl))
            .map(|e| (e.key().clone(), wanted.similarity(&e.value().characteristics)))
            .filter(|(_, score)| *score > threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1))?;

        let mut entry = self.entries.get_mut(&best_key)?;
        if !entry.is_fresh(now, ttl) {
            return None;
        }
        entry.last_used = self.tick();
        entry.access_count += 1;
        debug!(key = %key, matched = %best_key, score, "Similarity hit");
        Some((entry.result.clone(), score))
    }

    fn serve(&self, hit: Hit) -> GenerationResult {
        let (result, similarity, counter) = match hit {
            Hit::Memory(r) => (r, None, &self.counters.exact_hits),
            Hit::Durable(r) => (r, None, &self.counters.durable_hits),
            Hit::Similar(r, score) => (r, Some(score), &self.counters.similar_hits),
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.counters
            .tokens_saved
            .fetch_add(u64::from(result.metadata.tokens), Ordering::Relaxed);
        if let Some(monitor) = &self.monitor {
            monitor.record_cache_hit(result.metadata.tokens, similarity.is_some());
        }
        result.as_cached(similarity)
    }

    // ── Fill ─────────────────────────────────────────────────────────

    async fn fill(&self, key: &CacheKey, request: &GenerationRequest) -> Result<GenerationResult> {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        if let Some(monitor) = &self.monitor {
            monitor.record_cache_miss();
        }
        debug!(key = %key, "Cache miss");

        let result = self.inner.generate(request).await?;

        self.insert_memory(
            key.as_str(),
            result.clone(),
            key.characteristics().clone(),
            Instant::now(),
        );
        self.persist(key, &result).await;
        Ok(result)
    }

    fn insert_memory(
        &self,
        key: &str,
        result: GenerationResult,
        characteristics: Characteristics,
        created_at: Instant,
    ) {
        let entry = CacheEntry {
            result,
            characteristics,
            created_at,
            last_used: self.tick(),
            access_count: 0,
        };
        self.entries.insert(key.to_string(), entry);
        self.sweep_memory(Instant::now());
    }

    /// TTL cleanup, then least-recently-used eviction down to capacity
    fn sweep_memory(&self, now: Instant) -> usize {
        let ttl = self.config.default_ttl;
        let before = self.entries.len();
        self.entries.retain(|_, e| e.is_fresh(now, ttl));
        let mut evicted = before.saturating_sub(self.entries.len());

        while self.entries.len() > self.config.max_memory_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|e| e.value().last_used)
                .map(|e| e.key().clone());
            let Some(oldest) = oldest else { break };
            self.entries.remove(&oldest);
            evicted += 1;
        }

        if evicted > 0 {
            self.counters
                .evictions
                .fetch_add(evicted as u64, Ordering::Relaxed);
            debug!(evicted, remaining = self.entries.len(), "Swept memory tier");
        }
        evicted
    }

    // ── Durable tier ─────────────────────────────────────────────────

    fn index_key(&self) -> String {
        format!("{}:{INDEX_KEY}", self.config.key_prefix)
    }

    async fn load_index(&self, store: &dyn DurableStore) -> Result<DurableIndex> {
        match store.get(&self.index_key()).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(DurableIndex::default()),
        }
    }

    async fn save_index(&self, store: &dyn DurableStore, index: &DurableIndex) -> Result<()> {
        let bytes = serde_json::to_vec(index)?;
        store.set(&self.index_key(), &bytes).await
    }

    async fn remove_durable(&self, store: &dyn DurableStore, entries: &[IndexEntry]) {
        for entry in entries {
            if let Err(e) = store.remove(&entry.key).await {
                self.storage_error("remove", &entry.key, &e);
            }
        }
    }

    async fn persist(&self, key: &CacheKey, result: &GenerationResult) {
        let Some(store) = &self.store else {
            return;
        };
        let created_at_ms = Utc::now().timestamp_millis();
        let stored = StoredEntry {
            result: result.clone(),
            characteristics: key.characteristics().clone(),
            created_at_ms,
        };
        let bytes = match serde_json::to_vec(&stored) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.storage_error("encode", key.as_str(), &crate::Error::from(e));
                return;
            }
        };
        if let Err(e) = store.set(key.as_str(), &bytes).await {
            self.storage_error("write", key.as_str(), &e);
            return;
        }
        self.counters.stores.fetch_add(1, Ordering::Relaxed);

        let _guard = self.index_lock.lock().await;
        let mut index = match self.load_index(store.as_ref()).await {
            Ok(index) => index,
            Err(e) => {
                // Unreadable index: start over rather than block writes forever
                self.storage_error("read", &self.index_key(), &e);
                DurableIndex::default()
            }
        };
        index.entries.retain(|e| e.key != key.as_str());
        index.entries.push(IndexEntry {
            key: key.as_str().to_string(),
            created_at_ms,
        });
        let evicted = index.prune(
            self.config.max_storage_entries,
            self.config.default_ttl,
            created_at_ms,
        );
        if !evicted.is_empty() {
            debug!(evicted = evicted.len(), "Pruned durable tier");
            self.remove_durable(store.as_ref(), &evicted).await;
        }
        if let Err(e) = self.save_index(store.as_ref(), &index).await {
            self.storage_error("write", &self.index_key(), &e);
        }
    }

    fn storage_error(&self, op: &str, key: &str, error: &crate::Error) {
        self.counters.storage_errors.fetch_add(1, Ordering::Relaxed);
        let backend = self.store.as_ref().map_or("none", |s| s.name());
        warn!(op, key, backend, error = %error, "Durable cache tier failed, continuing without it");
    }
}

/// A caller's membership in the per-key miss gate.
///
/// The registry entry is removed when the last member leaves, including
/// members whose future was dropped while waiting.
struct InFlightSlot<'a> {
    registry: &'a DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    key: &'a str,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl<'a> InFlightSlot<'a> {
    fn join(registry: &'a DashMap<String, Arc<tokio::sync::Mutex<()>>>, key: &'a str) -> Self {
        let gate = registry.entry(key.to_string()).or_default().clone();
        Self { registry, key, gate }
    }
}

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        // One reference is the registry's, one is ours
        self.registry.remove_if(self.key, |_, g| {
            Arc::ptr_eq(g, &self.gate) && Arc::strong_count(g) <= 2
        });
    }
}

#[async_trait]
impl<C: GenerationClient> GenerationClient for ResultCache<C> {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult> {
        if !self.config.enabled {
            return self.inner.generate(request).await;
        }

        let key = CacheKey::derive(&self.config.key_prefix, request);
        if let Some(hit) = self.lookup(&key).await {
            return Ok(self.serve(hit));
        }

        let slot = InFlightSlot::join(&self.in_flight, key.as_str());
        let _guard = slot.gate.lock().await;
        // Another caller may have filled the key while we waited
        match self.memory_exact(&key) {
            Some(result) => Ok(self.serve(Hit::Memory(result))),
            None => self.fill(&key, request).await,
        }
    }

    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }
}

/// Cache statistics snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStatsSnapshot {
    /// All hits (memory, durable and similar)
    pub hits: u64,
    /// Exact hits served from memory
    pub exact_hits: u64,
    /// Exact hits served from the durable tier
    pub durable_hits: u64,
    /// Approximate hits
    pub similar_hits: u64,
    /// Lookups that reached the wrapped client
    pub misses: u64,
    /// `hits / (hits + misses)`
    pub hit_rate: f64,
    /// Tokens of cached generations that were not spent again
    pub tokens_saved: u64,
    /// Entries removed by TTL or capacity
    pub evictions: u64,
    /// Successful durable writes
    pub stores: u64,
    /// Durable tier failures (logged and ignored)
    pub storage_errors: u64,
    /// Entries in the memory tier
    pub memory_entries: usize,
    /// Approximate memory tier size
    pub memory_bytes: usize,
    /// Whether a durable tier is attached
    pub durable_enabled: bool,
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use gateway_core::{GenerationOptions, RequestContext};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::Error;

    #[derive(Default)]
    struct CountingClient {
        calls: AtomicU32,
        fail_next: AtomicU32,
        delay: Duration,
    }

    impl CountingClient {
        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GenerationClient for CountingClient {
        async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
                .is_ok()
            {
                return Err(Error::Provider("unavailable".into()));
            }
            Ok(GenerationResult::new(
                format!("#{n}: {}", request.prompt()),
                "mock-model",
                42,
                0.9,
            ))
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    struct FailingStore;

    #[async_trait]
    impl DurableStore for FailingStore {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            Err(Error::Storage("disk on fire".into()))
        }
        async fn set(&self, _key: &str, _value: &[u8]) -> Result<()> {
            Err(Error::Storage("disk on fire".into()))
        }
        async fn remove(&self, _key: &str) -> Result<()> {
            Err(Error::Storage("disk on fire".into()))
        }
        fn name(&self) -> &'static str {
            "failing"
        }
    }

    fn config() -> CacheConfig {
        CacheConfig {
            default_ttl: Duration::from_secs(60),
            ..CacheConfig::default()
        }
    }

    fn cache(client: &Arc<CountingClient>, config: &CacheConfig) -> ResultCache<Arc<CountingClient>> {
        ResultCache::new(client.clone(), config)
    }

    fn post(prompt: &str) -> GenerationRequest {
        GenerationRequest::new(prompt).with_context(
            RequestContext::new("post")
                .with_category("events")
                .with_audience("members"),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_request_served_from_cache() {
        let client = Arc::new(CountingClient::default());
        let cache = cache(&client, &config());
        let request = GenerationRequest::new("Summarize the release notes");

        let first = cache.generate(&request).await.unwrap();
        let second = cache.generate(&request).await.unwrap();

        assert_eq!(client.calls(), 1);
        assert_eq!(first.content, second.content);
        assert!(!first.metadata.cached);
        assert!(second.metadata.cached);
        assert_eq!(second.metadata.similarity, None);

        let stats = cache.stats();
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(stats.tokens_saved, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_not_served() {
        let client = Arc::new(CountingClient::default());
        let cache = cache(&client, &config());
        let request = GenerationRequest::new("hello");

        cache.generate(&request).await.unwrap();
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(cache.generate(&request).await.unwrap().metadata.cached);

        tokio::time::advance(Duration::from_secs(2)).await;
        let fresh = cache.generate(&request).await.unwrap();
        assert!(!fresh.metadata.cached);
        assert_eq!(client.calls(), 2);
        assert!(cache.stats().evictions >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_similar_request_served_approximately() {
        let client = Arc::new(CountingClient::default());
        let cache = cache(&client, &config());

        let original = cache.generate(&post("Announce the spring meetup")).await.unwrap();
        let similar = cache.generate(&post("Announce the autumn meetup")).await.unwrap();

        assert_eq!(client.calls(), 1);
        assert_eq!(similar.content, original.content);
        assert!(similar.metadata.similarity.unwrap() > 0.8);
        assert_eq!(cache.stats().similar_hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_similarity_disabled() {
        let client = Arc::new(CountingClient::default());
        let mut cfg = config();
        cfg.similarity_enabled = false;
        let cache = cache(&client, &cfg);

        cache.generate(&post("Announce the spring meetup")).await.unwrap();
        cache.generate(&post("Announce the autumn meetup")).await.unwrap();
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_options_do_not_match_approximately() {
        let client = Arc::new(CountingClient::default());
        let cache = cache(&client, &config());

        cache.generate(&post("Announce the meetup")).await.unwrap();
        let hotter = post("Announce the meetup again")
            .with_options(GenerationOptions::default().with_temperature(1.5));
        // Category + audience + length = 0.7, below the threshold
        assert!(!cache.generate(&hotter).await.unwrap().metadata.cached);
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_generation_is_not_cached() {
        let client = Arc::new(CountingClient::default());
        client.fail_next.store(1, Ordering::SeqCst);
        let cache = cache(&client, &config());
        let request = GenerationRequest::new("hello");

        assert!(cache.generate(&request).await.is_err());
        assert!(cache.is_empty());
        assert!(cache.generate(&request).await.is_ok());
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lru_eviction() {
        let client = Arc::new(CountingClient::default());
        let mut cfg = config();
        cfg.max_memory_entries = 2;
        let cache = cache(&client, &cfg);
        let (a, b, c) = (
            GenerationRequest::new("a"),
            GenerationRequest::new("b"),
            GenerationRequest::new("c"),
        );

        cache.generate(&a).await.unwrap();
        cache.generate(&b).await.unwrap();
        cache.generate(&a).await.unwrap(); // touch a
        cache.generate(&c).await.unwrap(); // evicts b
        assert_eq!(cache.len(), 2);
        assert_eq!(client.calls(), 3);

        assert!(cache.generate(&a).await.unwrap().metadata.cached);
        assert!(!cache.generate(&b).await.unwrap().metadata.cached);
        assert_eq!(client.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_make_one_call() {
        let client = Arc::new(CountingClient {
            delay: Duration::from_millis(50),
            ..CountingClient::default()
        });
        let cache = Arc::new(cache(&client, &config()));
        let request = GenerationRequest::new("same prompt");

        let results = futures::future::join_all((0..8).map(|_| {
            let cache = cache.clone();
            let request = request.clone();
            async move { cache.generate(&request).await }
        }))
        .await;

        assert_eq!(client.calls(), 1);
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.stats().exact_hits, 7);
        assert!(cache.in_flight.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_miss_releases_key() {
        let client = Arc::new(CountingClient {
            delay: Duration::from_secs(5),
            ..CountingClient::default()
        });
        let cache = cache(&client, &config());
        let request = GenerationRequest::new("slow prompt");

        let abandoned =
            tokio::time::timeout(Duration::from_secs(1), cache.generate(&request)).await;
        assert!(abandoned.is_err());
        assert!(cache.in_flight.is_empty());

        // The key is usable again afterwards
        let result = cache.generate(&request).await.unwrap();
        assert!(!result.metadata.cached);
        assert_eq!(client.calls(), 2);
        assert!(cache.in_flight.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_durable_tier_survives_restart() {
        let client = Arc::new(CountingClient::default());
        let store = Arc::new(MemoryStore::new());
        let request = GenerationRequest::new("persist me");

        let first = cache(&client, &config()).with_store(store.clone());
        let original = first.generate(&request).await.unwrap();
        drop(first);

        let second = cache(&client, &config()).with_store(store.clone());
        let restored = second.generate(&request).await.unwrap();
        assert_eq!(client.calls(), 1);
        assert_eq!(restored.content, original.content);
        assert_eq!(second.stats().durable_hits, 1);

        // Promoted: next read is a memory hit
        second.generate(&request).await.unwrap();
        assert_eq!(second.stats().exact_hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_durable_entry_ignored() {
        let client = Arc::new(CountingClient::default());
        let store = Arc::new(MemoryStore::new());
        let request = GenerationRequest::new("old news");
        let key = CacheKey::derive("genai", &request);

        let stale = StoredEntry {
            result: GenerationResult::new("stale", "mock-model", 5, 0.9),
            characteristics: key.characteristics().clone(),
            created_at_ms: Utc::now().timestamp_millis() - 120_000,
        };
        store
            .set(key.as_str(), &serde_json::to_vec(&stale).unwrap())
            .await
            .unwrap();

        let cache = cache(&client, &config()).with_store(store.clone());
        let result = cache.generate(&request).await.unwrap();
        assert_ne!(result.content, "stale");
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_durable_capacity_drops_oldest() {
        let client = Arc::new(CountingClient::default());
        let store = Arc::new(MemoryStore::new());
        let mut cfg = config();
        cfg.max_storage_entries = 2;
        let cache = cache(&client, &cfg).with_store(store.clone());

        let requests: Vec<_> = ["one", "two", "three"]
            .iter()
            .map(|p| GenerationRequest::new(*p))
            .collect();
        for request in &requests {
            cache.generate(request).await.unwrap();
        }

        // Two entries plus the index
        assert_eq!(store.len(), 3);
        assert!(!store.contains(CacheKey::derive("genai", &requests[0]).as_str()));
        assert!(store.contains(CacheKey::derive("genai", &requests[2]).as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_durable_tier_degrades_to_memory() {
        let client = Arc::new(CountingClient::default());
        let cache = cache(&client, &config()).with_store(Arc::new(FailingStore));
        let request = GenerationRequest::new("hello");

        cache.generate(&request).await.unwrap();
        assert!(cache.generate(&request).await.unwrap().metadata.cached);
        assert_eq!(client.calls(), 1);
        assert!(cache.stats().storage_errors > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_drops_both_tiers() {
        let client = Arc::new(CountingClient::default());
        let store = Arc::new(MemoryStore::new());
        let cache = cache(&client, &config()).with_store(store.clone());
        let request = GenerationRequest::new("hello");

        cache.generate(&request).await.unwrap();
        cache.clear().await;
        assert!(cache.is_empty());
        assert!(store.is_empty());

        cache.generate(&request).await.unwrap();
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_sweeps_expired() {
        let client = Arc::new(CountingClient::default());
        let cache = cache(&client, &config());
        cache.generate(&GenerationRequest::new("a")).await.unwrap();
        cache.generate(&GenerationRequest::new("b")).await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.refresh().await, 2);
        assert!(cache.is_empty());
        assert_eq!(cache.memory_bytes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_cache_passes_through() {
        let client = Arc::new(CountingClient::default());
        let mut cfg = config();
        cfg.enabled = false;
        let cache = cache(&client, &cfg);
        let request = GenerationRequest::new("hello");
        cache.generate(&request).await.unwrap();
        cache.generate(&request).await.unwrap();
        assert_eq!(client.calls(), 2);
        assert_eq!(cache.stats().hits, 0);
    }

    #[test]
    fn test_index_prune_order() {
        let mut index = DurableIndex {
            entries: (0..4)
                .map(|i| IndexEntry {
                    key: format!("k{i}"),
                    created_at_ms: 1_000 + i,
                })
                .collect(),
        };
        let evicted = index.prune(2, Duration::from_secs(3600), 1_010);
        let keys: Vec<_> = evicted.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["k0", "k1"]);
        assert_eq!(index.entries.len(), 2);
    }
}
