// src/cache/mod.rs
//! Two-tier response cache: an in-process memory tier with TTL and LRU
//! eviction, backed by an optional shared Redis tier.
//!
//! Redis being down never fails a call. Every backend error is logged and
//! treated as a miss (reads) or skipped (writes), so the cache degrades to
//! memory-only behavior.

use crate::error::ClientError;
use async_trait::async_trait;
use log::{debug, info, warn};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

/// TTL applied when a distributed hit is copied back into memory.
const COPY_BACK_TTL: Duration = Duration::from_secs(60);

/// Notified after entries matching the registered pattern are invalidated.
/// Observer failures are logged and never propagate to the caller.
#[async_trait]
pub trait InvalidationObserver: Send + Sync {
    async fn on_invalidate(&self, key: &str) -> Result<(), ClientError>;
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub default_ttl: Duration,
    pub max_memory_items: usize,
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            max_memory_items: 1000,
            key_prefix: "zone".to_string(),
        }
    }
}

struct MemoryEntry {
    value: Value,
    expires_at: Instant,
    last_access: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub memory_items: usize,
    pub memory_hits: u64,
    pub distributed_hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

pub struct CacheManager {
    config: CacheConfig,
    memory: Mutex<HashMap<String, MemoryEntry>>,
    redis: Option<ConnectionManager>,
    observers: RwLock<Vec<(String, Arc<dyn InvalidationObserver>)>>,
    memory_hits: AtomicU64,
    distributed_hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    evictions: AtomicU64,
}

impl CacheManager {
    pub fn new(config: CacheConfig, redis: Option<ConnectionManager>) -> Self {
        info!(
            "Cache manager initialized (ttl={}s, max_memory_items={}, distributed={})",
            config.default_ttl.as_secs(),
            config.max_memory_items,
            if redis.is_some() { "yes" } else { "no" },
        );
        Self {
            config,
            memory: Mutex::new(HashMap::new()),
            redis,
            observers: RwLock::new(Vec::new()),
            memory_hits: AtomicU64::new(0),
            distributed_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Builds a `prefix:namespace:id[:fp]` key. When `params` is given its
    /// key-sorted JSON form is fingerprinted so the same parameters always
    /// map to the same key regardless of construction order.
    pub fn cache_key(&self, namespace: &str, id: &str, params: Option<&Value>) -> String {
        let base = format!("{}:{}:{}", self.config.key_prefix, namespace, id);
        match params {
            Some(params) => format!("{}:{}", base, fingerprint(params)),
            None => base,
        }
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        {
            let mut memory = self.memory.lock().await;
            if let Some(entry) = memory.get_mut(key) {
                if entry.expires_at > Instant::now() {
                    entry.last_access = Instant::now();
                    self.memory_hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
                memory.remove(key);
            }
        }

        if let Some(value) = self.distributed_get(key).await {
            self.distributed_hits.fetch_add(1, Ordering::Relaxed);
            // Keep hot shared entries local for a short while.
            self.memory_set(key.to_string(), value.clone(), COPY_BACK_TTL)
                .await;
            return Some(value);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        self.memory_set(key.to_string(), value.clone(), ttl).await;
        self.distributed_set(key, &value, ttl).await;
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the cached value for `key`, or runs `loader` and caches its
    /// result. A loader error propagates and nothing is cached.
    pub async fn get_or_set<F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        loader: F,
    ) -> Result<Value, ClientError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Value, ClientError>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }
        let value = loader().await?;
        self.set(key, value.clone(), ttl).await;
        Ok(value)
    }

    /// Multi-key lookup: memory first, then one MGET for the remainder.
    pub async fn batch_get(&self, keys: &[String]) -> HashMap<String, Value> {
        let mut found = HashMap::new();
        let mut remaining = Vec::new();
        {
            let mut memory = self.memory.lock().await;
            for key in keys {
                match memory.get_mut(key) {
                    Some(entry) if entry.expires_at > Instant::now() => {
                        entry.last_access = Instant::now();
                        self.memory_hits.fetch_add(1, Ordering::Relaxed);
                        found.insert(key.clone(), entry.value.clone());
                    }
                    _ => remaining.push(key.clone()),
                }
            }
        }

        if !remaining.is_empty() {
            if let Some(redis) = &self.redis {
                let mut conn = redis.clone();
                match conn.mget::<_, Vec<Option<String>>>(&remaining).await {
                    Ok(values) => {
                        for (key, raw) in remaining.iter().zip(values) {
                            if let Some(value) =
                                raw.and_then(|s| serde_json::from_str::<Value>(&s).ok())
                            {
                                self.distributed_hits.fetch_add(1, Ordering::Relaxed);
                                self.memory_set(key.clone(), value.clone(), COPY_BACK_TTL)
                                    .await;
                                found.insert(key.clone(), value);
                            } else {
                                self.misses.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                    Err(e) => {
                        warn!("Distributed batch get failed: {}", e);
                        self.misses
                            .fetch_add(remaining.len() as u64, Ordering::Relaxed);
                    }
                }
            } else {
                self.misses
                    .fetch_add(remaining.len() as u64, Ordering::Relaxed);
            }
        }
        found
    }

    pub async fn batch_set(&self, entries: Vec<(String, Value)>, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        for (key, value) in &entries {
            self.memory_set(key.clone(), value.clone(), ttl).await;
        }

        if let Some(redis) = &self.redis {
            let mut pipe = redis::pipe();
            for (key, value) in &entries {
                if let Ok(serialized) = serde_json::to_string(value) {
                    pipe.cmd("SETEX").arg(key).arg(ttl.as_secs()).arg(serialized);
                }
            }
            let mut conn = redis.clone();
            if let Err(e) = pipe.query_async::<_, ()>(&mut conn).await {
                warn!("Distributed batch set failed: {}", e);
            }
        }
        self.sets.fetch_add(entries.len() as u64, Ordering::Relaxed);
    }

    /// Removes one key from both tiers. Returns whether anything existed.
    pub async fn delete(&self, key: &str) -> bool {
        let existed = self.memory.lock().await.remove(key).is_some();

        let mut distributed = false;
        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            match conn.del::<_, u64>(key).await {
                Ok(n) => distributed = n > 0,
                Err(e) => warn!("Distributed delete failed for {}: {}", key, e),
            }
        }

        let removed = existed || distributed;
        if removed {
            self.notify_observers(key).await;
        }
        removed
    }

    /// Removes every key containing `pattern` from memory and, when a
    /// distributed tier exists, every key matching `*pattern*` there.
    /// Returns the number of memory entries removed.
    pub async fn delete_pattern(&self, pattern: &str) -> usize {
        let removed_keys: Vec<String> = {
            let mut memory = self.memory.lock().await;
            let keys: Vec<String> = memory
                .keys()
                .filter(|k| k.contains(pattern))
                .cloned()
                .collect();
            for key in &keys {
                memory.remove(key);
            }
            keys
        };

        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            let glob = format!("*{}*", pattern);
            let mut cursor: u64 = 0;
            loop {
                let scan: Result<(u64, Vec<String>), _> = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&glob)
                    .arg("COUNT")
                    .arg(100)
                    .query_async(&mut conn)
                    .await;
                match scan {
                    Ok((next, keys)) => {
                        if !keys.is_empty() {
                            if let Err(e) = conn.del::<_, u64>(keys).await {
                                warn!("Distributed pattern delete failed: {}", e);
                                break;
                            }
                        }
                        if next == 0 {
                            break;
                        }
                        cursor = next;
                    }
                    Err(e) => {
                        warn!("Distributed scan failed for {}: {}", glob, e);
                        break;
                    }
                }
            }
        }

        for key in &removed_keys {
            self.notify_observers(key).await;
        }
        debug!("Invalidated {} entries matching '{}'", removed_keys.len(), pattern);
        removed_keys.len()
    }

    /// Registers an observer for keys containing `pattern`.
    pub async fn register_observer(
        &self,
        pattern: impl Into<String>,
        observer: Arc<dyn InvalidationObserver>,
    ) {
        self.observers.write().await.push((pattern.into(), observer));
    }

    async fn notify_observers(&self, key: &str) {
        let observers = self.observers.read().await;
        for (pattern, observer) in observers.iter() {
            if key.contains(pattern.as_str()) {
                if let Err(e) = observer.on_invalidate(key).await {
                    warn!("Invalidation observer failed for {}: {}", key, e);
                }
            }
        }
    }

    /// Pre-populates both tiers from a factory, typically at startup. Keys
    /// whose factory call fails are skipped. Returns the count loaded.
    pub async fn warmup<F, Fut>(&self, keys: Vec<String>, ttl: Option<Duration>, factory: F) -> usize
    where
        F: Fn(String) -> Fut,
        Fut: std::future::Future<Output = Result<Value, ClientError>>,
    {
        let total = keys.len();
        let mut entries = Vec::with_capacity(total);
        for key in keys {
            match factory(key.clone()).await {
                Ok(value) => entries.push((key, value)),
                Err(e) => warn!("Warmup load failed for {}: {}", key, e),
            }
        }
        let loaded = entries.len();
        if !entries.is_empty() {
            self.batch_set(entries, ttl).await;
        }
        info!("Cache warmed with {}/{} entries", loaded, total);
        loaded
    }

    /// Drops expired memory entries. Returns the count removed.
    pub async fn clear_expired(&self) -> usize {
        let mut memory = self.memory.lock().await;
        let now = Instant::now();
        let before = memory.len();
        memory.retain(|_, entry| entry.expires_at > now);
        before - memory.len()
    }

    pub async fn stats(&self) -> CacheStats {
        let memory_hits = self.memory_hits.load(Ordering::Relaxed);
        let distributed_hits = self.distributed_hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = memory_hits + distributed_hits + misses;

        CacheStats {
            memory_items: self.memory.lock().await.len(),
            memory_hits,
            distributed_hits,
            misses,
            sets: self.sets.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                (memory_hits + distributed_hits) as f64 / lookups as f64
            },
        }
    }

    async fn memory_set(&self, key: String, value: Value, ttl: Duration) {
        let mut memory = self.memory.lock().await;
        if memory.len() >= self.config.max_memory_items && !memory.contains_key(&key) {
            self.evict_one(&mut memory);
        }
        let now = Instant::now();
        memory.insert(
            key,
            MemoryEntry {
                value,
                expires_at: now + ttl,
                last_access: now,
            },
        );
    }

    /// Evicts an expired entry when one exists, otherwise the least
    /// recently accessed one.
    fn evict_one(&self, memory: &mut HashMap<String, MemoryEntry>) {
        let now = Instant::now();
        let victim = memory
            .iter()
            .find(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .or_else(|| {
                memory
                    .iter()
                    .min_by_key(|(_, e)| e.last_access)
                    .map(|(k, _)| k.clone())
            });
        if let Some(key) = victim {
            memory.remove(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!("Evicted cache entry {}", key);
        }
    }

    async fn distributed_get(&self, key: &str) -> Option<Value> {
        let redis = self.redis.as_ref()?;
        let mut conn = redis.clone();
        match conn.get::<_, Option<String>>(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!("Corrupt distributed cache entry {}: {}", key, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Distributed get failed for {}: {}", key, e);
                None
            }
        }
    }

    async fn distributed_set(&self, key: &str, value: &Value, ttl: Duration) {
        let Some(redis) = &self.redis else {
            return;
        };
        let serialized = match serde_json::to_string(value) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to serialize cache entry {}: {}", key, e);
                return;
            }
        };
        let mut conn = redis.clone();
        if let Err(e) = conn
            .set_ex::<_, _, ()>(key, serialized, ttl.as_secs())
            .await
        {
            warn!("Distributed set failed for {}: {}", key, e);
        }
    }
}

/// Short stable fingerprint of a parameter object. `serde_json` maps are
/// key-ordered, so serialization is canonical for equal objects.
fn fingerprint(params: &Value) -> String {
    let serialized = params.to_string();
    let digest = Sha256::digest(serialized.as_bytes());
    hex::encode(&digest[..4])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::advance;

    fn memory_only(max_items: usize) -> CacheManager {
        CacheManager::new(
            CacheConfig {
                default_ttl: Duration::from_secs(300),
                max_memory_items: max_items,
                key_prefix: "zone".to_string(),
            },
            None,
        )
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let cache = memory_only(100);
        let key = cache.cache_key("zone_status", "zone-42", None);
        assert_eq!(key, "zone:zone_status:zone-42");

        cache.set(&key, json!({"playing": true}), None).await;
        assert_eq!(cache.get(&key).await, Some(json!({"playing": true})));

        let stats = cache.stats().await;
        assert_eq!(stats.memory_hits, 1);
        assert_eq!(stats.sets, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = memory_only(100);
        cache
            .set("zone:ttl:a", json!(1), Some(Duration::from_secs(10)))
            .await;

        advance(Duration::from_secs(9)).await;
        assert!(cache.get("zone:ttl:a").await.is_some());

        advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get("zone:ttl:a").await, None);
        assert_eq!(cache.stats().await.misses, 1);
    }

    #[test]
    fn fingerprint_is_order_independent() {
        let a = json!({"volume": 11, "fade": true});
        let b = json!({"fade": true, "volume": 11});
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_ne!(fingerprint(&a), fingerprint(&json!({"volume": 12, "fade": true})));
    }

    #[tokio::test]
    async fn params_change_the_cache_key() {
        let cache = memory_only(100);
        let plain = cache.cache_key("zones", "list", None);
        let filtered = cache.cache_key("zones", "list", Some(&json!({"active": true})));
        assert_ne!(plain, filtered);
        assert!(filtered.starts_with("zone:zones:list:"));
    }

    #[tokio::test]
    async fn lru_eviction_at_capacity() {
        let cache = memory_only(2);
        cache.set("zone:a", json!(1), None).await;
        cache.set("zone:b", json!(2), None).await;

        // Touch `a` so `b` becomes the least recently used.
        cache.get("zone:a").await;
        cache.set("zone:c", json!(3), None).await;

        assert!(cache.get("zone:a").await.is_some());
        assert_eq!(cache.get("zone:b").await, None);
        assert!(cache.get("zone:c").await.is_some());
        assert_eq!(cache.stats().await.evictions, 1);
    }

    #[tokio::test]
    async fn get_or_set_loads_once() {
        let cache = memory_only(100);
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            let value = cache
                .get_or_set("zone:loader:x", None, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("loaded"))
                })
                .await
                .unwrap();
            assert_eq!(value, json!("loaded"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn loader_errors_are_not_cached() {
        let cache = memory_only(100);
        let result = cache
            .get_or_set("zone:loader:err", None, || async {
                Err(ClientError::Transport("down".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(cache.get("zone:loader:err").await, None);
    }

    #[tokio::test]
    async fn delete_pattern_removes_matching_entries() {
        let cache = memory_only(100);
        cache.set("zone:zone_status:z1", json!(1), None).await;
        cache.set("zone:zone_status:z2", json!(2), None).await;
        cache.set("zone:zone_info:z1", json!(3), None).await;

        let removed = cache.delete_pattern("zone_status").await;
        assert_eq!(removed, 2);
        assert_eq!(cache.get("zone:zone_status:z1").await, None);
        assert!(cache.get("zone:zone_info:z1").await.is_some());
    }

    struct CountingObserver {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl InvalidationObserver for CountingObserver {
        async fn on_invalidate(&self, key: &str) -> Result<(), ClientError> {
            self.seen.lock().await.push(key.to_string());
            Ok(())
        }
    }

    struct FailingObserver;

    #[async_trait]
    impl InvalidationObserver for FailingObserver {
        async fn on_invalidate(&self, _key: &str) -> Result<(), ClientError> {
            Err(ClientError::CacheBackend("observer exploded".to_string()))
        }
    }

    #[tokio::test]
    async fn observers_fire_on_invalidation_and_failures_are_isolated() {
        let cache = memory_only(100);
        let observer = Arc::new(CountingObserver {
            seen: Mutex::new(Vec::new()),
        });
        cache.register_observer("zone_status", Arc::new(FailingObserver)).await;
        cache.register_observer("zone_status", observer.clone()).await;

        cache.set("zone:zone_status:z1", json!(1), None).await;
        assert!(cache.delete("zone:zone_status:z1").await);

        let seen = observer.seen.lock().await;
        assert_eq!(seen.as_slice(), ["zone:zone_status:z1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_expired_reaps_only_stale_entries() {
        let cache = memory_only(100);
        cache
            .set("zone:short", json!(1), Some(Duration::from_secs(5)))
            .await;
        cache
            .set("zone:long", json!(2), Some(Duration::from_secs(500)))
            .await;

        advance(Duration::from_secs(10)).await;
        assert_eq!(cache.clear_expired().await, 1);
        assert_eq!(cache.stats().await.memory_items, 1);
    }

    #[tokio::test]
    async fn warmup_skips_failing_keys() {
        let cache = memory_only(100);
        let loaded = cache
            .warmup(
                vec!["zone:w:a".to_string(), "zone:w:bad".to_string()],
                None,
                |key| async move {
                    if key.ends_with("bad") {
                        Err(ClientError::Transport("unreachable".to_string()))
                    } else {
                        Ok(json!({"warm": true}))
                    }
                },
            )
            .await;

        assert_eq!(loaded, 1);
        assert!(cache.get("zone:w:a").await.is_some());
        assert_eq!(cache.get("zone:w:bad").await, None);
    }

    #[tokio::test]
    async fn batch_get_mixes_hits_and_misses() {
        let cache = memory_only(100);
        cache
            .batch_set(
                vec![
                    ("zone:a".to_string(), json!(1)),
                    ("zone:b".to_string(), json!(2)),
                ],
                None,
            )
            .await;

        let keys = vec![
            "zone:a".to_string(),
            "zone:b".to_string(),
            "zone:missing".to_string(),
        ];
        let found = cache.batch_get(&keys).await;
        assert_eq!(found.len(), 2);
        assert_eq!(found["zone:a"], json!(1));
        assert_eq!(cache.stats().await.misses, 1);
    }
}
