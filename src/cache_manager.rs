//! Named in-memory caches with per-name TTL.
//!
//! The manager materializes independent caches lazily by name. A name may
//! carry its TTL as a suffix:
//!
//! ```text
//! "ordersByCustomer:ttl=30"   -> expire 30 seconds after write
//! "apiKeyLookup:ttl=60"       -> expire 60 seconds after write
//! ```
//!
//! If `:ttl=` is absent or invalid, the cache falls back to the base
//! builder's configuration. Names that differ only in the TTL suffix yield
//! *different* cache instances, and the same name always yields the *same*
//! instance for the lifetime of the manager.
//!
//! This is intentionally local and in-memory (no distributed coherence): a
//! hit may be up to one TTL older than the latest write on another instance.
//!
//! Builders are consumed by `build`, so the manager takes a factory and
//! obtains a fresh builder per cache.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::time::Instant;

/// TTL parse bounds: suffix values are clamped into `[1s, 24h]` to avoid
/// accidental huge or zero expirations.
const MIN_TTL_SECONDS: u64 = 1;
const MAX_TTL_SECONDS: u64 = 24 * 60 * 60;

/// Configuration for one cache instance.
#[derive(Debug, Clone, Default)]
pub struct TtlCacheBuilder {
    ttl: Option<Duration>,
    max_capacity: Option<usize>,
}

impl TtlCacheBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries expire this long after being written.
    pub fn expire_after_write(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Bound the number of entries. When full, expired entries are purged
    /// first; if still full, the oldest entry is evicted.
    pub fn max_capacity(mut self, capacity: usize) -> Self {
        self.max_capacity = Some(capacity);
        self
    }

    pub fn build<V: Clone>(self) -> TtlCache<V> {
        TtlCache {
            entries: DashMap::new(),
            ttl: self.ttl,
            max_capacity: self.max_capacity,
        }
    }
}

struct Entry<V> {
    value: V,
    inserted: Instant,
    expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|e| e <= now)
    }
}

/// A single named cache: string keys, cloneable values, write-expiry.
pub struct TtlCache<V> {
    entries: DashMap<String, Entry<V>>,
    ttl: Option<Duration>,
    max_capacity: Option<usize>,
}

impl<V: Clone> TtlCache<V> {
    /// Look up a value; expired entries are removed and reported as absent.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            None => return None,
            Some(entry) if entry.is_expired(now) => true,
            Some(entry) => return Some(entry.value.clone()),
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    /// Insert a value, evicting as needed to respect the capacity bound.
    pub fn insert(&self, key: String, value: V) {
        let now = Instant::now();

        if let Some(cap) = self.max_capacity
            && self.entries.len() >= cap
            && !self.entries.contains_key(&key)
        {
            self.purge_expired(now);
            if self.entries.len() >= cap {
                self.evict_oldest();
            }
        }

        self.entries.insert(
            key,
            Entry {
                value,
                inserted: now,
                expires_at: self.ttl.map(|ttl| now + ttl),
            },
        );
    }

    /// Number of live (possibly stale-but-unexpired) entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn purge_expired(&self, now: Instant) {
        self.entries.retain(|_, entry| !entry.is_expired(now));
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.inserted)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}

/// Parse the TTL suffix out of a cache name. Invalid suffixes (non-numeric,
/// overflow, empty base) fall back to `None`, i.e. base configuration.
fn parse_ttl_suffix(name: &str) -> Option<Duration> {
    let (base, ttl) = name.trim().rsplit_once(":ttl=")?;
    if base.is_empty() {
        return None;
    }
    let seconds: u64 = ttl.parse().ok()?;
    Some(Duration::from_secs(
        seconds.clamp(MIN_TTL_SECONDS, MAX_TTL_SECONDS),
    ))
}

/// Lazily materializes named caches of chain values, one per distinct name.
pub struct TtlCacheManager {
    base_builder_factory: Arc<dyn Fn() -> TtlCacheBuilder + Send + Sync>,
    caches: DashMap<String, Arc<TtlCache<Value>>>,
}

impl TtlCacheManager {
    /// Create a manager over a base-builder factory. The factory is invoked
    /// once per materialized cache so each cache gets its own configuration.
    pub fn new<F>(base_builder_factory: F) -> Self
    where
        F: Fn() -> TtlCacheBuilder + Send + Sync + 'static,
    {
        Self {
            base_builder_factory: Arc::new(base_builder_factory),
            caches: DashMap::new(),
        }
    }

    /// Manager mirroring the default production configuration: bounded to
    /// 50 000 entries with a 10-minute fallback expiry.
    pub fn with_defaults() -> Self {
        Self::new(|| {
            TtlCacheBuilder::new()
                .max_capacity(50_000)
                .expire_after_write(Duration::from_secs(600))
        })
    }

    /// Materialize (or return the existing) cache for `name`.
    ///
    /// Stable identity: the same name always returns the same instance. The
    /// full name, including any `:ttl=` suffix, is the cache identity, so
    /// differing TTLs never share a cache.
    pub fn cache(&self, name: &str) -> Arc<TtlCache<Value>> {
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| {
                let mut builder = (self.base_builder_factory)();
                if let Some(ttl) = parse_ttl_suffix(name) {
                    builder = builder.expire_after_write(ttl);
                }
                Arc::new(builder.build())
            })
            .clone()
    }

    /// Number of materialized caches.
    pub fn cache_count(&self) -> usize {
        self.caches.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager() -> TtlCacheManager {
        TtlCacheManager::new(|| TtlCacheBuilder::new().max_capacity(100))
    }

    #[test]
    fn test_parse_ttl_suffix() {
        assert_eq!(
            parse_ttl_suffix("demo:ttl=30"),
            Some(Duration::from_secs(30))
        );
        assert_eq!(parse_ttl_suffix("demo"), None);
        assert_eq!(parse_ttl_suffix("demo:ttl=abc"), None);
        assert_eq!(parse_ttl_suffix(":ttl=30"), None);
    }

    #[test]
    fn test_parse_ttl_suffix_clamps() {
        assert_eq!(
            parse_ttl_suffix("demo:ttl=0"),
            Some(Duration::from_secs(1))
        );
        assert_eq!(
            parse_ttl_suffix("demo:ttl=999999999"),
            Some(Duration::from_secs(MAX_TTL_SECONDS))
        );
    }

    #[tokio::test]
    async fn test_same_name_returns_same_instance() {
        let manager = manager();

        let a = manager.cache("x:ttl=10");
        let b = manager.cache("x:ttl=10");

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.cache_count(), 1);
    }

    #[tokio::test]
    async fn test_different_ttl_names_are_independent_caches() {
        let manager = manager();

        let c60 = manager.cache("demo:ttl=60");
        let c30 = manager.cache("demo:ttl=30");

        assert!(!Arc::ptr_eq(&c60, &c30));

        c60.insert("k".to_string(), json!("v1"));
        assert_eq!(c60.get("k"), Some(json!("v1")));
        assert_eq!(c30.get("k"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_write() {
        let manager = manager();
        let cache = manager.cache("demo:ttl=30");

        cache.insert("k".to_string(), json!(42));
        assert_eq!(cache.get("k"), Some(json!(42)));

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(cache.get("k"), Some(json!(42)));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get("k"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_suffix_uses_base_configuration() {
        let manager = TtlCacheManager::new(|| {
            TtlCacheBuilder::new().expire_after_write(Duration::from_secs(5))
        });
        let cache = manager.cache("plain");

        cache.insert("k".to_string(), json!(1));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.get("k"), None);
    }

    #[tokio::test]
    async fn test_capacity_bound_evicts_oldest() {
        let cache: TtlCache<Value> = TtlCacheBuilder::new().max_capacity(2).build();

        cache.insert("a".to_string(), json!(1));
        cache.insert("b".to_string(), json!(2));
        cache.insert("c".to_string(), json!(3));

        assert_eq!(cache.len(), 2);
        // Oldest entry was evicted.
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("c"), Some(json!(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_bound_prefers_purging_expired() {
        let cache: TtlCache<Value> = TtlCacheBuilder::new()
            .max_capacity(2)
            .expire_after_write(Duration::from_secs(10))
            .build();

        cache.insert("a".to_string(), json!(1));
        tokio::time::advance(Duration::from_secs(11)).await;
        cache.insert("b".to_string(), json!(2));
        cache.insert("c".to_string(), json!(3));

        // "a" was expired and purged; "b" survives.
        assert_eq!(cache.get("b"), Some(json!(2)));
        assert_eq!(cache.get("c"), Some(json!(3)));
    }

    #[tokio::test]
    async fn test_overwrite_does_not_evict() {
        let cache: TtlCache<Value> = TtlCacheBuilder::new().max_capacity(2).build();

        cache.insert("a".to_string(), json!(1));
        cache.insert("b".to_string(), json!(2));
        cache.insert("a".to_string(), json!(10));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), Some(json!(10)));
        assert_eq!(cache.get("b"), Some(json!(2)));
    }
}
