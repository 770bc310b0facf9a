//! Per-(subject, operation) policy lookup.
//!
//! Policies are externally managed rows that override stage parameters for
//! one `(subject_key, method_key)` pair: rate-limit permits and burst, retry
//! attempts and backoff, cache TTL, idempotency TTL, or a blanket
//! `enabled = false` that bypasses every stage except audit.
//!
//! Lookups go through a 30-second local cache. Empty results are cached as
//! absent values: without negative caching, every request from a client with
//! no policy row would hit the database (a lookup storm on exactly the hot
//! path policies exist to protect). Invalidation on policy writes is out of
//! scope - rows change rarely and the 30 s staleness window is accepted.

use std::sync::Arc;
use std::time::Duration;

use crate::cache_manager::{TtlCache, TtlCacheBuilder};
use crate::error::ToolkitResult;
use crate::store::{PolicyRecord, PolicyStore};

const POLICY_CACHE_TTL: Duration = Duration::from_secs(30);
const POLICY_CACHE_CAPACITY: usize = 50_000;

/// Read-through cache over the policy store.
pub struct PolicyService {
    store: Arc<dyn PolicyStore>,
    cache: TtlCache<Option<PolicyRecord>>,
}

impl PolicyService {
    pub fn new(store: Arc<dyn PolicyStore>) -> Self {
        Self {
            store,
            cache: TtlCacheBuilder::new()
                .expire_after_write(POLICY_CACHE_TTL)
                .max_capacity(POLICY_CACHE_CAPACITY)
                .build(),
        }
    }

    /// Find the policy for `(subject_key, method_key)`, consulting the cache
    /// first. Hits and misses are both cached.
    pub async fn find(
        &self,
        subject_key: &str,
        method_key: &str,
    ) -> ToolkitResult<Option<PolicyRecord>> {
        let cache_key = format!("{subject_key}|{method_key}");

        if let Some(cached) = self.cache.get(&cache_key) {
            return Ok(cached);
        }

        let loaded = self.store.find(subject_key, method_key).await?;
        self.cache.insert(cache_key, loaded.clone());
        Ok(loaded)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use chrono::Utc;

    fn policy(subject: &str, method: &str) -> PolicyRecord {
        let now = Utc::now();
        PolicyRecord {
            client_key: subject.to_string(),
            method_key: method.to_string(),
            enabled: true,
            rl_permits_per_sec: Some(5),
            rl_burst: None,
            retry_max_attempts: None,
            retry_backoff_ms: None,
            cache_ttl_seconds: None,
            idempotency_ttl_seconds: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_lookup_hits_store_once() {
        let store = Arc::new(MemoryStore::new());
        store.insert_policy(policy("apiKey:abc", "m#op()")).await;
        let service = PolicyService::new(store.clone());

        let first = service.find("apiKey:abc", "m#op()").await.unwrap();
        let second = service.find("apiKey:abc", "m#op()").await.unwrap();

        assert!(first.is_some());
        assert!(second.is_some());
        assert_eq!(store.policy_lookup_count(), 1);
    }

    #[tokio::test]
    async fn test_absent_policy_is_negatively_cached() {
        let store = Arc::new(MemoryStore::new());
        let service = PolicyService::new(store.clone());

        assert!(service.find("user:alice", "m#op()").await.unwrap().is_none());
        assert!(service.find("user:alice", "m#op()").await.unwrap().is_none());
        assert!(service.find("user:alice", "m#op()").await.unwrap().is_none());

        // Repeated misses were served from the cache.
        assert_eq!(store.policy_lookup_count(), 1);
    }

    #[tokio::test]
    async fn test_distinct_pairs_are_cached_independently() {
        let store = Arc::new(MemoryStore::new());
        store.insert_policy(policy("apiKey:abc", "m#a()")).await;
        let service = PolicyService::new(store.clone());

        assert!(service.find("apiKey:abc", "m#a()").await.unwrap().is_some());
        assert!(service.find("apiKey:abc", "m#b()").await.unwrap().is_none());

        assert_eq!(store.policy_lookup_count(), 2);
    }
}
