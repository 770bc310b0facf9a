//! API-client credential lookup with a short read-through cache.
//!
//! Creating and rotating credentials is an admin concern outside this
//! service; the toolkit only consumes `find_active_by_hash`. Both hits and
//! misses are cached for 60 seconds so a burst of requests carrying the same
//! (valid or invalid) key produces one database lookup.

use std::sync::Arc;
use std::time::Duration;

use crate::cache_manager::{TtlCache, TtlCacheBuilder};
use crate::error::ToolkitResult;
use crate::store::{CredentialRecord, CredentialStore};

const LOOKUP_CACHE_TTL: Duration = Duration::from_secs(60);
const LOOKUP_CACHE_CAPACITY: usize = 10_000;

/// Read-through cache over the credential store.
pub struct CredentialLookup {
    store: Arc<dyn CredentialStore>,
    cache: TtlCache<Option<CredentialRecord>>,
}

impl CredentialLookup {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self {
            store,
            cache: TtlCacheBuilder::new()
                .expire_after_write(LOOKUP_CACHE_TTL)
                .max_capacity(LOOKUP_CACHE_CAPACITY)
                .build(),
        }
    }

    /// Find the active credential for an API-key hash, consulting the cache
    /// first. The absent case is cached too.
    pub async fn find_active_by_hash(
        &self,
        api_key_hash: &str,
    ) -> ToolkitResult<Option<CredentialRecord>> {
        if let Some(cached) = self.cache.get(api_key_hash) {
            return Ok(cached);
        }

        let loaded = self.store.find_active_by_hash(api_key_hash).await?;
        self.cache
            .insert(api_key_hash.to_string(), loaded.clone());
        Ok(loaded)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Store wrapper that counts how many lookups reach the backend.
    struct CountingStore {
        inner: MemoryStore,
        lookups: AtomicU64,
    }

    #[async_trait]
    impl CredentialStore for CountingStore {
        async fn find_active_by_hash(
            &self,
            api_key_hash: &str,
        ) -> ToolkitResult<Option<CredentialRecord>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.find_active_by_hash(api_key_hash).await
        }
    }

    #[tokio::test]
    async fn test_hit_is_cached() {
        let store = CountingStore {
            inner: MemoryStore::new(),
            lookups: AtomicU64::new(0),
        };
        store
            .inner
            .insert_credential(CredentialRecord {
                api_key_hash: "abc".to_string(),
                client_id: 1,
                active: true,
                created_at: Utc::now(),
            })
            .await;
        let store = Arc::new(store);
        let lookup = CredentialLookup::new(store.clone());

        assert!(lookup.find_active_by_hash("abc").await.unwrap().is_some());
        assert!(lookup.find_active_by_hash("abc").await.unwrap().is_some());

        assert_eq!(store.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_miss_is_cached_too() {
        let store = Arc::new(CountingStore {
            inner: MemoryStore::new(),
            lookups: AtomicU64::new(0),
        });
        let lookup = CredentialLookup::new(store.clone());

        assert!(lookup.find_active_by_hash("nope").await.unwrap().is_none());
        assert!(lookup.find_active_by_hash("nope").await.unwrap().is_none());

        // The absent result was served from cache on the second call.
        assert_eq!(store.lookups.load(Ordering::SeqCst), 1);
    }
}
