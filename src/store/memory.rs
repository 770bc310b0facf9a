//! In-memory storage backend for tests and local development.
//!
//! A single async mutex guards each relation, which makes every claim
//! transition atomic and linearizable per store - the same guarantee the
//! Postgres backend gets from row-level `FOR UPDATE` locks, at coarser
//! granularity.
//!
//! The store also exposes a few inspection hooks (`audit_records`,
//! `idempotency_count`, `policy_lookup_count`, `set_fail_audit`) used by
//! tests to assert the toolkit's storage invariants.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::{ToolkitError, ToolkitResult};
use crate::store::{
    AuditRecord, AuditStore, CredentialRecord, CredentialStore, IdempotencyRecord,
    IdempotencyStatus, IdempotencyStore, PolicyRecord, PolicyStore,
};

type PairKey = (String, String);

/// In-memory implementation of all storage contracts.
#[derive(Default)]
pub struct MemoryStore {
    idempotency: Mutex<HashMap<PairKey, IdempotencyRecord>>,
    audit: Mutex<Vec<AuditRecord>>,
    policies: Mutex<HashMap<PairKey, PolicyRecord>>,
    credentials: Mutex<HashMap<String, CredentialRecord>>,
    /// When set, `append` fails - used to verify audit errors never reach
    /// the business path.
    fail_audit: AtomicBool,
    policy_lookups: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a policy row.
    pub async fn insert_policy(&self, policy: PolicyRecord) {
        self.policies
            .lock()
            .await
            .insert((policy.client_key.clone(), policy.method_key.clone()), policy);
    }

    /// Seed a credential row.
    pub async fn insert_credential(&self, credential: CredentialRecord) {
        self.credentials
            .lock()
            .await
            .insert(credential.api_key_hash.clone(), credential);
    }

    /// Snapshot of all appended audit records.
    pub async fn audit_records(&self) -> Vec<AuditRecord> {
        self.audit.lock().await.clone()
    }

    /// Make subsequent `append` calls fail.
    pub fn set_fail_audit(&self, fail: bool) {
        self.fail_audit.store(fail, Ordering::SeqCst);
    }

    /// Number of idempotency rows currently stored.
    pub async fn idempotency_count(&self) -> usize {
        self.idempotency.lock().await.len()
    }

    /// Fetch one idempotency record (test inspection).
    pub async fn idempotency_record(
        &self,
        key: &str,
        method_key: &str,
    ) -> Option<IdempotencyRecord> {
        self.idempotency
            .lock()
            .await
            .get(&(key.to_string(), method_key.to_string()))
            .cloned()
    }

    /// Number of policy lookups that reached the store (bypassing caches).
    pub fn policy_lookup_count(&self) -> u64 {
        self.policy_lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdempotencyStore for MemoryStore {
    async fn acquire_or_get(
        &self,
        key: &str,
        method_key: &str,
        request_hash: &str,
        ttl: Duration,
        lock_owner: &str,
    ) -> ToolkitResult<IdempotencyRecord> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| ToolkitError::Internal(format!("idempotency ttl out of range: {e}")))?;
        let mut map = self.idempotency.lock().await;
        let pair = (key.to_string(), method_key.to_string());

        match map.get_mut(&pair) {
            None => {
                let record = IdempotencyRecord {
                    idempotency_key: key.to_string(),
                    method_key: method_key.to_string(),
                    request_hash: request_hash.to_string(),
                    status: IdempotencyStatus::Pending,
                    response_json: None,
                    error_message: None,
                    expires_at: Some(now + ttl),
                    locked_at: Some(now),
                    locked_by: Some(lock_owner.to_string()),
                    created_at: now,
                    updated_at: now,
                };
                map.insert(pair, record.clone());
                Ok(record)
            }
            Some(record) => {
                if record.is_expired(now) {
                    // Expired slot is reused by the next claimant.
                    record.request_hash = request_hash.to_string();
                    record.status = IdempotencyStatus::Pending;
                    record.response_json = None;
                    record.error_message = None;
                    record.expires_at = Some(now + ttl);
                    record.locked_at = Some(now);
                    record.locked_by = Some(lock_owner.to_string());
                    record.updated_at = now;
                } else if record.status == IdempotencyStatus::Pending
                    && record.locked_by.as_deref().is_none_or(str::is_empty)
                {
                    record.locked_at = Some(now);
                    record.locked_by = Some(lock_owner.to_string());
                    record.updated_at = now;
                }
                Ok(record.clone())
            }
        }
    }

    async fn read(&self, key: &str, method_key: &str) -> ToolkitResult<Option<IdempotencyRecord>> {
        Ok(self
            .idempotency
            .lock()
            .await
            .get(&(key.to_string(), method_key.to_string()))
            .cloned())
    }

    async fn mark_completed(
        &self,
        key: &str,
        method_key: &str,
        request_hash: &str,
        response_json: Option<String>,
    ) -> ToolkitResult<()> {
        let now = Utc::now();
        let mut map = self.idempotency.lock().await;
        let record = map
            .get_mut(&(key.to_string(), method_key.to_string()))
            .ok_or_else(|| {
                ToolkitError::Internal(format!(
                    "idempotency record missing for key={key} method={method_key}"
                ))
            })?;

        record.request_hash = request_hash.to_string();
        record.status = IdempotencyStatus::Completed;
        record.response_json = response_json;
        record.error_message = None;
        record.locked_at = None;
        record.locked_by = None;
        record.updated_at = now;
        Ok(())
    }

    async fn mark_failed(
        &self,
        key: &str,
        method_key: &str,
        request_hash: &str,
        error_message: &str,
    ) -> ToolkitResult<()> {
        let now = Utc::now();
        let mut map = self.idempotency.lock().await;
        let record = map
            .get_mut(&(key.to_string(), method_key.to_string()))
            .ok_or_else(|| {
                ToolkitError::Internal(format!(
                    "idempotency record missing for key={key} method={method_key}"
                ))
            })?;

        record.request_hash = request_hash.to_string();
        record.status = IdempotencyStatus::Failed;
        record.error_message = Some(error_message.to_string());
        record.locked_at = None;
        record.locked_by = None;
        record.updated_at = now;
        Ok(())
    }

    async fn delete_expired(&self) -> ToolkitResult<u64> {
        let now = Utc::now();
        let mut map = self.idempotency.lock().await;
        let before = map.len();
        map.retain(|_, record| !record.is_expired(now));
        Ok((before - map.len()) as u64)
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn append(&self, record: AuditRecord) -> ToolkitResult<()> {
        if self.fail_audit.load(Ordering::SeqCst) {
            return Err(ToolkitError::Internal(
                "audit sink unavailable".to_string(),
            ));
        }
        self.audit.lock().await.push(record);
        Ok(())
    }
}

#[async_trait]
impl PolicyStore for MemoryStore {
    async fn find(
        &self,
        client_key: &str,
        method_key: &str,
    ) -> ToolkitResult<Option<PolicyRecord>> {
        self.policy_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .policies
            .lock()
            .await
            .get(&(client_key.to_string(), method_key.to_string()))
            .cloned())
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn find_active_by_hash(
        &self,
        api_key_hash: &str,
    ) -> ToolkitResult<Option<CredentialRecord>> {
        Ok(self
            .credentials
            .lock()
            .await
            .get(api_key_hash)
            .filter(|c| c.active)
            .cloned())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::AuditStatus;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_acquire_creates_pending_record() {
        let store = MemoryStore::new();

        let record = store
            .acquire_or_get("key-1", "m#op()", "hash-a", TTL, "owner-1")
            .await
            .unwrap();

        assert_eq!(record.status, IdempotencyStatus::Pending);
        assert_eq!(record.locked_by.as_deref(), Some("owner-1"));
        assert!(record.expires_at.is_some());
        assert_eq!(store.idempotency_count().await, 1);
    }

    #[tokio::test]
    async fn test_acquire_does_not_steal_foreign_lock() {
        let store = MemoryStore::new();

        store
            .acquire_or_get("key-1", "m#op()", "hash-a", TTL, "owner-1")
            .await
            .unwrap();
        let second = store
            .acquire_or_get("key-1", "m#op()", "hash-a", TTL, "owner-2")
            .await
            .unwrap();

        // Still owned by the first claimant; exactly one row exists.
        assert_eq!(second.locked_by.as_deref(), Some("owner-1"));
        assert_eq!(store.idempotency_count().await, 1);
    }

    #[tokio::test]
    async fn test_acquire_takes_over_unlocked_pending() {
        let store = MemoryStore::new();

        store
            .acquire_or_get("key-1", "m#op()", "hash-a", TTL, "owner-1")
            .await
            .unwrap();
        // Simulate a cleared lock without terminal state.
        {
            let mut map = store.idempotency.lock().await;
            let record = map
                .get_mut(&("key-1".to_string(), "m#op()".to_string()))
                .unwrap();
            record.locked_by = None;
            record.locked_at = None;
        }

        let taken = store
            .acquire_or_get("key-1", "m#op()", "hash-a", TTL, "owner-2")
            .await
            .unwrap();
        assert_eq!(taken.locked_by.as_deref(), Some("owner-2"));
    }

    #[tokio::test]
    async fn test_expired_record_is_reset() {
        let store = MemoryStore::new();

        store
            .acquire_or_get("key-1", "m#op()", "hash-a", TTL, "owner-1")
            .await
            .unwrap();
        store
            .mark_completed("key-1", "m#op()", "hash-a", Some("{\"v\":1}".to_string()))
            .await
            .unwrap();

        // Force expiry, then reclaim with a different hash.
        {
            let mut map = store.idempotency.lock().await;
            let record = map
                .get_mut(&("key-1".to_string(), "m#op()".to_string()))
                .unwrap();
            record.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        }

        let reset = store
            .acquire_or_get("key-1", "m#op()", "hash-b", TTL, "owner-2")
            .await
            .unwrap();

        assert_eq!(reset.status, IdempotencyStatus::Pending);
        assert_eq!(reset.request_hash, "hash-b");
        assert!(reset.response_json.is_none());
        assert_eq!(reset.locked_by.as_deref(), Some("owner-2"));
        assert_eq!(store.idempotency_count().await, 1);
    }

    #[tokio::test]
    async fn test_mark_completed_clears_lock() {
        let store = MemoryStore::new();

        store
            .acquire_or_get("key-1", "m#op()", "hash-a", TTL, "owner-1")
            .await
            .unwrap();
        store
            .mark_completed("key-1", "m#op()", "hash-a", Some("{}".to_string()))
            .await
            .unwrap();

        let record = store.idempotency_record("key-1", "m#op()").await.unwrap();
        assert_eq!(record.status, IdempotencyStatus::Completed);
        assert!(record.locked_by.is_none());
        assert!(record.locked_at.is_none());
        assert_eq!(record.response_json.as_deref(), Some("{}"));
    }

    #[tokio::test]
    async fn test_mark_failed_records_message() {
        let store = MemoryStore::new();

        store
            .acquire_or_get("key-1", "m#op()", "hash-a", TTL, "owner-1")
            .await
            .unwrap();
        store
            .mark_failed("key-1", "m#op()", "hash-a", "boom")
            .await
            .unwrap();

        let record = store.idempotency_record("key-1", "m#op()").await.unwrap();
        assert_eq!(record.status, IdempotencyStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some("boom"));
        assert!(record.locked_by.is_none());
    }

    #[tokio::test]
    async fn test_delete_expired_only_removes_expired() {
        let store = MemoryStore::new();

        store
            .acquire_or_get("live", "m#op()", "h", TTL, "o")
            .await
            .unwrap();
        store
            .acquire_or_get("dead", "m#op()", "h", TTL, "o")
            .await
            .unwrap();
        {
            let mut map = store.idempotency.lock().await;
            let record = map
                .get_mut(&("dead".to_string(), "m#op()".to_string()))
                .unwrap();
            record.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        }

        let deleted = store.delete_expired().await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.idempotency_count().await, 1);
        assert!(store.idempotency_record("live", "m#op()").await.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_claims_single_winner() {
        use std::sync::Arc;

        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .acquire_or_get("key-1", "m#op()", "hash-a", TTL, &format!("owner-{i}"))
                    .await
                    .unwrap()
            }));
        }

        let mut owners = std::collections::HashSet::new();
        for handle in handles {
            let record = handle.await.unwrap();
            owners.insert(record.locked_by.unwrap());
        }

        // All contenders observe the same single owner; one row exists.
        assert_eq!(owners.len(), 1);
        assert_eq!(store.idempotency_count().await, 1);
    }

    #[tokio::test]
    async fn test_audit_failure_toggle() {
        let store = MemoryStore::new();
        store.set_fail_audit(true);

        let record = AuditRecord {
            correlation_id: None,
            trace_id: None,
            component: "X".to_string(),
            target_type: "a::X".to_string(),
            method_key: "a::X#op()".to_string(),
            args_json: None,
            result_json: None,
            status: AuditStatus::Ok,
            duration_ms: 1,
            error_message: None,
            error_chain: None,
            created_at: Utc::now(),
        };

        assert!(store.append(record.clone()).await.is_err());

        store.set_fail_audit(false);
        assert!(store.append(record).await.is_ok());
        assert_eq!(store.audit_records().await.len(), 1);
    }

    #[tokio::test]
    async fn test_credential_lookup_filters_inactive() {
        let store = MemoryStore::new();
        store
            .insert_credential(CredentialRecord {
                api_key_hash: "abc".to_string(),
                client_id: 1,
                active: false,
                created_at: Utc::now(),
            })
            .await;

        assert!(store.find_active_by_hash("abc").await.unwrap().is_none());
    }
}
