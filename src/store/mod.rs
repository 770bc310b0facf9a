//! Storage contracts for the interceptor toolkit.
//!
//! The core needs three durable relations plus the credential lookup:
//!
//! - **idempotency records** - unique on `(idempotency_key, method_key)`,
//!   claimed and terminalized under row-level pessimistic locking
//! - **audit log** - append-only invocation records
//! - **policy** - per-`(client_key, method_key)` behavior overrides
//! - **credentials** - active API-key hash lookup (managed externally;
//!   only the read contract is consumed here)
//!
//! Backends implement the async traits below. [`postgres::PostgresStore`]
//! is the production backend (sqlx, `SELECT ... FOR UPDATE`);
//! [`memory::MemoryStore`] backs tests and local development.

pub mod memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::ToolkitResult;

/// Lifecycle state of an idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyStatus {
    Pending,
    Completed,
    Failed,
}

impl IdempotencyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            IdempotencyStatus::Pending => "PENDING",
            IdempotencyStatus::Completed => "COMPLETED",
            IdempotencyStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(IdempotencyStatus::Pending),
            "COMPLETED" => Some(IdempotencyStatus::Completed),
            "FAILED" => Some(IdempotencyStatus::Failed),
            _ => None,
        }
    }
}

/// Durable idempotency record, unique on `(idempotency_key, method_key)`.
#[derive(Debug, Clone)]
pub struct IdempotencyRecord {
    pub idempotency_key: String,
    pub method_key: String,
    pub request_hash: String,
    pub status: IdempotencyStatus,
    pub response_json: Option<String>,
    pub error_message: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// An expired record is treated as absent and may be reset by the next
    /// claimant.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|e| e < now)
    }

    /// Whether `owner` currently holds the pending claim on this record.
    pub fn is_locked_by(&self, owner: &str) -> bool {
        self.locked_by.as_deref() == Some(owner)
    }
}

/// Outcome recorded in an audit row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditStatus {
    Ok,
    Error,
}

impl AuditStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditStatus::Ok => "OK",
            AuditStatus::Error => "ERROR",
        }
    }
}

/// Append-only audit record for one operation invocation.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub correlation_id: Option<String>,
    pub trace_id: Option<String>,
    /// Simple name of the component owning the operation.
    pub component: String,
    /// Fully-qualified owning type name.
    pub target_type: String,
    pub method_key: String,
    pub args_json: Option<String>,
    pub result_json: Option<String>,
    pub status: AuditStatus,
    pub duration_ms: i64,
    pub error_message: Option<String>,
    /// Formatted chain of error sources (the Rust analogue of a stacktrace).
    pub error_chain: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-`(client_key, method_key)` behavior overrides.
///
/// All override columns are nullable; `None` means "use the operation's
/// declared default". `enabled = false` bypasses every stage except audit
/// for this pair.
#[derive(Debug, Clone)]
pub struct PolicyRecord {
    pub client_key: String,
    pub method_key: String,
    pub enabled: bool,
    pub rl_permits_per_sec: Option<i32>,
    pub rl_burst: Option<i32>,
    pub retry_max_attempts: Option<i32>,
    pub retry_backoff_ms: Option<i32>,
    pub cache_ttl_seconds: Option<i32>,
    pub idempotency_ttl_seconds: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Active API-client credential, looked up by key hash.
#[derive(Debug, Clone)]
pub struct CredentialRecord {
    pub api_key_hash: String,
    pub client_id: i64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Durable idempotency store with pessimistic claim semantics.
///
/// All three mutating entry points must be atomic at row granularity: an
/// observer never sees a partially-applied transition.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Claim or inspect the record for `(key, method_key)`:
    ///
    /// - absent: insert a `PENDING` record owned by `lock_owner`
    /// - expired: reset to `PENDING` with the caller's hash, owned by
    ///   `lock_owner`
    /// - `PENDING` and unlocked: take the lock
    /// - otherwise: return the row unchanged
    ///
    /// Runs in its own transaction under a row lock on the pair.
    async fn acquire_or_get(
        &self,
        key: &str,
        method_key: &str,
        request_hash: &str,
        ttl: Duration,
        lock_owner: &str,
    ) -> ToolkitResult<IdempotencyRecord>;

    /// Plain read without locking (used by the short-poll).
    async fn read(&self, key: &str, method_key: &str) -> ToolkitResult<Option<IdempotencyRecord>>;

    /// Transition the record to `COMPLETED`, storing the serialized response
    /// and clearing the lock. `response_json` is `None` for unit returns.
    async fn mark_completed(
        &self,
        key: &str,
        method_key: &str,
        request_hash: &str,
        response_json: Option<String>,
    ) -> ToolkitResult<()>;

    /// Transition the record to `FAILED`, storing the error message and
    /// clearing the lock.
    async fn mark_failed(
        &self,
        key: &str,
        method_key: &str,
        request_hash: &str,
        error_message: &str,
    ) -> ToolkitResult<()>;

    /// Bulk-delete records whose `expires_at` is non-null and in the past.
    /// Returns the number of deleted rows.
    async fn delete_expired(&self) -> ToolkitResult<u64>;
}

/// Append-only audit sink. Must run isolated from the business transaction:
/// a failure here is the caller's to log and drop.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, record: AuditRecord) -> ToolkitResult<()>;
}

/// Policy lookup by `(client_key, method_key)`.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn find(
        &self,
        client_key: &str,
        method_key: &str,
    ) -> ToolkitResult<Option<PolicyRecord>>;
}

/// Credential lookup by API-key hash. Only active credentials are returned.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find_active_by_hash(
        &self,
        api_key_hash: &str,
    ) -> ToolkitResult<Option<CredentialRecord>>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            IdempotencyStatus::Pending,
            IdempotencyStatus::Completed,
            IdempotencyStatus::Failed,
        ] {
            assert_eq!(IdempotencyStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(IdempotencyStatus::parse("bogus"), None);
    }

    #[test]
    fn test_record_expiry() {
        let now = Utc::now();
        let record = IdempotencyRecord {
            idempotency_key: "k".to_string(),
            method_key: "m".to_string(),
            request_hash: "h".to_string(),
            status: IdempotencyStatus::Pending,
            response_json: None,
            error_message: None,
            expires_at: Some(now - chrono::Duration::seconds(1)),
            locked_at: None,
            locked_by: None,
            created_at: now,
            updated_at: now,
        };

        assert!(record.is_expired(now));

        let fresh = IdempotencyRecord {
            expires_at: Some(now + chrono::Duration::seconds(60)),
            ..record.clone()
        };
        assert!(!fresh.is_expired(now));

        let no_expiry = IdempotencyRecord {
            expires_at: None,
            ..record
        };
        assert!(!no_expiry.is_expired(now));
    }

    #[test]
    fn test_lock_ownership() {
        let now = Utc::now();
        let record = IdempotencyRecord {
            idempotency_key: "k".to_string(),
            method_key: "m".to_string(),
            request_hash: "h".to_string(),
            status: IdempotencyStatus::Pending,
            response_json: None,
            error_message: None,
            expires_at: None,
            locked_at: Some(now),
            locked_by: Some("corr-1".to_string()),
            created_at: now,
            updated_at: now,
        };

        assert!(record.is_locked_by("corr-1"));
        assert!(!record.is_locked_by("corr-2"));
    }
}
