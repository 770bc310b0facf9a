//! Request-scoped context threaded through the interceptor chain.
//!
//! [`RequestMeta`] is what the HTTP edge (middleware + subject resolution)
//! produces for a request; [`CallContext`] extends it with the invoked
//! operation's method key and a per-invocation policy memo so that the four
//! policy-driven stages resolve the `(subject, method)` policy at most once
//! per call.

use std::sync::Arc;

use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::error::ToolkitResult;
use crate::policy::PolicyService;
use crate::store::PolicyRecord;
use crate::subject::ResolvedSubject;
use crate::support::MethodKey;

/// Lock owner recorded when no correlation id is available.
const NO_CORRELATION: &str = "no-correlation";

/// Request metadata assembled by the HTTP edge before any operation runs.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    /// Correlation id: taken from `X-Correlation-Id` or generated. Also the
    /// idempotency lock owner identity.
    pub correlation_id: String,
    /// Optional trace id from the tracing infrastructure.
    pub trace_id: Option<String>,
    /// Trimmed `X-Idempotency-Key`, when present.
    pub idempotency_key: Option<String>,
    /// Resolved caller identity.
    pub subject: ResolvedSubject,
}

impl RequestMeta {
    /// Metadata for non-HTTP invocations (background jobs, tests): a fresh
    /// correlation id and an unknown subject.
    pub fn internal() -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            trace_id: None,
            idempotency_key: None,
            subject: ResolvedSubject::unknown(),
        }
    }

    pub fn with_subject(mut self, subject: ResolvedSubject) -> Self {
        self.subject = subject;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Per-invocation context visible to every stage and to the handler body.
pub struct CallContext {
    pub correlation_id: String,
    pub trace_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub subject: ResolvedSubject,
    pub method_key: MethodKey,
    /// Policy resolved at most once per invocation.
    policy: OnceCell<Option<PolicyRecord>>,
}

impl CallContext {
    pub fn new(meta: RequestMeta, method_key: MethodKey) -> Arc<Self> {
        Arc::new(Self {
            correlation_id: meta.correlation_id,
            trace_id: meta.trace_id,
            idempotency_key: meta.idempotency_key,
            subject: meta.subject,
            method_key,
            policy: OnceCell::new(),
        })
    }

    /// The identity written into `locked_by` when this call claims an
    /// idempotency record.
    pub fn lock_owner(&self) -> &str {
        if self.correlation_id.is_empty() {
            NO_CORRELATION
        } else {
            &self.correlation_id
        }
    }

    /// Resolve the policy for this call's `(subject, method)` pair, hitting
    /// the policy service only on first use.
    pub async fn policy(
        &self,
        policies: &PolicyService,
    ) -> ToolkitResult<Option<&PolicyRecord>> {
        let memo = self
            .policy
            .get_or_try_init(|| {
                policies.find(&self.subject.subject_key, self.method_key.full())
            })
            .await?;
        Ok(memo.as_ref())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::PolicyRecord;
    use crate::subject::{SubjectType, UNKNOWN_SUBJECT_KEY};
    use chrono::Utc;

    fn context() -> Arc<CallContext> {
        CallContext::new(
            RequestMeta::internal(),
            MethodKey::new("demo::Service", "op", &[]),
        )
    }

    #[test]
    fn test_internal_meta_generates_correlation_id() {
        let meta = RequestMeta::internal();
        assert!(!meta.correlation_id.is_empty());
        assert_eq!(meta.subject.subject_type, SubjectType::Unknown);
        assert_eq!(meta.subject.subject_key, UNKNOWN_SUBJECT_KEY);
    }

    #[test]
    fn test_lock_owner_falls_back_when_empty() {
        let ctx = CallContext::new(
            RequestMeta {
                correlation_id: String::new(),
                trace_id: None,
                idempotency_key: None,
                subject: ResolvedSubject::unknown(),
            },
            MethodKey::new("demo::Service", "op", &[]),
        );

        assert_eq!(ctx.lock_owner(), NO_CORRELATION);
    }

    #[tokio::test]
    async fn test_policy_is_resolved_once_per_invocation() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let now = Utc::now();
        store
            .insert_policy(PolicyRecord {
                client_key: UNKNOWN_SUBJECT_KEY.to_string(),
                method_key: "demo::Service#op()".to_string(),
                enabled: true,
                rl_permits_per_sec: None,
                rl_burst: None,
                retry_max_attempts: None,
                retry_backoff_ms: None,
                cache_ttl_seconds: None,
                idempotency_ttl_seconds: None,
                created_at: now,
                updated_at: now,
            })
            .await;
        let policies = PolicyService::new(store.clone());
        let ctx = context();

        // Four stages asking for the policy produce a single store lookup.
        for _ in 0..4 {
            assert!(ctx.policy(&policies).await.unwrap().is_some());
        }
        assert_eq!(store.policy_lookup_count(), 1);
    }
}
