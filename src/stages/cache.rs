//! Cache stage: short-circuits reads by stable key.
//!
//! The cache key is `(methodKey, argsHash, subjectPart)` where `argsHash` is
//! a structural hash of the canonical-JSON argument tuple - never reference
//! identity, never a nondeterministic serialization. With `Subject` scope
//! the resolved subject key partitions the cache so one caller can never
//! observe another's values; `Global` scope shares entries across callers
//! and is only safe for truly global data.
//!
//! Caching must never turn into a 5xx: every failure in TTL resolution,
//! hashing, or cache access degrades to a pass-through of the inner call.

use std::sync::Arc;

use serde_json::Value;

use crate::cache_manager::TtlCacheManager;
use crate::chain::{CallFn, CallFuture};
use crate::context::CallContext;
use crate::metrics;
use crate::policy::PolicyService;
use crate::subject::SubjectType;
use crate::support::{clamp_override, sha256_hex};
use crate::error::ToolkitResult;

const CACHE_TTL_MIN: i64 = 1;
const CACHE_TTL_MAX: i64 = 3600;

/// Subject part used for `Global` scope and for unresolved subjects.
const GLOBAL_SUBJECT: &str = "global";
const ANONYMOUS_SUBJECT: &str = "anonymous";

/// Cache partitioning scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheScope {
    /// Shared across all callers. Dangerous unless the value is truly
    /// caller-independent.
    Global,
    /// Partitioned per resolved subject (apiKey/user/ip).
    #[default]
    Subject,
}

/// Declarative caching for one operation.
#[derive(Debug, Clone)]
pub struct CacheSpec {
    /// Logical cache name; the effective TTL is appended as a `:ttl=` suffix
    /// when the cache is materialized.
    pub cache_name: String,
    /// Default TTL in seconds. Policy override is clamped to `[1, 3600]`;
    /// an override of 0 disables caching for the call.
    pub ttl_seconds: u64,
    pub scope: CacheScope,
    pub enabled: bool,
}

impl CacheSpec {
    pub fn new(cache_name: impl Into<String>) -> Self {
        Self {
            cache_name: cache_name.into(),
            ttl_seconds: 60,
            scope: CacheScope::Subject,
            enabled: true,
        }
    }

    pub fn ttl_seconds(mut self, ttl: u64) -> Self {
        self.ttl_seconds = ttl;
        self
    }

    pub fn scope(mut self, scope: CacheScope) -> Self {
        self.scope = scope;
        self
    }
}

pub struct CacheStage {
    spec: CacheSpec,
    policies: Arc<PolicyService>,
    cache_manager: Arc<TtlCacheManager>,
}

impl CacheStage {
    pub fn new(
        spec: CacheSpec,
        policies: Arc<PolicyService>,
        cache_manager: Arc<TtlCacheManager>,
    ) -> Self {
        Self {
            spec,
            policies,
            cache_manager,
        }
    }

    pub fn wrap(self: Arc<Self>, next: CallFn) -> CallFn {
        Arc::new(move |ctx: Arc<CallContext>, args: Value| -> CallFuture {
            let stage = self.clone();
            let next = next.clone();
            Box::pin(async move { stage.call(ctx, args, next).await })
        })
    }

    async fn call(
        &self,
        ctx: Arc<CallContext>,
        args: Value,
        next: CallFn,
    ) -> ToolkitResult<Value> {
        if !self.spec.enabled {
            return next(ctx, args).await;
        }

        // Policy lookup failures degrade to a pass-through here, unlike the
        // idempotency and rate-limit stages where they are fatal.
        let policy = match ctx.policy(&self.policies).await {
            Ok(policy) => policy,
            Err(e) => {
                tracing::debug!(
                    method = %ctx.method_key,
                    error = %e,
                    "Cache skipped: policy lookup failed"
                );
                return next(ctx, args).await;
            }
        };

        if policy.is_some_and(|p| !p.enabled) {
            return next(ctx, args).await;
        }

        let ttl_override = policy.and_then(|p| p.cache_ttl_seconds);
        if ttl_override.is_some_and(|ttl| ttl <= 0) {
            // TTL 0 from policy means "disabled for this call".
            return next(ctx, args).await;
        }
        let ttl = clamp_override(
            ttl_override.map(i64::from),
            self.spec.ttl_seconds as i64,
            CACHE_TTL_MIN,
            CACHE_TTL_MAX,
        ) as u64;

        let cache_name = format!("{}:ttl={ttl}", self.spec.cache_name);
        let cache = self.cache_manager.cache(&cache_name);

        let subject_part = match self.spec.scope {
            CacheScope::Global => GLOBAL_SUBJECT,
            CacheScope::Subject => match ctx.subject.subject_type {
                SubjectType::Unknown => ANONYMOUS_SUBJECT,
                _ => ctx.subject.subject_key.as_str(),
            },
        };

        // `args` is already a canonical Value, so its text form is stable.
        let args_hash = sha256_hex(&args.to_string());
        let key = format!("{}|{args_hash}|{subject_part}", ctx.method_key.full());
        let metric_key = ctx.method_key.metric();

        if let Some(hit) = cache.get(&key) {
            metrics::record_cache_hit(&cache_name, metric_key);
            return Ok(hit);
        }

        metrics::record_cache_miss(&cache_name, metric_key);
        let result = next(ctx, args).await?;

        // Unit / null results are not cached.
        if !result.is_null() {
            cache.insert(key, result.clone());
        }
        Ok(result)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::context::RequestMeta;
    use crate::store::memory::MemoryStore;
    use crate::subject::ResolvedSubject;
    use crate::support::MethodKey;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn stage(spec: CacheSpec) -> Arc<CacheStage> {
        let store = Arc::new(MemoryStore::new());
        Arc::new(CacheStage::new(
            spec,
            Arc::new(PolicyService::new(store)),
            Arc::new(TtlCacheManager::with_defaults()),
        ))
    }

    fn context_for(subject_key: &str) -> Arc<CallContext> {
        let subject = ResolvedSubject {
            subject_type: SubjectType::User,
            subject_key: subject_key.to_string(),
            known_api_key: false,
        };
        CallContext::new(
            RequestMeta::internal().with_subject(subject),
            MethodKey::new("demo::Service", "view", &["u64"]),
        )
    }

    /// Inner call returning a fresh counter value on each execution.
    fn counting_inner(calls: Arc<AtomicU32>) -> CallFn {
        Arc::new(move |_ctx, _args| {
            let calls = calls.clone();
            Box::pin(async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(json!({"value": n}))
            })
        })
    }

    #[tokio::test]
    async fn test_second_call_is_served_from_cache() {
        let calls = Arc::new(AtomicU32::new(0));
        let wrapped = stage(CacheSpec::new("demo")).wrap(counting_inner(calls.clone()));

        let first = wrapped(context_for("user:alice"), json!([42])).await.unwrap();
        let second = wrapped(context_for("user:alice"), json!([42])).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_args_miss() {
        let calls = Arc::new(AtomicU32::new(0));
        let wrapped = stage(CacheSpec::new("demo")).wrap(counting_inner(calls.clone()));

        wrapped(context_for("user:alice"), json!([1])).await.unwrap();
        wrapped(context_for("user:alice"), json!([2])).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_subject_scope_partitions_entries() {
        let calls = Arc::new(AtomicU32::new(0));
        let wrapped = stage(CacheSpec::new("demo")).wrap(counting_inner(calls.clone()));

        let a = wrapped(context_for("user:alice"), json!([42])).await.unwrap();
        let b = wrapped(context_for("user:bob"), json!([42])).await.unwrap();

        assert_ne!(a, b);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_global_scope_shares_entries() {
        let calls = Arc::new(AtomicU32::new(0));
        let spec = CacheSpec::new("demo").scope(CacheScope::Global);
        let wrapped = stage(spec).wrap(counting_inner(calls.clone()));

        let a = wrapped(context_for("user:alice"), json!([42])).await.unwrap();
        let b = wrapped(context_for("user:bob"), json!([42])).await.unwrap();

        assert_eq!(a, b);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_subject_falls_back_to_anonymous() {
        let calls = Arc::new(AtomicU32::new(0));
        let wrapped = stage(CacheSpec::new("demo")).wrap(counting_inner(calls.clone()));

        // Two unknown subjects share the anonymous partition.
        let ctx = || {
            CallContext::new(
                RequestMeta::internal(),
                MethodKey::new("demo::Service", "view", &["u64"]),
            )
        };
        let a = wrapped(ctx(), json!([42])).await.unwrap();
        let b = wrapped(ctx(), json!([42])).await.unwrap();

        assert_eq!(a, b);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_null_results_are_not_cached() {
        let calls = Arc::new(AtomicU32::new(0));
        let inner: CallFn = {
            let calls = calls.clone();
            Arc::new(move |_ctx, _args| {
                let calls = calls.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                })
            })
        };
        let wrapped = stage(CacheSpec::new("demo")).wrap(inner);

        wrapped(context_for("user:alice"), json!([1])).await.unwrap();
        wrapped(context_for("user:alice"), json!([1])).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_by_ttl() {
        let calls = Arc::new(AtomicU32::new(0));
        let spec = CacheSpec::new("demo").ttl_seconds(30);
        let wrapped = stage(spec).wrap(counting_inner(calls.clone()));

        wrapped(context_for("user:alice"), json!([42])).await.unwrap();
        tokio::time::advance(std::time::Duration::from_secs(31)).await;
        wrapped(context_for("user:alice"), json!([42])).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_policy_ttl_zero_disables_caching() {
        use crate::store::PolicyRecord;
        use chrono::Utc;

        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        store
            .insert_policy(PolicyRecord {
                client_key: "user:alice".to_string(),
                method_key: "demo::Service#view(u64)".to_string(),
                enabled: true,
                rl_permits_per_sec: None,
                rl_burst: None,
                retry_max_attempts: None,
                retry_backoff_ms: None,
                cache_ttl_seconds: Some(0),
                idempotency_ttl_seconds: None,
                created_at: now,
                updated_at: now,
            })
            .await;
        let stage = Arc::new(CacheStage::new(
            CacheSpec::new("demo"),
            Arc::new(PolicyService::new(store)),
            Arc::new(TtlCacheManager::with_defaults()),
        ));

        let calls = Arc::new(AtomicU32::new(0));
        let wrapped = stage.wrap(counting_inner(calls.clone()));
        wrapped(context_for("user:alice"), json!([1])).await.unwrap();
        wrapped(context_for("user:alice"), json!([1])).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
