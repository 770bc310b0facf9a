//! Rate-limit stage: per-subject-type token consumption with fail-fast
//! denial.
//!
//! # Algorithm
//!
//! Uses the Governor crate, which implements a Generic Cell Rate Algorithm
//! (GCRA, "leaky bucket as a meter") with a one-second refresh horizon.
//! `burst > 0` is approximated by raising the per-period limit to
//! `max(permits, burst)`; this is not a true token bucket, and callers
//! should treat it as such.
//!
//! # Limiter cardinality
//!
//! Limiters are cached by the triple `(methodKey, subjectType,
//! limitForPeriod)` - deliberately NOT by subject identity. Keying by
//! identity would make the limiter map unbounded; the per-identity limiter
//! belongs at the edge. This stage is defense-in-depth for expensive
//! operations.
//!
//! # Outcome
//!
//! Granted -> the inner stage runs, and the call counts as "allowed"
//! regardless of whether the handler then fails. Denied -> `RateLimited`
//! with `Retry-After` derived from the limiter's earliest-permit estimate,
//! floored at one second.

use std::num::NonZeroU32;
use std::sync::Arc;

use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde_json::Value;

use crate::chain::{CallFn, CallFuture};
use crate::context::CallContext;
use crate::error::{ToolkitError, ToolkitResult};
use crate::metrics;
use crate::policy::PolicyService;
use crate::support::clamp_override;

const PERMITS_MIN: i64 = 1;
const PERMITS_MAX: i64 = 100_000;
const BURST_MIN: i64 = 0;
const BURST_MAX: i64 = 100_000;

/// Declarative rate limit for one operation.
#[derive(Debug, Clone)]
pub struct RateLimitSpec {
    /// Allowed operations per second. Clamped to `[1, 100000]`.
    pub permits_per_second: u32,
    /// Burst approximation: when > 0 the per-period limit becomes
    /// `max(permits_per_second, burst)`.
    pub burst: u32,
}

impl RateLimitSpec {
    pub fn new(permits_per_second: u32, burst: u32) -> Self {
        Self {
            permits_per_second,
            burst,
        }
    }
}

/// Cardinality-bounded limiter cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LimiterKey {
    method_key: String,
    subject_type: &'static str,
    limit_for_period: u32,
}

/// Concurrent once-only registry of limiters, shared across operations.
#[derive(Default)]
pub struct RateLimiterRegistry {
    limiters: DashMap<LimiterKey, Arc<DefaultDirectRateLimiter>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn acquire(&self, key: LimiterKey) -> Arc<DefaultDirectRateLimiter> {
        if let Some(limiter) = self.limiters.get(&key) {
            return limiter.clone();
        }

        // limit_for_period >= 1 by clamping, so the unwrap_or is unreachable
        // but keeps this constructor panic-free.
        let limit = NonZeroU32::new(key.limit_for_period).unwrap_or(NonZeroU32::MIN);
        self.limiters
            .entry(key)
            .or_insert_with(|| Arc::new(RateLimiter::direct(Quota::per_second(limit))))
            .clone()
    }

    /// Number of distinct limiters materialized so far.
    pub fn limiter_count(&self) -> usize {
        self.limiters.len()
    }
}

pub struct RateLimitStage {
    spec: RateLimitSpec,
    policies: Arc<PolicyService>,
    registry: Arc<RateLimiterRegistry>,
}

impl RateLimitStage {
    pub fn new(
        spec: RateLimitSpec,
        policies: Arc<PolicyService>,
        registry: Arc<RateLimiterRegistry>,
    ) -> Self {
        Self {
            spec,
            policies,
            registry,
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
        let policy = ctx.policy(&self.policies).await?;
        if policy.is_some_and(|p| !p.enabled) {
            return next(ctx, args).await;
        }

        let permits = clamp_override(
            policy.and_then(|p| p.rl_permits_per_sec).map(i64::from),
            i64::from(self.spec.permits_per_second.max(1)),
            PERMITS_MIN,
            PERMITS_MAX,
        ) as u32;
        let burst = clamp_override(
            policy.and_then(|p| p.rl_burst).map(i64::from),
            i64::from(self.spec.burst),
            BURST_MIN,
            BURST_MAX,
        ) as u32;

        let limit_for_period = if burst > 0 { permits.max(burst) } else { permits };
        let subject_type = ctx.subject.subject_type.tag();
        let metric_key = ctx.method_key.metric();

        let limiter = self.registry.acquire(LimiterKey {
            method_key: metric_key.to_string(),
            subject_type,
            limit_for_period,
        });

        match limiter.check() {
            Ok(()) => {
                // Allowed is counted at the decision, independent of what the
                // inner call does afterwards.
                metrics::record_rate_limit_allowed(metric_key, subject_type);
                next(ctx, args).await
            }
            Err(not_until) => {
                let wait = not_until.wait_time_from(DefaultClock::default().now());
                let retry_after_secs = wait.as_secs().max(1);

                metrics::record_rate_limit_rejected(metric_key, subject_type);
                tracing::warn!(
                    method = %ctx.method_key,
                    subject_type,
                    retry_after_secs,
                    "Rate limit exceeded"
                );

                Err(ToolkitError::RateLimited { retry_after_secs })
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::context::RequestMeta;
    use crate::error::ErrorKind;
    use crate::store::memory::MemoryStore;
    use crate::support::MethodKey;
    use serde_json::json;

    fn stage(spec: RateLimitSpec) -> Arc<RateLimitStage> {
        let store = Arc::new(MemoryStore::new());
        Arc::new(RateLimitStage::new(
            spec,
            Arc::new(PolicyService::new(store)),
            Arc::new(RateLimiterRegistry::new()),
        ))
    }

    fn context() -> Arc<CallContext> {
        CallContext::new(
            RequestMeta::internal(),
            MethodKey::new("demo::Service", "ping", &[]),
        )
    }

    fn ok_inner() -> CallFn {
        Arc::new(|_ctx, _args| Box::pin(async { Ok(json!("pong")) }))
    }

    #[tokio::test]
    async fn test_allows_within_limit() {
        let wrapped = stage(RateLimitSpec::new(100, 0)).wrap(ok_inner());

        for _ in 0..5 {
            assert!(wrapped(context(), Value::Null).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_rejects_beyond_burst_with_retry_after() {
        let wrapped = stage(RateLimitSpec::new(2, 2)).wrap(ok_inner());

        let mut rejections = 0;
        for _ in 0..20 {
            match wrapped(context(), Value::Null).await {
                Ok(_) => {}
                Err(ToolkitError::RateLimited { retry_after_secs }) => {
                    assert!(retry_after_secs >= 1);
                    rejections += 1;
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert!(rejections > 0, "expected at least one rejection");
    }

    #[tokio::test]
    async fn test_limiters_are_shared_per_triple() {
        let registry = Arc::new(RateLimiterRegistry::new());
        let store = Arc::new(MemoryStore::new());
        let stage = Arc::new(RateLimitStage::new(
            RateLimitSpec::new(100, 0),
            Arc::new(PolicyService::new(store)),
            registry.clone(),
        ));
        let wrapped = stage.wrap(ok_inner());

        // Many calls from the same (method, subjectType, limit) triple share
        // one limiter: the map stays at cardinality 1.
        for _ in 0..10 {
            wrapped(context(), Value::Null).await.unwrap();
        }

        assert_eq!(registry.limiter_count(), 1);
    }

    #[tokio::test]
    async fn test_policy_override_tightens_limit() {
        use crate::store::PolicyRecord;
        use crate::subject::UNKNOWN_SUBJECT_KEY;
        use chrono::Utc;

        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        store
            .insert_policy(PolicyRecord {
                client_key: UNKNOWN_SUBJECT_KEY.to_string(),
                method_key: "demo::Service#ping()".to_string(),
                enabled: true,
                rl_permits_per_sec: Some(1),
                rl_burst: Some(1),
                retry_max_attempts: None,
                retry_backoff_ms: None,
                cache_ttl_seconds: None,
                idempotency_ttl_seconds: None,
                created_at: now,
                updated_at: now,
            })
            .await;
        let stage = Arc::new(RateLimitStage::new(
            RateLimitSpec::new(1000, 1000),
            Arc::new(PolicyService::new(store)),
            Arc::new(RateLimiterRegistry::new()),
        ));
        let wrapped = stage.wrap(ok_inner());

        let mut rejected = false;
        for _ in 0..5 {
            if matches!(
                wrapped(context(), Value::Null).await,
                Err(ref e) if e.kind() == ErrorKind::RateLimited
            ) {
                rejected = true;
            }
        }

        assert!(rejected, "policy-tightened limit should reject");
    }

    #[tokio::test]
    async fn test_disabled_policy_bypasses_stage() {
        use crate::store::PolicyRecord;
        use crate::subject::UNKNOWN_SUBJECT_KEY;
        use chrono::Utc;

        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        store
            .insert_policy(PolicyRecord {
                client_key: UNKNOWN_SUBJECT_KEY.to_string(),
                method_key: "demo::Service#ping()".to_string(),
                enabled: false,
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
        let stage = Arc::new(RateLimitStage::new(
            RateLimitSpec::new(1, 1),
            Arc::new(PolicyService::new(store)),
            Arc::new(RateLimiterRegistry::new()),
        ));
        let wrapped = stage.wrap(ok_inner());

        // Far beyond 1 rps, but the disabled policy bypasses limiting.
        for _ in 0..10 {
            assert!(wrapped(context(), Value::Null).await.is_ok());
        }
    }
}
