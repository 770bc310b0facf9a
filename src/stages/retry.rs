//! Retry stage: bounded re-execution of the handler body on transient
//! failure.
//!
//! This stage sits innermost: a retried attempt is a pure re-execution of
//! the handler - it does not re-enter cache, idempotency, rate limiting or
//! audit. Combined with the idempotency stage, all attempts
//! run under the single outer record, which stays `PENDING` until a final
//! outcome is reached.
//!
//! # Backoff
//!
//! Delay before attempt `n+1` is `base * 2^(n-1)` with uniform
//! multiplicative jitter of +/-20%. Jitter prevents synchronized retry
//! waves when many callers fail at once.
//!
//! # Classification
//!
//! An error is retried iff its root-cause kind is in `retry_on` and not in
//! `ignore_on`. The root cause is found by unwinding the source chain
//! (bounded, so a self-referential chain cannot loop). The default
//! `retry_on` set contains only generic runtime kinds; validation, auth and
//! idempotency conflicts are never retried by default.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tokio::time::sleep;

use crate::chain::{CallFn, CallFuture};
use crate::context::CallContext;
use crate::error::{ErrorKind, ToolkitError, ToolkitResult};
use crate::metrics;
use crate::policy::PolicyService;
use crate::support::clamp_override;

/// Clamp bounds for policy overrides.
const MAX_ATTEMPTS_MIN: i64 = 1;
const MAX_ATTEMPTS_MAX: i64 = 20;
const BACKOFF_MS_MIN: i64 = 0;
const BACKOFF_MS_MAX: i64 = 60_000;

/// Source-chain unwind bound; stops self-cycles.
const MAX_SOURCE_DEPTH: usize = 32;

/// Declarative retry behavior for one operation.
#[derive(Debug, Clone)]
pub struct RetrySpec {
    pub enabled: bool,
    /// Total attempts including the initial call. Clamped to `[1, 20]`.
    pub max_attempts: u32,
    /// Base backoff in milliseconds. Clamped to `[0, 60000]`.
    pub backoff_ms: u64,
    /// Only these kinds are retryable.
    pub retry_on: Vec<ErrorKind>,
    /// Explicit deny-list; matched kinds are never retried even if listed
    /// in `retry_on`.
    pub ignore_on: Vec<ErrorKind>,
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            backoff_ms: 200,
            retry_on: vec![ErrorKind::Transient, ErrorKind::Database, ErrorKind::Internal],
            ignore_on: vec![],
        }
    }
}

impl RetrySpec {
    /// Restrict retries to the given kinds.
    pub fn retry_on(mut self, kinds: Vec<ErrorKind>) -> Self {
        self.retry_on = kinds;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn backoff_ms(mut self, ms: u64) -> Self {
        self.backoff_ms = ms;
        self
    }
}

pub struct RetryStage {
    spec: RetrySpec,
    policies: Arc<PolicyService>,
}

impl RetryStage {
    pub fn new(spec: RetrySpec, policies: Arc<PolicyService>) -> Self {
        Self { spec, policies }
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

        let policy = ctx.policy(&self.policies).await?;
        if policy.is_some_and(|p| !p.enabled) {
            return next(ctx, args).await;
        }

        let max_attempts = clamp_override(
            policy.and_then(|p| p.retry_max_attempts).map(i64::from),
            i64::from(self.spec.max_attempts),
            MAX_ATTEMPTS_MIN,
            MAX_ATTEMPTS_MAX,
        ) as u32;
        let backoff_ms = clamp_override(
            policy.and_then(|p| p.retry_backoff_ms).map(i64::from),
            self.spec.backoff_ms as i64,
            BACKOFF_MS_MIN,
            BACKOFF_MS_MAX,
        ) as u64;

        let metric_key = ctx.method_key.metric().to_string();
        metrics::record_retry_call(&metric_key);
        let started = std::time::Instant::now();

        let mut attempt: u32 = 0;
        let result = loop {
            attempt += 1;
            metrics::record_retry_attempt(&metric_key);

            match next(ctx.clone(), args.clone()).await {
                Ok(value) => break Ok(value),
                Err(error) => {
                    if attempt >= max_attempts || !self.should_retry(&error) {
                        metrics::record_retry_exhausted(&metric_key);
                        break Err(error);
                    }
                    tracing::debug!(
                        method = %ctx.method_key,
                        attempt,
                        error = %error,
                        "Retrying after transient failure"
                    );
                    sleep(backoff_delay(backoff_ms, attempt, rand_jitter())).await;
                }
            }
        };

        metrics::record_retry_duration(&metric_key, started.elapsed().as_secs_f64());
        result
    }

    fn should_retry(&self, error: &ToolkitError) -> bool {
        let kind = root_kind(error);
        !self.spec.ignore_on.contains(&kind) && self.spec.retry_on.contains(&kind)
    }
}

/// Kind of the root cause of an error, found by unwinding the source chain.
///
/// The deepest nested `ToolkitError` wins; foreign tail errors (sqlx, serde)
/// keep the kind of the wrapper that carried them.
pub fn root_kind(error: &ToolkitError) -> ErrorKind {
    let mut kind = error.kind();
    let mut current: &(dyn std::error::Error + 'static) = error;
    for _ in 0..MAX_SOURCE_DEPTH {
        match current.source() {
            Some(source) => {
                if let Some(toolkit) = source.downcast_ref::<ToolkitError>() {
                    kind = toolkit.kind();
                }
                current = source;
            }
            None => break,
        }
    }
    kind
}

/// Delay before the attempt following attempt `attempt` (1-based):
/// `base * 2^(attempt-1)` scaled by a jitter factor in `[0.8, 1.2]`.
///
/// `jitter` is a uniform sample in `[0, 1)`; passing it in keeps the
/// function deterministic for tests.
pub fn backoff_delay(base_ms: u64, attempt: u32, jitter: f64) -> Duration {
    if base_ms == 0 {
        return Duration::ZERO;
    }
    let exponential = base_ms as f64 * 2f64.powi(attempt.saturating_sub(1) as i32);
    let factor = 0.8 + 0.4 * jitter.clamp(0.0, 1.0);
    Duration::from_millis((exponential * factor) as u64)
}

/// Uniform jitter sample in `[0, 1)`.
fn rand_jitter() -> f64 {
    rand::rng().random::<f64>()
}
