//! Idempotency stage: durable suppression of repeated writes sharing a key.
//!
//! # Protocol
//!
//! 1. The idempotency key comes from the request context (`X-Idempotency-Key`
//!    header, trimmed and length-capped upstream). Missing key + `require_key`
//!    -> 400; missing key otherwise -> pass-through.
//! 2. The request hash is SHA-256 over the canonical JSON of the argument
//!    tuple.
//! 3. `acquire_or_get` performs the claim transition under a row lock and
//!    returns the current record.
//! 4. A record whose stored hash differs from the caller's is a payload
//!    conflict (409) when `conflict_on_different_request` is set - a reused
//!    key with a different body is a client bug, not a retry.
//! 5. `COMPLETED` records serve the stored response; `FAILED` records
//!    conflict (the caller should pick a fresh key).
//! 6. A `PENDING` record owned by someone else is short-polled (200 ms steps,
//!    2 s budget) in case the owner terminalizes quickly; otherwise the call
//!    conflicts as in-flight. The short-poll honors cancellation at every
//!    step because the sleeps are drop-cancelled with the request future.
//! 7. The owner executes the inner stage and terminalizes the record with
//!    `mark_completed` / `mark_failed`.
//!
//! Ownership is asserted by correlation id, not by the idempotency key:
//! identical keys arriving in different requests are different owners.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::{sleep, Instant};

use crate::chain::{CallFn, CallFuture};
use crate::context::CallContext;
use crate::error::{ToolkitError, ToolkitResult};
use crate::metrics;
use crate::policy::PolicyService;
use crate::store::{IdempotencyRecord, IdempotencyStatus, IdempotencyStore};
use crate::support::{clamp_override, sha256_hex};

/// Short-poll budget for a foreign in-flight record.
const IN_FLIGHT_WAIT_MAX: Duration = Duration::from_secs(2);
const IN_FLIGHT_WAIT_STEP: Duration = Duration::from_millis(200);

/// Clamp bounds for policy TTL overrides: one minute to seven days.
const TTL_MIN_SECONDS: i64 = 60;
const TTL_MAX_SECONDS: i64 = 7 * 24 * 3600;

/// Declarative idempotency for one operation.
#[derive(Debug, Clone)]
pub struct IdempotencySpec {
    pub enabled: bool,
    /// Record lifetime in seconds. Policy override clamped to
    /// `[60, 604800]`; an override of 0 disables idempotency for the call.
    pub ttl_seconds: u64,
    /// Treat a missing idempotency key as a client error (400).
    pub require_key: bool,
    /// Reject key reuse with a different request payload (409).
    pub conflict_on_different_request: bool,
    /// Reject concurrent in-flight requests under the same key after a short
    /// poll (409); when false, duplicates execute concurrently.
    pub reject_in_flight: bool,
}

impl Default for IdempotencySpec {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: 24 * 60 * 60,
            require_key: false,
            conflict_on_different_request: true,
            reject_in_flight: true,
        }
    }
}

impl IdempotencySpec {
    pub fn require_key(mut self, require: bool) -> Self {
        self.require_key = require;
        self
    }

    pub fn ttl_seconds(mut self, ttl: u64) -> Self {
        self.ttl_seconds = ttl;
        self
    }

    pub fn reject_in_flight(mut self, reject: bool) -> Self {
        self.reject_in_flight = reject;
        self
    }
}

pub struct IdempotencyStage {
    spec: IdempotencySpec,
    policies: Arc<PolicyService>,
    store: Arc<dyn IdempotencyStore>,
}

impl IdempotencyStage {
    pub fn new(
        spec: IdempotencySpec,
        policies: Arc<PolicyService>,
        store: Arc<dyn IdempotencyStore>,
    ) -> Self {
        Self {
            spec,
            policies,
            store,
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

        let Some(idem_key) = ctx
            .idempotency_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .map(str::to_string)
        else {
            if self.spec.require_key {
                return Err(ToolkitError::MissingIdempotencyKey);
            }
            return next(ctx, args).await;
        };

        let policy = ctx.policy(&self.policies).await?;
        if policy.is_some_and(|p| !p.enabled) {
            return next(ctx, args).await;
        }

        let ttl_override = policy.and_then(|p| p.idempotency_ttl_seconds);
        if ttl_override.is_some_and(|ttl| ttl <= 0) {
            // Explicitly disabled for this (subject, method) pair.
            return next(ctx, args).await;
        }
        let ttl = Duration::from_secs(clamp_override(
            ttl_override.map(i64::from),
            self.spec.ttl_seconds as i64,
            TTL_MIN_SECONDS,
            TTL_MAX_SECONDS,
        ) as u64);

        let method_key = ctx.method_key.full().to_string();
        let metric_key = ctx.method_key.metric().to_string();
        let request_hash = sha256_hex(&args.to_string());
        let owner = ctx.lock_owner().to_string();

        let record = self
            .store
            .acquire_or_get(&idem_key, &method_key, &request_hash, ttl, &owner)
            .await?;

        // Payload-reuse validation applies to every state, including stored
        // responses: serving a COMPLETED record for a different body would
        // silently hand the caller someone else's result.
        if self.spec.conflict_on_different_request && record.request_hash != request_hash {
            return Err(ToolkitError::KeyPayloadConflict);
        }

        match record.status {
            IdempotencyStatus::Completed => {
                metrics::record_idempotency_served(&metric_key);
                read_stored_response(&record)
            }
            IdempotencyStatus::Failed => Err(ToolkitError::KeyPreviousFailed),
            IdempotencyStatus::Pending
                if self.spec.reject_in_flight
                    && record.locked_by.is_some()
                    && !record.is_locked_by(&owner) =>
            {
                self.await_foreign_owner(&idem_key, &method_key, &metric_key)
                    .await
            }
            IdempotencyStatus::Pending => {
                // Owner of the claim (or reject_in_flight=false): execute.
                metrics::record_idempotency_executed(&metric_key);

                match next(ctx, args).await {
                    Ok(value) => {
                        let response_json =
                            (!value.is_null()).then(|| value.to_string());
                        self.store
                            .mark_completed(&idem_key, &method_key, &request_hash, response_json)
                            .await?;
                        Ok(value)
                    }
                    Err(error) => {
                        // Terminalize, then re-propagate the original error.
                        if let Err(mark_error) = self
                            .store
                            .mark_failed(&idem_key, &method_key, &request_hash, &error.to_string())
                            .await
                        {
                            tracing::warn!(
                                key = %idem_key,
                                method = %method_key,
                                error = %mark_error,
                                "Failed to record idempotency failure"
                            );
                        }
                        Err(error)
                    }
                }
            }
        }
    }

    /// Short-poll a record owned by another caller. If it terminalizes
    /// within the budget, handle the terminal state; otherwise conflict.
    async fn await_foreign_owner(
        &self,
        idem_key: &str,
        method_key: &str,
        metric_key: &str,
    ) -> ToolkitResult<Value> {
        let deadline = Instant::now() + IN_FLIGHT_WAIT_MAX;

        while Instant::now() < deadline {
            sleep(IN_FLIGHT_WAIT_STEP).await;

            let Some(updated) = self.store.read(idem_key, method_key).await? else {
                // Record vanished (expired + cleaned); give up polling.
                break;
            };
            match updated.status {
                IdempotencyStatus::Completed => {
                    metrics::record_idempotency_served(metric_key);
                    return read_stored_response(&updated);
                }
                IdempotencyStatus::Failed => return Err(ToolkitError::KeyPreviousFailed),
                IdempotencyStatus::Pending => {}
            }
        }

        metrics::record_idempotency_inflight_conflict(metric_key);
        Err(ToolkitError::KeyInFlight)
    }
}

/// Deserialize a stored response back into a chain value. An empty stored
/// payload stands for a unit return.
fn read_stored_response(record: &IdempotencyRecord) -> ToolkitResult<Value> {
    match record.response_json.as_deref() {
        None | Some("") => Ok(Value::Null),
        Some(json) => serde_json::from_str(json).map_err(|e| {
            ToolkitError::StoredResponseUnreadable(format!(
                "key={} method={}: {e}",
                record.idempotency_key, record.method_key
            ))
        }),
    }
}
