//! Demo endpoints exercising each toolkit behavior end-to-end.
//!
//! | Endpoint                | Stages                                  |
//! |-------------------------|-----------------------------------------|
//! | `GET  /demo/cache`      | audit + cache (60 s, subject scope)     |
//! | `POST /demo/idempotent` | audit + idempotency (key required)      |
//! | `GET  /demo/ratelimited`| audit + rate limit (2/s, burst 2)       |
//! | `GET  /demo/retry`      | audit + retry (4 attempts, 200 ms base) |
//!
//! The retry demo fails deterministically: per `(subject, failTimes)` it
//! throws a transient error on the first `failTimes` attempts and succeeds
//! after, so `GET /demo/retry?failTimes=2` returns `attempt >= 3`.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chain::{handler_fn, InterceptedOperation, StageSpecs, Toolkit};
use crate::context::RequestMeta;
use crate::error::{ErrorKind, ToolkitError, ToolkitResult};
use crate::stages::{AuditSpec, CacheSpec, IdempotencySpec, RateLimitSpec, RetrySpec};
use crate::state::AppState;
use crate::support::MethodKey;

/// Owner type of the demo operations; its name anchors their method keys.
pub struct DemoService;

// =============================================================================
// DTOs
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheDemoResponse {
    pub customer_id: u64,
    /// Stays identical across calls while the cache entry lives.
    pub stable_value: String,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    pub amount: Decimal,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentResponse {
    pub payment_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub status: String,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitedResponse {
    pub status: String,
    pub served_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryDemoResponse {
    pub status: String,
    /// The attempt number that finally succeeded.
    pub attempt: u32,
    pub fail_times: u32,
    pub subject_key: String,
    pub served_at: DateTime<Utc>,
}

// =============================================================================
// Operation registration
// =============================================================================

/// The four demo operations, wrapped in their chains at startup.
pub struct DemoOperations {
    pub cached_customer_view: InterceptedOperation,
    pub idempotent_payment: InterceptedOperation,
    pub rate_limited_ping: InterceptedOperation,
    pub retry_demo: InterceptedOperation,
}

impl DemoOperations {
    pub fn register(toolkit: &Toolkit) -> Self {
        let cached_customer_view = toolkit.register(
            MethodKey::of::<DemoService>("cached_customer_view", &["u64"]),
            StageSpecs::new()
                .audit(AuditSpec::default())
                .cache(CacheSpec::new("demoCustomerCache").ttl_seconds(60)),
            handler_fn(|_ctx, (customer_id,): (u64,)| async move {
                Ok(CacheDemoResponse {
                    customer_id,
                    stable_value: Uuid::new_v4().to_string(),
                    generated_at: Utc::now(),
                })
            }),
        );

        let idempotent_payment = toolkit.register(
            MethodKey::of::<DemoService>("idempotent_payment", &["PaymentRequest"]),
            StageSpecs::new()
                .audit(AuditSpec::default())
                .idempotency(IdempotencySpec::default().require_key(true)),
            handler_fn(|_ctx, (request,): (PaymentRequest,)| async move {
                Ok(PaymentResponse {
                    payment_id: Uuid::new_v4().to_string(),
                    amount: request.amount,
                    currency: request.currency,
                    status: "ACCEPTED".to_string(),
                    processed_at: Utc::now(),
                })
            }),
        );

        let rate_limited_ping = toolkit.register(
            MethodKey::of::<DemoService>("rate_limited_ping", &[]),
            StageSpecs::new()
                .audit(AuditSpec::default().capture_args(false))
                .rate_limit(RateLimitSpec::new(2, 2)),
            handler_fn(|_ctx, (): ()| async {
                Ok(RateLimitedResponse {
                    status: "OK".to_string(),
                    served_at: Utc::now(),
                })
            }),
        );

        // Per-(subject, failTimes) attempt counters; cleared on success so
        // the demo is repeatable.
        let retry_counters: Arc<DashMap<String, u32>> = Arc::new(DashMap::new());
        let retry_demo = toolkit.register(
            MethodKey::of::<DemoService>("retry_demo", &["u32"]),
            StageSpecs::new()
                .audit(AuditSpec::default())
                .retry(
                    RetrySpec::default()
                        .max_attempts(4)
                        .backoff_ms(200)
                        .retry_on(vec![ErrorKind::Transient]),
                ),
            handler_fn(move |ctx, (fail_times,): (u32,)| {
                let counters = retry_counters.clone();
                async move {
                    let subject_key = ctx.subject.subject_key.clone();
                    let counter_key = format!("{subject_key}|failTimes={fail_times}");

                    let attempt = {
                        let mut entry = counters.entry(counter_key.clone()).or_insert(0);
                        *entry += 1;
                        *entry
                    };

                    if attempt <= fail_times {
                        return Err(ToolkitError::Transient(format!(
                            "Simulated transient failure attempt={attempt}/{fail_times}"
                        )));
                    }

                    counters.remove(&counter_key);
                    Ok(RetryDemoResponse {
                        status: "SUCCESS".to_string(),
                        attempt,
                        fail_times,
                        subject_key,
                        served_at: Utc::now(),
                    })
                }
            }),
        );

        Self {
            cached_customer_view,
            idempotent_payment,
            rate_limited_ping,
            retry_demo,
        }
    }
}

// =============================================================================
// HTTP handlers
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheQuery {
    pub customer_id: u64,
}

pub async fn demo_cache(
    State(state): State<AppState>,
    meta: RequestMeta,
    Query(query): Query<CacheQuery>,
) -> ToolkitResult<Json<CacheDemoResponse>> {
    let response = state
        .demo
        .cached_customer_view
        .invoke(meta, (query.customer_id,))
        .await?;
    Ok(Json(response))
}

pub async fn demo_idempotent(
    State(state): State<AppState>,
    meta: RequestMeta,
    Json(request): Json<PaymentRequest>,
) -> ToolkitResult<Json<PaymentResponse>> {
    if request.currency.trim().is_empty() {
        return Err(ToolkitError::Validation(
            "currency must not be empty".to_string(),
        ));
    }

    let response = state
        .demo
        .idempotent_payment
        .invoke(meta, (request,))
        .await?;
    Ok(Json(response))
}

pub async fn demo_rate_limited(
    State(state): State<AppState>,
    meta: RequestMeta,
) -> ToolkitResult<Json<RateLimitedResponse>> {
    let response = state.demo.rate_limited_ping.invoke(meta, ()).await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryQuery {
    #[serde(default = "default_fail_times")]
    pub fail_times: u32,
}

fn default_fail_times() -> u32 {
    2
}

pub async fn demo_retry(
    State(state): State<AppState>,
    meta: RequestMeta,
    Query(query): Query<RetryQuery>,
) -> ToolkitResult<Json<RetryDemoResponse>> {
    if query.fail_times > 10 {
        return Err(ToolkitError::Validation(
            "failTimes must be between 0 and 10".to_string(),
        ));
    }

    let response = state
        .demo
        .retry_demo
        .invoke(meta, (query.fail_times,))
        .await?;
    Ok(Json(response))
}
