//! Audit stage: records outcome and timing of every invocation below it.
//!
//! The audit row is written after the inner stages unwind, so it covers
//! short-circuits (cache hits, stored idempotent responses) as well as real
//! executions - both with `OK` status and the wall-clock duration of
//! whatever actually happened. Failures are recorded with the error message
//! and the formatted source chain, then re-propagated untouched.
//!
//! Audit persistence is strictly off the business path: a failing sink is
//! logged and dropped, never surfaced to the caller.
//!
//! # Payload truncation
//!
//! Captured payloads are capped at `max_payload_chars` (per-spec override or
//! process-wide default). An oversized payload is replaced by a truncation
//! envelope that stays valid JSON for `jsonb` columns:
//!
//! ```json
//! {"_truncated": true, "_originalLength": 123456, "_preview": "..."}
//! ```

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::{json, Value};

use crate::chain::{CallFn, CallFuture};
use crate::context::CallContext;
use crate::error::{ToolkitError, ToolkitResult};
use crate::metrics;
use crate::store::{AuditRecord, AuditStatus, AuditStore};

/// Hard cap on the preview inside a truncation envelope.
const PREVIEW_MAX_CHARS: usize = 10_000;

/// Declarative audit behavior for one operation.
#[derive(Debug, Clone)]
pub struct AuditSpec {
    pub enabled: bool,
    /// Capture input arguments. Disable for sensitive or huge payloads.
    pub capture_args: bool,
    /// Capture the return value. Disable for sensitive or huge payloads.
    pub capture_result: bool,
    /// Capture the error source chain on failure.
    pub capture_stacktrace: bool,
    /// Per-operation truncation override; `None` uses the process default.
    pub max_payload_chars: Option<usize>,
}

impl Default for AuditSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            capture_args: true,
            capture_result: true,
            capture_stacktrace: true,
            max_payload_chars: None,
        }
    }
}

impl AuditSpec {
    pub fn capture_args(mut self, capture: bool) -> Self {
        self.capture_args = capture;
        self
    }

    pub fn capture_result(mut self, capture: bool) -> Self {
        self.capture_result = capture;
        self
    }
}

pub struct AuditStage {
    spec: AuditSpec,
    store: Arc<dyn AuditStore>,
    default_max_payload_chars: usize,
}

impl AuditStage {
    pub fn new(spec: AuditSpec, store: Arc<dyn AuditStore>, default_max_payload_chars: usize) -> Self {
        Self {
            spec,
            store,
            default_max_payload_chars,
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

        let started = Instant::now();
        let max_chars = self
            .spec
            .max_payload_chars
            .unwrap_or(self.default_max_payload_chars);

        let args_json = self
            .spec
            .capture_args
            .then(|| truncate_json_safe(args.to_string(), max_chars));

        let result = next(ctx.clone(), args).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        let record = match &result {
            Ok(value) => AuditRecord {
                correlation_id: Some(ctx.correlation_id.clone()),
                trace_id: ctx.trace_id.clone(),
                component: ctx.method_key.simple_target_type().to_string(),
                target_type: ctx.method_key.target_type().to_string(),
                method_key: ctx.method_key.full().to_string(),
                args_json,
                result_json: (self.spec.capture_result && !value.is_null())
                    .then(|| truncate_json_safe(value.to_string(), max_chars)),
                status: AuditStatus::Ok,
                duration_ms,
                error_message: None,
                error_chain: None,
                created_at: Utc::now(),
            },
            Err(error) => AuditRecord {
                correlation_id: Some(ctx.correlation_id.clone()),
                trace_id: ctx.trace_id.clone(),
                component: ctx.method_key.simple_target_type().to_string(),
                target_type: ctx.method_key.target_type().to_string(),
                method_key: ctx.method_key.full().to_string(),
                args_json,
                result_json: None,
                status: AuditStatus::Error,
                duration_ms,
                error_message: Some(truncate_plain(&error.to_string(), max_chars)),
                error_chain: self
                    .spec
                    .capture_stacktrace
                    .then(|| truncate_plain(&error_chain(error), max_chars)),
                created_at: Utc::now(),
            },
        };

        let status = record.status.as_str();
        metrics::record_call_duration(ctx.method_key.metric(), status, started.elapsed().as_secs_f64());
        self.persist_safe(record).await;

        result
    }

    /// Append the record, never letting a sink failure reach the business
    /// path.
    async fn persist_safe(&self, record: AuditRecord) {
        if let Err(error) = self.store.append(record.clone()).await {
            tracing::warn!(
                method = %record.method_key,
                error = %error,
                "Audit persistence failed; record dropped"
            );
        }
    }
}

/// Format the error and its source chain, one cause per line.
fn error_chain(error: &ToolkitError) -> String {
    let mut out = error.to_string();
    let mut current: &(dyn std::error::Error + 'static) = error;
    let mut depth = 0;
    while let Some(source) = current.source() {
        out.push_str("\ncaused by: ");
        out.push_str(&source.to_string());
        current = source;
        depth += 1;
        if depth >= 16 {
            break;
        }
    }
    out
}

/// Truncate a JSON payload into an envelope that remains valid JSON.
fn truncate_json_safe(json_text: String, max_chars: usize) -> String {
    let char_count = json_text.chars().count();
    if max_chars == 0 || char_count <= max_chars {
        return json_text;
    }

    let preview_len = max_chars.min(PREVIEW_MAX_CHARS);
    let preview: String = json_text.chars().take(preview_len).collect();

    json!({
        "_truncated": true,
        "_originalLength": char_count,
        "_preview": preview,
    })
    .to_string()
}

/// Plain-text truncation on a char boundary.
fn truncate_plain(s: &str, max_chars: usize) -> String {
    if max_chars == 0 || s.chars().count() <= max_chars {
        return s.to_string();
    }
    s.chars().take(max_chars).collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::context::RequestMeta;
    use crate::store::memory::MemoryStore;
    use crate::support::MethodKey;
    use serde_json::json;

    fn stage_with(store: Arc<MemoryStore>, spec: AuditSpec) -> Arc<AuditStage> {
        Arc::new(AuditStage::new(spec, store, 20_000))
    }

    fn context() -> Arc<CallContext> {
        CallContext::new(
            RequestMeta::internal(),
            MethodKey::new("demo::PaymentService", "pay", &["Payment"]),
        )
    }

    fn ok_inner() -> CallFn {
        Arc::new(|_ctx, _args| Box::pin(async { Ok(json!({"id": 7})) }))
    }

    fn failing_inner() -> CallFn {
        Arc::new(|_ctx, _args| {
            Box::pin(async { Err(ToolkitError::Transient("backend down".to_string())) })
        })
    }

    #[tokio::test]
    async fn test_success_writes_ok_record() {
        let store = Arc::new(MemoryStore::new());
        let wrapped = stage_with(store.clone(), AuditSpec::default()).wrap(ok_inner());

        wrapped(context(), json!([{"amount": 1}])).await.unwrap();

        let records = store.audit_records().await;
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.status, AuditStatus::Ok);
        assert_eq!(record.component, "PaymentService");
        assert_eq!(record.method_key, "demo::PaymentService#pay(Payment)");
        assert!(record.args_json.as_deref().unwrap().contains("amount"));
        assert!(record.result_json.as_deref().unwrap().contains("7"));
        assert!(record.correlation_id.is_some());
        assert!(record.error_message.is_none());
    }

    #[tokio::test]
    async fn test_failure_writes_error_record_and_repropagates() {
        let store = Arc::new(MemoryStore::new());
        let wrapped = stage_with(store.clone(), AuditSpec::default()).wrap(failing_inner());

        let error = wrapped(context(), json!([1])).await.unwrap_err();
        assert!(matches!(error, ToolkitError::Transient(_)));

        let records = store.audit_records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, AuditStatus::Error);
        assert!(
            records[0]
                .error_message
                .as_deref()
                .unwrap()
                .contains("backend down")
        );
        assert!(records[0].error_chain.is_some());
        assert!(records[0].result_json.is_none());
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_break_business_path() {
        let store = Arc::new(MemoryStore::new());
        store.set_fail_audit(true);
        let wrapped = stage_with(store.clone(), AuditSpec::default()).wrap(ok_inner());

        // The call still succeeds; the record is dropped.
        let result = wrapped(context(), json!([1])).await.unwrap();
        assert_eq!(result, json!({"id": 7}));
        assert!(store.audit_records().await.is_empty());
    }

    #[tokio::test]
    async fn test_capture_flags_disable_payloads() {
        let store = Arc::new(MemoryStore::new());
        let spec = AuditSpec::default()
            .capture_args(false)
            .capture_result(false);
        let wrapped = stage_with(store.clone(), spec).wrap(ok_inner());

        wrapped(context(), json!([1])).await.unwrap();

        let records = store.audit_records().await;
        assert!(records[0].args_json.is_none());
        assert!(records[0].result_json.is_none());
    }

    #[tokio::test]
    async fn test_oversized_payload_is_enveloped() {
        let store = Arc::new(MemoryStore::new());
        let spec = AuditSpec {
            max_payload_chars: Some(50),
            ..AuditSpec::default()
        };
        let wrapped = stage_with(store.clone(), spec).wrap(ok_inner());

        let big = "x".repeat(500);
        wrapped(context(), json!([big])).await.unwrap();

        let records = store.audit_records().await;
        let args_json = records[0].args_json.as_deref().unwrap();
        let envelope: Value = serde_json::from_str(args_json).unwrap();
        assert_eq!(envelope["_truncated"], json!(true));
        assert!(envelope["_originalLength"].as_u64().unwrap() > 50);
        assert_eq!(envelope["_preview"].as_str().unwrap().chars().count(), 50);
    }

    #[tokio::test]
    async fn test_disabled_spec_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let spec = AuditSpec {
            enabled: false,
            ..AuditSpec::default()
        };
        let wrapped = stage_with(store.clone(), spec).wrap(ok_inner());

        wrapped(context(), json!([1])).await.unwrap();
        assert!(store.audit_records().await.is_empty());
    }

    #[test]
    fn test_truncate_json_safe_passthrough() {
        let small = "{\"a\":1}".to_string();
        assert_eq!(truncate_json_safe(small.clone(), 100), small);
    }

    #[test]
    fn test_truncate_plain_char_boundary() {
        // Multi-byte chars must not be split.
        let s = "żółć".repeat(100);
        let truncated = truncate_plain(&s, 10);
        assert_eq!(truncated.chars().count(), 10);
    }

    #[test]
    fn test_error_chain_includes_sources() {
        let serde_error = serde_json::from_str::<Value>("{").unwrap_err();
        let error = ToolkitError::Serialization(serde_error);
        let chain = error_chain(&error);
        assert!(chain.contains("caused by:"));
    }
}
