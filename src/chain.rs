//! Chain composition: wrapping operation handlers in the declared stages.
//!
//! The whole toolkit reduces to a single function contract:
//!
//! ```text
//! (Arc<CallContext>, Value) -> Result<Value, ToolkitError>
//! ```
//!
//! Every stage is an adapter over that contract, and composing a chain is
//! just folding the declared stages around the handler, innermost first:
//!
//! ```text
//! audit( idempotency( cache( rate_limit( retry( handler )))))
//! ```
//!
//! A stage whose specification is absent simply does not appear in the fold.
//! There is no trait object per stage and no dynamic dispatch beyond the
//! boxed call itself - a deliberately static list of decorators.
//!
//! [`Toolkit::register`] wraps each operation exactly once: registering the
//! same method key again returns the already-composed operation, so re-wrap
//! is idempotent by construction.
//!
//! Typed handlers and typed invocation adapt in and out of the `Value`
//! contract at the edges; the operation's return type is fixed at
//! registration time, which is what lets a stored idempotent response be
//! deserialized correctly long after the original call.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::cache_manager::TtlCacheManager;
use crate::config::Config;
use crate::context::{CallContext, RequestMeta};
use crate::error::{ToolkitError, ToolkitResult};
use crate::policy::PolicyService;
use crate::stages::audit::AuditStage;
use crate::stages::cache::CacheStage;
use crate::stages::idempotency::IdempotencyStage;
use crate::stages::rate_limit::{RateLimitStage, RateLimiterRegistry};
use crate::stages::retry::RetryStage;
use crate::stages::{AuditSpec, CacheSpec, IdempotencySpec, RateLimitSpec, RetrySpec};
use crate::store::{AuditStore, IdempotencyStore};
use crate::support::MethodKey;

/// Boxed future of one chain call.
pub type CallFuture = Pin<Box<dyn Future<Output = ToolkitResult<Value>> + Send>>;

/// The single function contract every stage adapts.
pub type CallFn = Arc<dyn Fn(Arc<CallContext>, Value) -> CallFuture + Send + Sync>;

/// The subset of stages declared for one operation.
#[derive(Debug, Clone, Default)]
pub struct StageSpecs {
    pub audit: Option<AuditSpec>,
    pub idempotency: Option<IdempotencySpec>,
    pub cache: Option<CacheSpec>,
    pub rate_limit: Option<RateLimitSpec>,
    pub retry: Option<RetrySpec>,
}

impl StageSpecs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn audit(mut self, spec: AuditSpec) -> Self {
        self.audit = Some(spec);
        self
    }

    pub fn idempotency(mut self, spec: IdempotencySpec) -> Self {
        self.idempotency = Some(spec);
        self
    }

    pub fn cache(mut self, spec: CacheSpec) -> Self {
        self.cache = Some(spec);
        self
    }

    pub fn rate_limit(mut self, spec: RateLimitSpec) -> Self {
        self.rate_limit = Some(spec);
        self
    }

    pub fn retry(mut self, spec: RetrySpec) -> Self {
        self.retry = Some(spec);
        self
    }
}

/// Process-wide toolkit settings.
#[derive(Debug, Clone)]
pub struct ToolkitSettings {
    /// Master switch: when false, registration returns the bare handler.
    pub enabled: bool,
    /// Default audit truncation cap.
    pub max_payload_chars: usize,
    /// Type-name prefixes whose operations bypass the chain entirely.
    pub exclude_prefixes: Vec<String>,
}

impl ToolkitSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            enabled: config.toolkit_enabled,
            max_payload_chars: config.max_payload_chars,
            exclude_prefixes: config.exclude_prefixes.clone(),
        }
    }
}

impl Default for ToolkitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_payload_chars: 20_000,
            exclude_prefixes: vec![],
        }
    }
}

/// Registry of intercepted operations and the shared services their stages
/// use.
pub struct Toolkit {
    settings: ToolkitSettings,
    audit_store: Arc<dyn AuditStore>,
    idempotency_store: Arc<dyn IdempotencyStore>,
    policies: Arc<PolicyService>,
    cache_manager: Arc<TtlCacheManager>,
    limiters: Arc<RateLimiterRegistry>,
    operations: DashMap<String, InterceptedOperation>,
}

impl Toolkit {
    pub fn new(
        settings: ToolkitSettings,
        audit_store: Arc<dyn AuditStore>,
        idempotency_store: Arc<dyn IdempotencyStore>,
        policies: Arc<PolicyService>,
        cache_manager: Arc<TtlCacheManager>,
    ) -> Self {
        Self {
            settings,
            audit_store,
            idempotency_store,
            policies,
            cache_manager,
            limiters: Arc::new(RateLimiterRegistry::new()),
            operations: DashMap::new(),
        }
    }

    /// Wrap a handler in its declared stages and register it under its
    /// method key.
    ///
    /// Registration happens once per method key: a second call with the same
    /// key returns the operation composed first, regardless of the specs or
    /// handler passed later.
    pub fn register(
        &self,
        method_key: MethodKey,
        specs: StageSpecs,
        handler: CallFn,
    ) -> InterceptedOperation {
        self.operations
            .entry(method_key.full().to_string())
            .or_insert_with(|| {
                let call = self.compose(&method_key, &specs, handler);
                InterceptedOperation { method_key, call }
            })
            .clone()
    }

    /// Look up a previously registered operation.
    pub fn operation(&self, method_key_full: &str) -> Option<InterceptedOperation> {
        self.operations.get(method_key_full).map(|op| op.clone())
    }

    fn compose(&self, method_key: &MethodKey, specs: &StageSpecs, handler: CallFn) -> CallFn {
        if !self.settings.enabled || self.is_excluded(method_key.target_type()) {
            return handler;
        }

        // Fold the declared stages around the handler, innermost first.
        let mut call = handler;

        if let Some(spec) = specs.retry.clone() {
            call = Arc::new(RetryStage::new(spec, self.policies.clone())).wrap(call);
        }
        if let Some(spec) = specs.rate_limit.clone() {
            call = Arc::new(RateLimitStage::new(
                spec,
                self.policies.clone(),
                self.limiters.clone(),
            ))
            .wrap(call);
        }
        if let Some(spec) = specs.cache.clone() {
            call = Arc::new(CacheStage::new(
                spec,
                self.policies.clone(),
                self.cache_manager.clone(),
            ))
            .wrap(call);
        }
        if let Some(spec) = specs.idempotency.clone() {
            call = Arc::new(IdempotencyStage::new(
                spec,
                self.policies.clone(),
                self.idempotency_store.clone(),
            ))
            .wrap(call);
        }
        if let Some(spec) = specs.audit.clone() {
            call = Arc::new(AuditStage::new(
                spec,
                self.audit_store.clone(),
                self.settings.max_payload_chars,
            ))
            .wrap(call);
        }

        call
    }

    fn is_excluded(&self, target_type: &str) -> bool {
        self.settings
            .exclude_prefixes
            .iter()
            .any(|prefix| !prefix.is_empty() && target_type.starts_with(prefix))
    }
}

/// A handler wrapped in its interceptor chain.
#[derive(Clone)]
pub struct InterceptedOperation {
    method_key: MethodKey,
    call: CallFn,
}

impl InterceptedOperation {
    pub fn method_key(&self) -> &MethodKey {
        &self.method_key
    }

    /// Invoke with raw chain values.
    pub async fn invoke_value(&self, meta: RequestMeta, args: Value) -> ToolkitResult<Value> {
        let ctx = CallContext::new(meta, self.method_key.clone());
        (self.call)(ctx, args).await
    }

    /// Invoke with typed arguments and return type.
    ///
    /// `args` should be the operation's argument tuple (`(a,)` for a single
    /// argument); it serializes to the canonical array the stages hash and
    /// audit. The return value may come from a live execution, the cache, or
    /// a stored idempotent response - a value that no longer matches the
    /// operation's return type surfaces as `StoredResponseUnreadable`.
    pub async fn invoke<A, R>(&self, meta: RequestMeta, args: A) -> ToolkitResult<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let args = serde_json::to_value(&args)?;
        let result = self.invoke_value(meta, args).await?;
        serde_json::from_value(result).map_err(|e| {
            ToolkitError::StoredResponseUnreadable(format!(
                "{}: {e}",
                self.method_key.full()
            ))
        })
    }
}

/// Adapt a typed async handler into the chain's function contract.
///
/// The handler receives the call context (correlation id, subject, ...) and
/// its deserialized argument tuple.
pub fn handler_fn<A, R, F, Fut>(handler: F) -> CallFn
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + 'static,
    F: Fn(Arc<CallContext>, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ToolkitResult<R>> + Send + 'static,
{
    let handler = Arc::new(handler);
    Arc::new(move |ctx: Arc<CallContext>, args: Value| -> CallFuture {
        let handler = handler.clone();
        Box::pin(async move {
            let typed: A = serde_json::from_value(args).map_err(|e| {
                ToolkitError::Internal(format!("argument deserialization failed: {e}"))
            })?;
            let result = handler(ctx, typed).await?;
            Ok(serde_json::to_value(result)?)
        })
    })
}
