//! # Proxy Toolkit
//!
//! A reusable cross-cutting interceptor pipeline for HTTP operation
//! handlers, featuring:
//!
//! - **Audit**: persistent invocation records with payload truncation
//! - **Idempotency**: durable records with concurrent-duplicate suppression
//! - **Cache**: local per-subject caching with per-name TTL
//! - **Rate limiting**: per-subject-type buckets with `Retry-After`
//! - **Retry**: bounded exponential backoff with jitter
//!
//! Per-(client, operation) policy rows in the database override stage
//! parameters at runtime.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Middleware (Correlation Id → Idempotency Key → Trace)      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RequestMeta (subject resolution: apiKey / user / ip)       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Interceptor chain, outer → inner:                          │
//! │    Audit → Idempotency → Cache → RateLimit → Retry          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Handler body                                               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Storage (Postgres: idempotency / audit / policy / creds)   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use proxy_toolkit::{build_router, AppState, Backends, Config};
//! use proxy_toolkit::store::memory::MemoryStore;
//!
//! # async fn run() {
//! let config = Config::default();
//! let backends = Backends::from_memory(Arc::new(MemoryStore::new()));
//! let state = AppState::new(config, backends);
//! let app = build_router(state);
//! // Serve the router...
//! # }
//! ```
//!
//! ## Declaring an operation
//!
//! ```rust,ignore
//! let op = toolkit.register(
//!     MethodKey::of::<PaymentService>("submit", &["PaymentRequest"]),
//!     StageSpecs::new()
//!         .audit(AuditSpec::default())
//!         .idempotency(IdempotencySpec::default().require_key(true))
//!         .retry(RetrySpec::default()),
//!     handler_fn(|ctx, (request,): (PaymentRequest,)| async move {
//!         // business logic
//!     }),
//! );
//! ```

pub mod cache_manager;
pub mod chain;
pub mod config;
pub mod context;
pub mod credentials;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod policy;
pub mod routes;
pub mod stages;
pub mod state;
pub mod store;
pub mod subject;
pub mod support;

// Re-exports for convenience
pub use chain::{handler_fn, CallFn, InterceptedOperation, StageSpecs, Toolkit, ToolkitSettings};
pub use config::Config;
pub use context::{CallContext, RequestMeta};
pub use error::{ErrorKind, ToolkitError, ToolkitResult};
pub use routes::build_router;
pub use state::{AppState, Backends};
pub use support::MethodKey;
