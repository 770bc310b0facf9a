//! HTTP middleware plumbing for the interceptor toolkit.
//!
//! These layers run before any handler and populate the request extensions
//! the toolkit consumes:
//!
//! - **Correlation id**: propagated or generated, echoed on every response;
//!   doubles as the idempotency lock-owner identity
//! - **Idempotency key**: trimmed, length-capped capture of
//!   `X-Idempotency-Key` / `Idempotency-Key`
//!
//! Subject resolution (API key, user, IP) happens when request metadata is
//! assembled for a handler - see the `RequestMeta` extractor in the
//! handlers module - because it may need an async credential lookup.

pub mod correlation_id;
pub mod idempotency_key;

pub use correlation_id::{CorrelationId, CorrelationIdLayer, CORRELATION_ID_HEADER};
pub use idempotency_key::{
    ExtractedIdempotencyKey, IdempotencyKeyLayer, IDEMPOTENCY_KEY_HEADER, MAX_KEY_LENGTH,
};
