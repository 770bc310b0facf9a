//! The five interceptor stages, outer to inner:
//!
//! 1. [`audit`] - records outcome and timing of everything below it
//! 2. [`idempotency`] - short-circuits repeated writes sharing a key
//! 3. [`cache`] - short-circuits reads by stable key
//! 4. [`rate_limit`] - rejects calls exceeding the permitted rate
//! 5. [`retry`] - re-invokes the handler body on transient failure
//!
//! Stages execute strictly in this order and unwind in strict reverse.
//! Because retry is innermost, a retried attempt never re-enters cache,
//! idempotency, rate limiting or audit. An operation declares any subset of
//! stages; absent stages are transparent.

pub mod audit;
pub mod cache;
pub mod idempotency;
pub mod rate_limit;
pub mod retry;

pub use audit::AuditSpec;
pub use cache::{CacheScope, CacheSpec};
pub use idempotency::IdempotencySpec;
pub use rate_limit::RateLimitSpec;
pub use retry::RetrySpec;
