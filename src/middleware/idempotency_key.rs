//! Idempotency-key capture middleware.
//!
//! Reads `X-Idempotency-Key` (alias `Idempotency-Key`), trims it, caps it at
//! 128 characters, and stores the result in request extensions for the
//! idempotency stage.
//!
//! Presence and format are NOT enforced here: whether a key is required is
//! an operation-level decision (`IdempotencySpec::require_key`), so the
//! middleware only plumbs the value through.

use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, Response};
use tower::{Layer, Service};

/// Primary and alias header names.
pub const IDEMPOTENCY_KEY_HEADER: &str = "x-idempotency-key";
pub const IDEMPOTENCY_KEY_ALIAS: &str = "idempotency-key";

/// Maximum accepted key length; longer keys are cut at this many chars.
pub const MAX_KEY_LENGTH: usize = 128;

/// Request extension carrying the captured key (if any).
#[derive(Debug, Clone)]
pub struct ExtractedIdempotencyKey(pub Option<String>);

/// Idempotency-key layer for the tower middleware stack.
#[derive(Clone, Default)]
pub struct IdempotencyKeyLayer;

impl IdempotencyKeyLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for IdempotencyKeyLayer {
    type Service = IdempotencyKeyService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        IdempotencyKeyService { inner }
    }
}

/// Idempotency-key service wrapper.
#[derive(Clone)]
pub struct IdempotencyKeyService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for IdempotencyKeyService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let key = extract_idempotency_key(&req);
        req.extensions_mut().insert(ExtractedIdempotencyKey(key));
        self.inner.call(req)
    }
}

/// Extract the idempotency key: primary header first, then the alias.
/// Whitespace-only values count as absent.
fn extract_idempotency_key<B>(req: &Request<B>) -> Option<String> {
    [IDEMPOTENCY_KEY_HEADER, IDEMPOTENCY_KEY_ALIAS]
        .iter()
        .find_map(|name| req.headers().get(*name))
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| value.chars().take(MAX_KEY_LENGTH).collect())
}
