//! Correlation-id middleware.
//!
//! - Propagates an existing `X-Correlation-Id` header
//! - Generates a UUIDv4 when absent
//! - Stores the id in request extensions for the toolkit (it doubles as the
//!   idempotency lock-owner identity)
//! - Echoes `X-Correlation-Id` on every response
//!
//! Clients that send their own id get the same id back, which makes retried
//! requests in one logical operation share an idempotency lock owner.

use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::HeaderValue;
use axum::http::{Request, Response};
use tower::{Layer, Service};
use tracing::debug;
use uuid::Uuid;

/// Header name for the correlation id.
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Fallback header value when the id fails to parse as a header value.
static UNKNOWN_CORRELATION_ID: HeaderValue = HeaderValue::from_static("unknown");

/// Request extension carrying the resolved correlation id.
#[derive(Debug, Clone)]
pub struct CorrelationId(pub String);

/// Correlation-id layer for the tower middleware stack.
#[derive(Clone, Default)]
pub struct CorrelationIdLayer;

impl CorrelationIdLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for CorrelationIdLayer {
    type Service = CorrelationIdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CorrelationIdService { inner }
    }
}

/// Correlation-id service wrapper.
#[derive(Clone)]
pub struct CorrelationIdService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for CorrelationIdService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let correlation_id = extract_or_generate(&req);

        req.extensions_mut()
            .insert(CorrelationId(correlation_id.clone()));
        debug!(correlation_id = %correlation_id, "Processing request");

        let mut inner = self.inner.clone();

        Box::pin(async move {
            let mut response = inner.call(req).await?;

            response.headers_mut().insert(
                CORRELATION_ID_HEADER,
                correlation_id
                    .parse()
                    .unwrap_or_else(|_| UNKNOWN_CORRELATION_ID.clone()),
            );

            Ok(response)
        })
    }
}

/// Extract the correlation id from headers or generate a new one.
fn extract_or_generate<B>(req: &Request<B>) -> String {
    if let Some(header_value) = req.headers().get(CORRELATION_ID_HEADER)
        && let Ok(value) = header_value.to_str()
        && !value.trim().is_empty()
    {
        return value.trim().to_string();
    }

    Uuid::new_v4().to_string()
}
