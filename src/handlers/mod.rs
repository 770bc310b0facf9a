//! HTTP handlers and the request-metadata extractor.

pub mod demo;
pub mod health;

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use uuid::Uuid;

use crate::context::RequestMeta;
use crate::middleware::{CorrelationId, ExtractedIdempotencyKey};
use crate::state::AppState;

pub use health::{health_check, readiness_check};

/// Assemble [`RequestMeta`] from the request: correlation id and idempotency
/// key from the middleware extensions, subject via the resolver (which may
/// perform an async credential lookup).
///
/// The correlation-id fallback only fires when the middleware is absent
/// (e.g. a handler tested in isolation); the normal path always finds the
/// extension.
impl FromRequestParts<AppState> for RequestMeta {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let correlation_id = parts
            .extensions
            .get::<CorrelationId>()
            .map(|c| c.0.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let idempotency_key = parts
            .extensions
            .get::<ExtractedIdempotencyKey>()
            .and_then(|k| k.0.clone());

        let peer_addr = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0);

        let subject = state
            .subject_resolver
            .resolve(&parts.headers, peer_addr)
            .await;

        Ok(RequestMeta {
            correlation_id,
            trace_id: None,
            idempotency_key,
            subject,
        })
    }
}
