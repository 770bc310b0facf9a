//! Application routing with the toolkit middleware stack.
//!
//! # Middleware Stack (request order)
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │  Correlation Id  │ ← generated/propagated, echoed on the response
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │ Idempotency Key  │ ← X-Idempotency-Key captured into extensions
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │     Tracing      │ ← HTTP request/response logging
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │      CORS        │ ← Cross-origin headers
//! └────────┬─────────┘
//!          │
//!          ▼
//!      Handler ─ RequestMeta extractor resolves the subject,
//!                then the operation's interceptor chain runs
//! ```

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::middleware::{CorrelationIdLayer, IdempotencyKeyLayer};
use crate::state::AppState;

/// Build the application router with all routes and middleware configured.
pub fn build_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state.config.cors_allowed_origins);

    let router = Router::new()
        // Health & monitoring
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        // Demo operations exercising the toolkit
        .route("/demo/cache", get(handlers::demo::demo_cache))
        .route("/demo/idempotent", post(handlers::demo::demo_idempotent))
        .route("/demo/ratelimited", get(handlers::demo::demo_rate_limited))
        .route("/demo/retry", get(handlers::demo::demo_retry));

    // Layers are applied bottom-to-top: the correlation-id layer added last
    // runs first, so even early rejections carry the echoed header.
    router
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(IdempotencyKeyLayer::new())
        .layer(CorrelationIdLayer::new())
        .with_state(state)
}

/// Build the CORS layer from configuration (`*` = any origin).
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allow_any = allowed_origins.iter().any(|o| o == "*");

    if allow_any {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_cors_layer_any() {
        let origins = vec!["*".to_string()];
        let _layer = build_cors_layer(&origins);
    }

    #[test]
    fn test_build_cors_layer_specific() {
        let origins = vec![
            "https://example.com".to_string(),
            "https://app.example.com".to_string(),
        ];
        let _layer = build_cors_layer(&origins);
    }
}
