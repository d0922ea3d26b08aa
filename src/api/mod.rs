//! REST API module using Axum.
//!
//! Read endpoints serve the materialized log; write endpoints feed the
//! submission queue. The ledger itself is never on an HTTP request path.

pub mod envelope;
pub mod handlers;

pub use handlers::AppContext;

use axum::http::{header, Method};
use axum::routing::{get, post};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the v1 API router.
fn api_routes(ctx: AppContext) -> Router {
    Router::new()
        // Read path
        .route("/events", get(handlers::list_events))
        .route("/events/:build_id", get(handlers::get_event))
        // Write path
        .route("/submissions", post(handlers::submit_event))
        .route("/submissions/:key", get(handlers::submission_state))
        // Operational
        .route("/health", get(handlers::health))
        .route("/stats", get(handlers::stats))
        .with_state(ctx)
}

/// Build a CORS layer that is restrictive by default (same-origin only).
///
/// Set `OPSLEDGER_CORS_ORIGINS` to a comma-separated list of allowed origins
/// for development dashboards.
fn build_cors_layer() -> CorsLayer {
    match std::env::var("OPSLEDGER_CORS_ORIGINS") {
        Ok(origins) => {
            let allowed: Vec<_> = origins
                .split(',')
                .filter_map(|o| o.trim().parse().ok())
                .collect();
            tracing::info!(origins = %origins, "CORS: allowing configured origins");
            CorsLayer::new()
                .allow_origin(allowed)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        }
        Err(_) => CorsLayer::new()
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]),
    }
}

/// Create the complete application router.
pub fn create_app(ctx: AppContext) -> Router {
    Router::new()
        .nest("/api/v1", api_routes(ctx))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(build_cors_layer())
}
