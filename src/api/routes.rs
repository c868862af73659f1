//! API route configuration.

use std::sync::Arc;

use axum::routing::{any, delete, get, post};
use axum::Router;

use super::handlers;
use super::state::AppState;

/// Create the main router with all routes.
pub fn api_routes(state: Arc<AppState>) -> Router {
    Router::new()
        // Invocation surface
        .route("/invoke/:functionId", any(handlers::invoke))
        .route("/invoke/:functionId/*path", any(handlers::invoke))
        // Scheduler trigger (internal)
        .route("/trigger-scheduled", post(handlers::trigger_scheduled))
        // Cache operations
        .route("/cache/stats", get(handlers::cache_stats))
        .route("/cache/cleanup", post(handlers::cache_cleanup))
        .route("/cache/:functionId", delete(handlers::cache_evict))
        // Introspection
        .route("/metrics", get(handlers::metrics))
        .route("/functions/:functionId/logs", get(handlers::function_logs))
        // Liveness
        .route("/health", get(handlers::health))
        .route("/health/detailed", get(handlers::health_detailed))
        .route("/", get(handlers::api_info))
        .with_state(state)
}
