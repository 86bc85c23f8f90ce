//! Route table for the observability surface.

pub mod dashboard;
pub mod export;
pub mod health;
pub mod metrics;
pub mod status;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the full read-only router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(dashboard::index))
        .route("/health", get(health::health))
        .route("/api/status", get(status::status))
        .route("/api/containers", get(status::containers))
        .route("/api/history", get(status::history))
        .route("/api/metrics", get(metrics::metrics))
        .route("/api/export", get(export::export))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
