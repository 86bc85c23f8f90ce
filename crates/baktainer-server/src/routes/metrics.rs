//! Metrics projection for dashboards and scrapers.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

use crate::state::AppState;

/// `GET /api/metrics`: monitor summary, active alerts, and artifact
/// statistics in one JSON document.
pub async fn metrics(State(state): State<AppState>) -> Json<Value> {
    let summary = state.monitor.summary();
    let alerts = state.monitor.alerts();

    // The artifact scan touches the filesystem; keep it off the
    // runtime's reactor threads.
    let rotation = Arc::clone(&state.rotation);
    let statistics = match tokio::task::spawn_blocking(move || rotation.statistics()).await {
        Ok(statistics) => statistics,
        Err(e) => {
            warn!(error = %e, "artifact statistics scan failed");
            Default::default()
        }
    };

    Json(json!({
        "summary": summary,
        "alerts": alerts,
        "artifacts": statistics,
    }))
}
