//! Liveness endpoint.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// `GET /health`: operator-facing liveness: runtime reachability plus
/// monitor freshness. Returns 503 when the runtime probe fails.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let runtime = match state.runtime.version().await {
        Ok(info) => json!({
            "healthy": true,
            "version": info.version,
            "api_version": info.api_version,
        }),
        Err(e) => json!({
            "healthy": false,
            "error": e.to_string(),
        }),
    };
    let healthy = runtime["healthy"].as_bool().unwrap_or(false);

    let summary = state.monitor.summary();
    let body = json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "uptime_seconds": state.uptime_seconds(),
        "runtime": runtime,
        "last_backup": summary.last_updated,
        "in_flight": state.monitor.in_flight().len(),
    });

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}
