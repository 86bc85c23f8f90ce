//! Backup status projections.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use baktainer_core::monitor::MonitorSummary;

use crate::state::AppState;

/// `GET /api/status`: the monitor's derived summary.
pub async fn status(State(state): State<AppState>) -> Json<MonitorSummary> {
    Json(state.monitor.summary())
}

/// `GET /api/containers`: per-container aggregates plus in-flight work.
pub async fn containers(State(state): State<AppState>) -> Json<Value> {
    let stats: Vec<_> = state
        .monitor
        .container_names()
        .into_iter()
        .map(|name| state.monitor.per_container(&name))
        .collect();
    let in_flight: Vec<_> = state
        .monitor
        .in_flight()
        .into_iter()
        .map(|(container, engine)| json!({ "container": container, "engine": engine }))
        .collect();

    Json(json!({
        "containers": stats,
        "in_flight": in_flight,
    }))
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<usize>,
    #[serde(default)]
    pub failures_only: bool,
}

/// `GET /api/history?limit=N[&failures_only=true]`: recent records,
/// newest first.
pub async fn history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Json<Value> {
    let limit = params.limit.unwrap_or(50).min(1000);
    let records = if params.failures_only {
        state.monitor.failures(limit)
    } else {
        state.monitor.recent(limit)
    };
    Json(json!({ "records": records }))
}
