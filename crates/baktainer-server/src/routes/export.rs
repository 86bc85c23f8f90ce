//! Record export for offline analysis.

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use baktainer_core::monitor::ExportFormat;

use crate::error::ServerError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ExportParams {
    pub format: Option<String>,
}

/// `GET /api/export?format=json|csv`: the full record ring.
pub async fn export(
    State(state): State<AppState>,
    Query(params): Query<ExportParams>,
) -> Result<Response, ServerError> {
    let (format, content_type) = match params.format.as_deref() {
        None | Some("json") => (ExportFormat::Json, "application/json"),
        Some("csv") => (ExportFormat::Csv, "text/csv"),
        Some(other) => {
            return Ok((
                StatusCode::BAD_REQUEST,
                format!("unknown export format '{other}', expected json or csv"),
            )
                .into_response());
        }
    };

    let body = state.monitor.export(format)?;
    Ok(([(header::CONTENT_TYPE, content_type)], body).into_response())
}
