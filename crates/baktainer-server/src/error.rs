//! Error handling for the HTTP surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by API handlers.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("engine error: {0}")]
    Engine(#[from] baktainer_core::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = StatusCode::INTERNAL_SERVER_ERROR;
        let body = Json(json!({
            "error": self.to_string(),
        }));
        (status, body).into_response()
    }
}

/// Result type alias for handler bodies.
pub type Result<T> = std::result::Result<T, ServerError>;
