//! # Baktainer Server
//!
//! Read-only HTTP observability surface for the backup engine: health,
//! status, metrics, and a small dashboard. Every endpoint is a
//! projection of monitor and rotation state; nothing here can start,
//! stop, or mutate a backup.

#![warn(clippy::all)]

pub mod error;
pub mod routes;
pub mod state;

pub use error::ServerError;
pub use routes::router;
pub use state::AppState;

use std::net::SocketAddr;
use tracing::info;

/// Bind and serve the observability surface until cancelled.
pub async fn serve(bind: &str, port: u16, state: AppState) -> std::io::Result<()> {
    let addr: SocketAddr = format!("{bind}:{port}")
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "health server listening");
    axum::serve(listener, router(state)).await
}
