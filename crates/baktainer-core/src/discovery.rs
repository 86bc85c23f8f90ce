//! Discovery of backup-eligible containers.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::container::{Container, ContainerState};
use crate::error::Result;
use crate::labels;
use crate::runtime::ContainerRuntime;

/// Enumerates the runtime and wraps opted-in containers.
pub struct ContainerDiscovery {
    runtime: Arc<dyn ContainerRuntime>,
}

impl ContainerDiscovery {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// List candidates: every container whose labels opt into backups.
    ///
    /// A malformed individual container is logged and skipped; only
    /// runtime-level failures abort the scan (and with it the current
    /// cycle; the scheduler loop survives).
    pub async fn discover(&self) -> Result<Vec<Container>> {
        let summaries = self.runtime.list_containers().await?;
        debug!(total = summaries.len(), "runtime enumeration finished");

        let mut candidates = Vec::new();
        for summary in summaries {
            if summary.id.is_empty() {
                warn!("skipping container with empty id");
                continue;
            }
            if summary.labels.is_empty() || !labels::backup_enabled(&summary.labels) {
                continue;
            }

            let fallback = summary.id.chars().take(12).collect::<String>();
            let name = summary
                .names
                .first()
                .map(String::as_str)
                .unwrap_or(fallback.as_str());
            candidates.push(Container::new(
                summary.id.clone(),
                name,
                summary.labels,
                ContainerState::parse(&summary.state),
            ));
        }

        debug!(candidates = candidates.len(), "backup-enabled containers");
        Ok(candidates)
    }
}
