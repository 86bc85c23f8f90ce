//! Shared read-only state behind the HTTP surface.

use baktainer_core::monitor::BackupMonitor;
use baktainer_core::rotation::RotationEngine;
use baktainer_core::runtime::ContainerRuntime;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Everything a handler may read. The HTTP surface is a projection of
/// engine state; nothing here mutates the engine.
#[derive(Clone)]
pub struct AppState {
    pub monitor: Arc<BackupMonitor>,
    pub rotation: Arc<RotationEngine>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        monitor: Arc<BackupMonitor>,
        rotation: Arc<RotationEngine>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            monitor,
            rotation,
            runtime,
            started_at: Utc::now(),
        }
    }

    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}
