//! # Baktainer Core
//!
//! Label-driven database backup engine for containerized workloads.
//!
//! ## Features
//!
//! - **Label Discovery**: containers opt in with `baktainer.*` labels,
//!   validated against a declarative schema
//! - **Engine Strategies**: mysql, mariadb, postgres, sqlite, and
//!   mongodb dump commands with input sanitization
//! - **Atomic Pipeline**: exec → temp file → gzip → encrypt → verify →
//!   atomic publish with sidecar metadata
//! - **Encrypted Storage**: AES-256-GCM with a framed on-disk container
//! - **Retention Policies**: age, per-container count, and free-space
//!   rotation passes
//! - **Monitoring & Alerts**: bounded ring of outcomes, derived
//!   metrics, slow/small/repeated-failure alerts
//! - **Notifications**: log, webhook, Slack, Discord, and Teams fan-out
//!
//! ## Architecture
//!
//! - `config`: environment-driven immutable settings
//! - `labels`: the `baktainer.*` label schema
//! - `strategy`: per-engine dump command generation
//! - `runtime`: container runtime contract and bollard client
//! - `fileops`: atomic filesystem primitives
//! - `encryption`: artifact encryption at rest
//! - `monitor`: outcome tracking and alerting
//! - `notify`: notification fan-out
//! - `rotation`: artifact retention
//! - `pool`: bounded worker pool
//! - `validator`: candidate gating
//! - `orchestrator`: the per-container pipeline
//! - `discovery`: runtime enumeration
//! - `scheduler`: the cron loop
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use baktainer_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> std::result::Result<(), Box<dyn std::error::Error>> {
//! let config = Arc::new(Config::from_env()?);
//! let runtime: Arc<dyn ContainerRuntime> =
//!     Arc::new(DockerRuntime::connect(&config.runtime_url, None)?);
//!
//! let monitor = Arc::new(BackupMonitor::new());
//! let registry = Arc::new(StrategyRegistry::with_defaults());
//! let probe = Arc::new(baktainer_core::fileops::default_probe());
//! let orchestrator = Arc::new(BackupOrchestrator::new(
//!     &config,
//!     Arc::clone(&runtime),
//!     registry,
//!     Arc::clone(&monitor),
//!     None,
//!     probe,
//! ));
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod container;
pub mod discovery;
pub mod encryption;
pub mod error;
pub mod fileops;
pub mod labels;
pub mod monitor;
pub mod notify;
pub mod orchestrator;
pub mod pool;
pub mod rotation;
pub mod runtime;
pub mod scheduler;
pub mod strategy;
pub mod tls;
pub mod validator;

// Re-export main types for convenience
pub use config::{Config, KeySource, LogLevel};
pub use container::{BackupSettings, Container, ContainerState, Engine, Priority};
pub use discovery::ContainerDiscovery;
pub use encryption::{EncryptionManager, EncryptionMetadata};
pub use error::{Error, Result};
pub use labels::{LabelSchema, LabelVerdict};
pub use monitor::{Alert, BackupMonitor, BackupRecord, BackupStatus, MonitorSummary};
pub use notify::{BackupEvent, Notifier};
pub use orchestrator::{BackupMetadata, BackupOrchestrator, RetryPolicy};
pub use pool::{TaskHandle, WorkerPool};
pub use rotation::{RotationEngine, RotationResult, RotationStatistics};
pub use runtime::{ContainerRuntime, DockerRuntime};
pub use scheduler::{BackupScheduler, CycleResult};
pub use strategy::{BackupCommand, DumpStrategy, StrategyRegistry};
pub use tls::TlsMaterial;
pub use validator::ContainerValidator;

/// Version information for the backup engine.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for common imports.
pub mod prelude {
    //! Commonly used types and traits.

    pub use crate::config::Config;
    pub use crate::container::{Container, Engine};
    pub use crate::error::{Error, Result};
    pub use crate::monitor::BackupMonitor;
    pub use crate::orchestrator::BackupOrchestrator;
    pub use crate::rotation::RotationEngine;
    pub use crate::runtime::{ContainerRuntime, DockerRuntime};
    pub use crate::scheduler::BackupScheduler;
    pub use crate::strategy::StrategyRegistry;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_default_registry_covers_engines() {
        let registry = StrategyRegistry::with_defaults();
        for engine in ["mysql", "mariadb", "postgres", "sqlite", "mongodb"] {
            assert!(registry.supports(engine), "missing strategy for {engine}");
        }
    }
}
