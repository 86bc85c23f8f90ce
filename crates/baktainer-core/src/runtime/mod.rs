//! Container runtime contract.
//!
//! The engine consumes the runtime through this trait only: enumerate
//! containers with their labels and state, run a command inside one
//! while streaming its output, and answer a version probe. The bollard
//! client in [`docker`] is the production implementation; tests drive
//! the engine with scripted in-memory runtimes.

pub mod docker;

pub use docker::DockerRuntime;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;

use crate::error::Result;

/// Which side of the process the bytes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// One chunk of exec output.
#[derive(Debug, Clone)]
pub struct ExecChunk {
    pub kind: StreamKind,
    pub bytes: Bytes,
}

/// Raw container data as enumerated from the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    pub labels: HashMap<String, String>,
    pub state: String,
}

/// Runtime identification for the health probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub api_version: String,
}

/// Stream of exec output chunks; ends when the process exits.
pub type ExecStream = Pin<Box<dyn Stream<Item = Result<ExecChunk>> + Send>>;

/// Capability contract for a container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Enumerate all containers, running or not.
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>>;

    /// Run `cmd` with `env` inside a container, streaming stdout and
    /// stderr until the process completes.
    async fn exec(&self, container_id: &str, cmd: &[String], env: &[String])
        -> Result<ExecStream>;

    /// Version probe used for pre-flight health checks.
    async fn version(&self) -> Result<VersionInfo>;
}
