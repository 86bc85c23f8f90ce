//! Container descriptors and normalized backup settings.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Lifecycle state of a container as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Running,
    Stopped,
    Other(String),
}

impl ContainerState {
    /// Parse the runtime's free-form status string.
    pub fn parse(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "running" => ContainerState::Running,
            "exited" | "stopped" | "created" | "dead" => ContainerState::Stopped,
            other => ContainerState::Other(other.to_string()),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ContainerState::Running)
    }
}

/// Database engine a dump strategy exists for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    MySql,
    MariaDb,
    Postgres,
    Sqlite,
    MongoDb,
}

impl Engine {
    /// Canonical engine name, used as the strategy registry key.
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::MySql => "mysql",
            Engine::MariaDb => "mariadb",
            Engine::Postgres => "postgres",
            Engine::Sqlite => "sqlite",
            Engine::MongoDb => "mongodb",
        }
    }

    /// Whether the engine needs user and password credentials.
    pub fn requires_credentials(&self) -> bool {
        !matches!(self, Engine::Sqlite)
    }

    /// Whether the engine has an "all databases" dump variant.
    pub fn supports_all_databases(&self) -> bool {
        matches!(self, Engine::Postgres)
    }
}

impl FromStr for Engine {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mysql" => Ok(Engine::MySql),
            "mariadb" => Ok(Engine::MariaDb),
            "postgres" | "postgresql" => Ok(Engine::Postgres),
            "sqlite" => Ok(Engine::Sqlite),
            "mongodb" => Ok(Engine::MongoDb),
            other => Err(Error::UnsupportedEngine(other.to_string())),
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Informational backup priority. Recognized and surfaced in status
/// output; it does not influence worker scheduling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(Error::Validation(format!("unknown priority '{other}'"))),
        }
    }
}

/// Immutable per-cycle record of a container's identity and raw labels.
///
/// A descriptor carries what discovery observed; the normalized backup
/// settings are produced separately by label validation and only handed
/// to the orchestrator once the container passes the validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    /// Opaque runtime identifier.
    pub id: String,
    /// Canonical display name, leading separator stripped.
    pub name: String,
    /// Raw label mapping as read from the runtime.
    pub labels: HashMap<String, String>,
    /// Container state at discovery time.
    pub state: ContainerState,
}

impl Container {
    /// Build a descriptor from raw runtime data.
    pub fn new(
        id: impl Into<String>,
        name: &str,
        labels: HashMap<String, String>,
        state: ContainerState,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.strip_prefix('/').unwrap_or(name).to_string(),
            labels,
            state,
        }
    }

    /// Short identifier for log lines.
    pub fn short_id(&self) -> &str {
        let end = self.id.len().min(12);
        &self.id[..end]
    }
}

/// Normalized view of a container's backup labels.
///
/// Produced by [`crate::labels::LabelSchema::validate`]; every field has
/// passed coercion and range checks by the time this struct exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSettings {
    pub engine: Engine,
    /// Database name, or dump file path for sqlite. `None` only when
    /// dumping all databases.
    pub database: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Artifact base name; defaults to the container name.
    pub backup_name: String,
    pub all_databases: bool,
    /// Per-container override of the global compression switch.
    pub compress: Option<bool>,
    /// Per-container override of the global encryption switch.
    pub encrypt: Option<bool>,
    pub retention_days: Option<u32>,
    pub retention_count: Option<u32>,
    pub priority: Priority,
}
