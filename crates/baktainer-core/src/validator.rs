//! Gatekeeper between discovery and the backup pipeline.
//!
//! A descriptor only reaches the orchestrator after passing here. All
//! failures for one container are bundled into a single validation
//! error; warnings are logged but never block.

use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;

use crate::container::{BackupSettings, Container, Engine, Priority};
use crate::error::{Error, Result};
use crate::labels::{self, LabelVerdict};
use crate::strategy::StrategyRegistry;

/// Validates candidate containers against the schema verdict and the
/// strategy registry.
pub struct ContainerValidator {
    registry: Arc<StrategyRegistry>,
}

impl ContainerValidator {
    pub fn new(registry: Arc<StrategyRegistry>) -> Self {
        Self { registry }
    }

    /// Gate a candidate. With a schema verdict its judgement is taken
    /// as-is; without one the minimal legacy checks apply.
    pub fn validate(
        &self,
        container: Option<&Container>,
        verdict: Option<&LabelVerdict>,
    ) -> Result<BackupSettings> {
        let container = container
            .ok_or_else(|| Error::Validation("no container descriptor".into()))?;

        let mut failures = Vec::new();
        if !container.state.is_running() {
            failures.push(format!("container '{}' is not running", container.name));
        }
        if container.labels.is_empty() {
            failures.push(format!("container '{}' has no labels", container.name));
        }

        let settings = match verdict {
            Some(verdict) => {
                for warning in &verdict.warnings {
                    warn!(container = %container.name, "{warning}");
                }
                if !verdict.valid {
                    failures.extend(verdict.errors.iter().cloned());
                    None
                } else {
                    let settings = verdict.normalized.clone();
                    if let Some(s) = &settings {
                        if !self.registry.supports(s.engine.as_str()) {
                            failures
                                .push(format!("engine '{}' has no dump strategy", s.engine));
                        }
                    }
                    settings
                }
            }
            None => self.legacy_validate(container, &mut failures),
        };

        if !failures.is_empty() {
            return Err(Error::Validation(failures.join("; ")));
        }
        settings.ok_or_else(|| {
            Error::Validation(format!(
                "container '{}' produced no backup settings",
                container.name
            ))
        })
    }

    /// Pre-schema checks: backup enabled, engine defined and supported,
    /// credentials present for engines that need them.
    fn legacy_validate(
        &self,
        container: &Container,
        failures: &mut Vec<String>,
    ) -> Option<BackupSettings> {
        if !labels::backup_enabled(&container.labels) {
            failures.push(format!("{} is not true", labels::BACKUP_ENABLED));
        }

        let engine = match container.labels.get(labels::DB_ENGINE) {
            None => {
                failures.push(format!("{} is not set", labels::DB_ENGINE));
                return None;
            }
            Some(raw) => match Engine::from_str(raw) {
                Ok(engine) if self.registry.supports(engine.as_str()) => engine,
                _ => {
                    failures.push(format!("engine '{raw}' is not supported"));
                    return None;
                }
            },
        };

        let user = container.labels.get(labels::DB_USER).cloned();
        let password = container.labels.get(labels::DB_PASSWORD).cloned();
        if engine.requires_credentials() && (user.is_none() || password.is_none()) {
            failures.push(format!(
                "engine '{engine}' requires {} and {}",
                labels::DB_USER,
                labels::DB_PASSWORD
            ));
        }

        Some(BackupSettings {
            engine,
            database: container
                .labels
                .get(labels::DB_NAME)
                .filter(|v| v.as_str() != "*")
                .cloned(),
            user,
            password,
            backup_name: container
                .labels
                .get(labels::BACKUP_NAME)
                .cloned()
                .unwrap_or_else(|| container.name.clone()),
            all_databases: container
                .labels
                .get(labels::DB_ALL)
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on"))
                .unwrap_or(false),
            compress: None,
            encrypt: None,
            retention_days: None,
            retention_count: None,
            priority: Priority::Normal,
        })
    }
}
