//! Cron-driven backup cycles.
//!
//! One scheduler owns the loop: sleep until the next cron fire, then run
//! a single cycle. A cycle health-probes the runtime, discovers
//! candidates, fans them out to the worker pool, joins every future,
//! rotates artifacts, and logs a summary. Cycles are strictly serial;
//! the next one cannot start while a cycle is still joining its workers.

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::Serialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::discovery::ContainerDiscovery;
use crate::labels::LabelSchema;
use crate::monitor::BackupMonitor;
use crate::notify::{BackupEvent, Notifier};
use crate::orchestrator::BackupOrchestrator;
use crate::pool::WorkerPool;
use crate::rotation::{RetentionOverride, RotationEngine, RotationResult};
use crate::runtime::ContainerRuntime;

/// The schedule used when the configured expression does not parse.
pub const DEFAULT_CRON: &str = "0 0 * * *";

/// Outcome of one backup cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleResult {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Present when the cycle never touched containers.
    pub aborted: Option<String>,
    pub rotation: Option<RotationResult>,
}

impl CycleResult {
    fn aborted(started_at: DateTime<Utc>, reason: String) -> Self {
        Self {
            started_at,
            finished_at: Utc::now(),
            total: 0,
            succeeded: 0,
            failed: 0,
            aborted: Some(reason),
            rotation: None,
        }
    }
}

/// Owns the cron loop and drives backup cycles.
pub struct BackupScheduler {
    config: Arc<Config>,
    runtime: Arc<dyn ContainerRuntime>,
    discovery: ContainerDiscovery,
    orchestrator: Arc<BackupOrchestrator>,
    rotation: Arc<RotationEngine>,
    monitor: Arc<BackupMonitor>,
    notifier: Option<Arc<Notifier>>,
    schema: LabelSchema,
    schedule: Schedule,
}

impl BackupScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        runtime: Arc<dyn ContainerRuntime>,
        orchestrator: Arc<BackupOrchestrator>,
        rotation: Arc<RotationEngine>,
        monitor: Arc<BackupMonitor>,
        notifier: Option<Arc<Notifier>>,
        encryption_configured: bool,
    ) -> Self {
        let schedule = parse_cron(&config.cron_schedule);
        Self {
            discovery: ContainerDiscovery::new(Arc::clone(&runtime)),
            schema: LabelSchema::new(encryption_configured),
            config,
            runtime,
            orchestrator,
            rotation,
            monitor,
            notifier,
            schedule,
        }
    }

    /// Next fire time in UTC.
    pub fn next_fire(&self) -> Option<DateTime<Utc>> {
        self.schedule.upcoming(Utc).next()
    }

    /// The scheduler loop: sleep to the next fire, run one cycle, loop.
    /// Runs until the owning task is cancelled.
    pub async fn run(&self) {
        info!(cron = %self.config.cron_schedule, "scheduler started");
        loop {
            let Some(next) = self.next_fire() else {
                error!("cron schedule yields no future fire times, scheduler stopping");
                return;
            };
            let wait = (next - Utc::now())
                .to_std()
                .unwrap_or(Duration::from_secs(0));
            info!(next = %next, wait_secs = wait.as_secs(), "sleeping until next backup cycle");
            tokio::time::sleep(wait).await;

            let result = self.run_cycle().await;
            if let Some(reason) = &result.aborted {
                warn!(reason = %reason, "backup cycle aborted");
            }
        }
    }

    /// Run exactly one cycle: probe, discover, fan out, join, rotate.
    pub async fn run_cycle(&self) -> CycleResult {
        let started_at = Utc::now();

        // Pre-flight: the runtime must answer a version probe and a
        // trivial enumeration before any container is touched.
        if let Err(e) = self.preflight().await {
            error!(error = %e, "runtime health probe failed");
            self.notify(BackupEvent::Health {
                status: "unhealthy".into(),
                message: format!("runtime health probe failed: {e}"),
                available_space_bytes: None,
                directory: Some(self.config.backup_dir.display().to_string()),
                timestamp: Utc::now(),
            })
            .await;
            return CycleResult::aborted(started_at, e.to_string());
        }

        let candidates = match self.discovery.discover().await {
            Ok(candidates) => candidates,
            Err(e) => {
                error!(error = %e, "container discovery failed");
                return CycleResult::aborted(started_at, e.to_string());
            }
        };
        info!(candidates = candidates.len(), "backup cycle starting");

        // Retention overrides ride on the labels of this cycle's
        // candidates, keyed by artifact base name.
        let overrides = self.collect_overrides(&candidates);

        let mut pool = WorkerPool::new(self.config.threads);
        let mut handles = Vec::with_capacity(candidates.len());
        for container in candidates {
            let orchestrator = Arc::clone(&self.orchestrator);
            let name = container.name.clone();
            let handle = pool
                .submit(async move { orchestrator.backup_container(&container).await })
                .await;
            handles.push((name, handle));
        }

        let total = handles.len();
        let mut succeeded = 0;
        let mut failed = 0;
        for (name, handle) in handles {
            match handle.join().await {
                Ok(path) => {
                    succeeded += 1;
                    info!(container = %name, path = %path.display(), "container backed up");
                }
                Err(e) => {
                    failed += 1;
                    error!(container = %name, error = %e, "container backup failed");
                }
            }
        }
        pool.shutdown().await;

        let rotation = if self.rotation.is_enabled() {
            let rotation = Arc::clone(&self.rotation);
            match tokio::task::spawn_blocking(move || rotation.run(&overrides)).await {
                Ok(result) => Some(result),
                Err(e) => {
                    error!(error = %e, "rotation task panicked");
                    None
                }
            }
        } else {
            None
        };

        let finished_at = Utc::now();
        let duration = (finished_at - started_at).num_milliseconds() as f64 / 1000.0;
        let summary = self.monitor.summary();
        info!(
            total,
            succeeded,
            failed,
            duration_secs = duration,
            success_rate = summary.success_rate,
            total_data_bytes = summary.total_data_bytes,
            rotated = rotation.as_ref().map(|r| r.deleted_count).unwrap_or(0),
            "backup cycle finished"
        );

        self.notify(BackupEvent::Summary {
            total,
            successful: succeeded,
            failed,
            duration_seconds: duration,
            timestamp: finished_at,
        })
        .await;

        CycleResult {
            started_at,
            finished_at,
            total,
            succeeded,
            failed,
            aborted: None,
            rotation,
        }
    }

    async fn preflight(&self) -> crate::error::Result<()> {
        let version = self.runtime.version().await?;
        info!(version = %version.version, api = %version.api_version, "runtime healthy");
        self.runtime.list_containers().await?;
        Ok(())
    }

    fn collect_overrides(
        &self,
        candidates: &[crate::container::Container],
    ) -> HashMap<String, RetentionOverride> {
        let mut overrides = HashMap::new();
        for container in candidates {
            let verdict = self.schema.validate(&container.name, &container.labels);
            let Some(settings) = verdict.normalized else {
                continue;
            };
            if settings.retention_days.is_some() || settings.retention_count.is_some() {
                overrides.insert(
                    settings.backup_name.clone(),
                    RetentionOverride {
                        days: settings.retention_days,
                        count: settings.retention_count,
                    },
                );
            }
        }
        overrides
    }

    async fn notify(&self, event: BackupEvent) {
        if let Some(notifier) = &self.notifier {
            notifier.dispatch(&event).await;
        }
    }
}

/// Parse a 5-field cron expression, falling back to [`DEFAULT_CRON`].
///
/// The cron crate wants a seconds field, so a leading `0` is prepended
/// to the configured expression.
fn parse_cron(expr: &str) -> Schedule {
    match Schedule::from_str(&format!("0 {expr}")) {
        Ok(schedule) => schedule,
        Err(e) => {
            warn!(cron = expr, error = %e, "invalid cron expression, using default");
            Schedule::from_str(&format!("0 {DEFAULT_CRON}"))
                .expect("default cron expression parses")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        EncryptionSettings, HealthServerSettings, LogLevel, NotificationSettings,
        RotationSettings,
    };
    use crate::error::{Error, Result};
    use crate::fileops::SpaceProbe;
    use crate::orchestrator::RetryPolicy;
    use crate::runtime::{ContainerSummary, ExecChunk, ExecStream, StreamKind, VersionInfo};
    use crate::strategy::StrategyRegistry;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::path::Path;
    use tempfile::TempDir;

    struct ScriptedRuntime {
        containers: Vec<ContainerSummary>,
        healthy: bool,
    }

    #[async_trait]
    impl ContainerRuntime for ScriptedRuntime {
        async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
            if !self.healthy {
                return Err(Error::Runtime("daemon unreachable".into()));
            }
            Ok(self.containers.clone())
        }

        async fn exec(
            &self,
            _container_id: &str,
            _cmd: &[String],
            _env: &[String],
        ) -> Result<ExecStream> {
            let chunk = ExecChunk {
                kind: StreamKind::Stdout,
                bytes: Bytes::from_static(b"-- PostgreSQL database dump\nCREATE TABLE t();\n"),
            };
            Ok(Box::pin(futures::stream::iter(vec![Ok(chunk)])))
        }

        async fn version(&self) -> Result<VersionInfo> {
            if !self.healthy {
                return Err(Error::RuntimeTimeout("version probe timed out".into()));
            }
            Ok(VersionInfo {
                version: "24.0".into(),
                api_version: "1.43".into(),
            })
        }
    }

    struct NoProbe;

    impl SpaceProbe for NoProbe {
        fn free_space(&self, _path: &Path) -> Option<u64> {
            None
        }
    }

    fn config(backup_dir: &Path) -> Arc<Config> {
        Arc::new(Config {
            runtime_url: "unix:///var/run/docker.sock".into(),
            cron_schedule: "0 0 * * *".into(),
            threads: 2,
            log_level: LogLevel::Info,
            backup_dir: backup_dir.to_path_buf(),
            compress: true,
            tls: None,
            rotation: RotationSettings {
                enabled: true,
                retention_days: 30,
                retention_count: 0,
                min_free_space_gb: 0,
            },
            encryption: EncryptionSettings {
                enabled: false,
                key_source: None,
            },
            notifications: NotificationSettings {
                channels: vec!["log".into()],
                notify_success: false,
                notify_failures: true,
                notify_warnings: true,
                notify_health: true,
                notify_summary: false,
                webhook_url: None,
                slack_webhook_url: None,
                discord_webhook_url: None,
                teams_webhook_url: None,
            },
            health_server: HealthServerSettings {
                enabled: false,
                bind: "127.0.0.1".into(),
                port: 8080,
            },
        })
    }

    fn postgres_summary(id: &str, name: &str) -> ContainerSummary {
        ContainerSummary {
            id: id.into(),
            names: vec![format!("/{name}")],
            labels: [
                ("baktainer.backup", "true"),
                ("baktainer.db.engine", "postgres"),
                ("baktainer.db.name", "appdb"),
                ("baktainer.db.user", "postgres"),
                ("baktainer.db.password", "pw"),
            ]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
            state: "running".into(),
        }
    }

    fn scheduler(config: Arc<Config>, runtime: Arc<ScriptedRuntime>) -> BackupScheduler {
        let monitor = Arc::new(BackupMonitor::new());
        let orchestrator = Arc::new(
            BackupOrchestrator::new(
                &config,
                Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
                Arc::new(StrategyRegistry::with_defaults()),
                Arc::clone(&monitor),
                None,
                Arc::new(NoProbe),
            )
            .with_retry_policy(RetryPolicy {
                max_attempts: 1,
                delays: vec![Duration::from_millis(1)],
            }),
        );
        let rotation = Arc::new(RotationEngine::new(
            config.backup_dir.clone(),
            config.rotation.clone(),
            Box::new(NoProbe),
        ));
        BackupScheduler::new(
            config,
            runtime,
            orchestrator,
            rotation,
            monitor,
            None,
            false,
        )
    }

    #[test]
    fn test_cron_parse_and_fallback() {
        let schedule = parse_cron("*/15 * * * *");
        assert!(schedule.upcoming(Utc).next().is_some());

        // Invalid expressions fall back to daily midnight.
        let fallback = parse_cron("not a cron");
        let next = fallback.upcoming(Utc).next().unwrap();
        assert_eq!(next.format("%H:%M:%S").to_string(), "00:00:00");
    }

    #[tokio::test]
    async fn test_cycle_mixed_outcomes() {
        let tmp = TempDir::new().unwrap();
        let mut broken = postgres_summary("b1", "broken");
        broken.labels.remove("baktainer.db.name");

        let runtime = Arc::new(ScriptedRuntime {
            containers: vec![postgres_summary("a1", "appdb"), broken],
            healthy: true,
        });
        let scheduler = scheduler(config(tmp.path()), runtime);

        let result = scheduler.run_cycle().await;
        assert!(result.aborted.is_none());
        assert_eq!(result.total, 2);
        assert_eq!(result.succeeded, 1);
        assert_eq!(result.failed, 1);
        assert!(result.rotation.is_some(), "rotation runs after the cycle");
        assert_eq!(scheduler.monitor.summary().total, 2);
    }

    #[tokio::test]
    async fn test_unhealthy_runtime_aborts_cycle() {
        let tmp = TempDir::new().unwrap();
        let runtime = Arc::new(ScriptedRuntime {
            containers: vec![postgres_summary("a1", "appdb")],
            healthy: false,
        });
        let scheduler = scheduler(config(tmp.path()), runtime);

        let result = scheduler.run_cycle().await;
        assert!(result.aborted.is_some());
        assert_eq!(result.total, 0);
        assert!(result.rotation.is_none());
        assert_eq!(scheduler.monitor.summary().total, 0, "no containers touched");
    }

    #[tokio::test]
    async fn test_cycle_with_no_candidates() {
        let tmp = TempDir::new().unwrap();
        let runtime = Arc::new(ScriptedRuntime {
            containers: vec![],
            healthy: true,
        });
        let scheduler = scheduler(config(tmp.path()), runtime);

        let result = scheduler.run_cycle().await;
        assert!(result.aborted.is_none());
        assert_eq!(result.total, 0);
    }

    #[tokio::test]
    async fn test_retention_overrides_collected() {
        let tmp = TempDir::new().unwrap();
        let mut summary = postgres_summary("a1", "appdb");
        summary
            .labels
            .insert("baktainer.backup.retention.days".into(), "90".into());
        summary
            .labels
            .insert("baktainer.name".into(), "custom".into());

        let runtime = Arc::new(ScriptedRuntime {
            containers: vec![summary],
            healthy: true,
        });
        let scheduler = scheduler(config(tmp.path()), runtime);
        let candidates = scheduler.discovery.discover().await.unwrap();

        let overrides = scheduler.collect_overrides(&candidates);
        assert_eq!(overrides.len(), 1);
        assert_eq!(overrides["custom"].days, Some(90));
        assert_eq!(overrides["custom"].count, None);
    }

    #[test]
    fn test_next_fire_is_in_the_future() {
        let schedule = parse_cron(DEFAULT_CRON);
        assert!(schedule.upcoming(Utc).next().unwrap() > Utc::now());
    }
}
