//! End-to-end backup cycles against a scripted runtime.
//!
//! These tests drive the real scheduler, orchestrator, worker pool,
//! file pipeline, and rotation engine; only the container runtime is
//! scripted.

use async_trait::async_trait;
use bytes::Bytes;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use baktainer_core::config::{
    Config, EncryptionSettings, HealthServerSettings, KeySource, LogLevel, NotificationSettings,
    RotationSettings,
};
use baktainer_core::encryption::EncryptionManager;
use baktainer_core::error::Result;
use baktainer_core::fileops::SpaceProbe;
use baktainer_core::monitor::BackupMonitor;
use baktainer_core::orchestrator::{BackupOrchestrator, RetryPolicy};
use baktainer_core::rotation::RotationEngine;
use baktainer_core::runtime::{
    ContainerRuntime, ContainerSummary, ExecChunk, ExecStream, StreamKind, VersionInfo,
};
use baktainer_core::scheduler::BackupScheduler;
use baktainer_core::strategy::StrategyRegistry;

const PG_DUMP: &str = "-- PostgreSQL database dump\nCREATE TABLE users();\nCOPY users FROM stdin;\n";
const MYSQL_DUMP: &str = "-- MySQL dump 10.13\nCREATE TABLE orders (id INT);\nINSERT INTO orders VALUES (1);\n";
const SQLITE_DUMP: &str = "PRAGMA foreign_keys=OFF;\nBEGIN TRANSACTION;\nCREATE TABLE notes(body TEXT);\n";

struct ScriptedRuntime {
    containers: Vec<ContainerSummary>,
    dumps: HashMap<String, String>,
}

#[async_trait]
impl ContainerRuntime for ScriptedRuntime {
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        Ok(self.containers.clone())
    }

    async fn exec(
        &self,
        container_id: &str,
        _cmd: &[String],
        _env: &[String],
    ) -> Result<ExecStream> {
        let dump = self.dumps.get(container_id).cloned().unwrap_or_default();
        let chunks: Vec<Result<ExecChunk>> = dump
            .into_bytes()
            .chunks(32)
            .map(|piece| {
                Ok(ExecChunk {
                    kind: StreamKind::Stdout,
                    bytes: Bytes::copy_from_slice(piece),
                })
            })
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn version(&self) -> Result<VersionInfo> {
        Ok(VersionInfo {
            version: "24.0.7".into(),
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

fn base_config(backup_dir: &Path) -> Config {
    Config {
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
    }
}

fn summary(id: &str, name: &str, labels: &[(&str, &str)]) -> ContainerSummary {
    ContainerSummary {
        id: id.to_string(),
        names: vec![format!("/{name}")],
        labels: labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        state: "running".to_string(),
    }
}

struct Harness {
    scheduler: BackupScheduler,
    monitor: Arc<BackupMonitor>,
    backup_dir: PathBuf,
}

fn harness(config: Config, runtime: ScriptedRuntime) -> Harness {
    let config = Arc::new(config);
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(runtime);
    let monitor = Arc::new(BackupMonitor::new());
    let encryption = EncryptionManager::from_settings(&config.encryption)
        .expect("test encryption settings are valid")
        .map(Arc::new);
    let encryption_configured = encryption.is_some();

    let orchestrator = Arc::new(
        BackupOrchestrator::new(
            &config,
            Arc::clone(&runtime),
            Arc::new(StrategyRegistry::with_defaults()),
            Arc::clone(&monitor),
            encryption,
            Arc::new(NoProbe),
        )
        .with_retry_policy(RetryPolicy {
            max_attempts: 2,
            delays: vec![Duration::from_millis(1)],
        }),
    );
    let rotation = Arc::new(RotationEngine::new(
        config.backup_dir.clone(),
        config.rotation.clone(),
        Box::new(NoProbe),
    ));

    Harness {
        backup_dir: config.backup_dir.clone(),
        scheduler: BackupScheduler::new(
            Arc::clone(&config),
            runtime,
            orchestrator,
            rotation,
            Arc::clone(&monitor),
            None,
            encryption_configured,
        ),
        monitor,
    }
}

fn date_dir_files(backup_dir: &Path) -> Vec<String> {
    let date = chrono::Utc::now().format("%Y-%m-%d").to_string();
    let dir = backup_dir.join(date);
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

#[tokio::test]
async fn full_cycle_publishes_artifacts_for_every_engine() {
    let tmp = TempDir::new().unwrap();
    let runtime = ScriptedRuntime {
        containers: vec![
            summary(
                "pg1",
                "web",
                &[
                    ("baktainer.backup", "true"),
                    ("baktainer.db.engine", "postgres"),
                    ("baktainer.db.name", "webdb"),
                    ("baktainer.db.user", "postgres"),
                    ("baktainer.db.password", "pw"),
                ],
            ),
            summary(
                "my1",
                "shop",
                &[
                    ("baktainer.backup", "true"),
                    ("baktainer.db.engine", "mysql"),
                    ("baktainer.db.name", "orders"),
                    ("baktainer.db.user", "root"),
                    ("baktainer.db.password", "secret"),
                    ("baktainer.backup.compress", "false"),
                ],
            ),
            summary(
                "sq1",
                "notes",
                &[
                    ("baktainer.backup", "true"),
                    ("baktainer.db.engine", "sqlite"),
                    ("baktainer.db.name", "notes"),
                ],
            ),
        ],
        dumps: HashMap::from([
            ("pg1".to_string(), PG_DUMP.to_string()),
            ("my1".to_string(), MYSQL_DUMP.to_string()),
            ("sq1".to_string(), SQLITE_DUMP.to_string()),
        ]),
    };

    let harness = harness(base_config(tmp.path()), runtime);
    let result = harness.scheduler.run_cycle().await;

    assert!(result.aborted.is_none());
    assert_eq!(result.total, 3);
    assert_eq!(result.succeeded, 3);
    assert_eq!(result.failed, 0);
    assert!(result.rotation.is_some());

    let files = date_dir_files(&harness.backup_dir);
    // One artifact plus one sidecar per container.
    assert_eq!(files.len(), 6, "got {files:?}");

    let artifact_re = Regex::new(r"^(.+)-(\d{10})\.(sql|sql\.gz)$").unwrap();
    let artifacts: Vec<&String> = files.iter().filter(|f| !f.ends_with(".meta")).collect();
    for name in &artifacts {
        assert!(artifact_re.is_match(name), "bad artifact name {name}");
        assert!(files.contains(&format!("{name}.meta")), "missing sidecar for {name}");
    }
    // The compress override puts shop's dump out uncompressed.
    assert!(artifacts.iter().any(|n| n.starts_with("shop-") && n.ends_with(".sql")));
    assert!(artifacts.iter().any(|n| n.starts_with("web-") && n.ends_with(".sql.gz")));
    assert!(artifacts.iter().any(|n| n.starts_with("notes-") && n.ends_with(".sql.gz")));

    // The uncompressed artifact is the dump, byte for byte.
    let date = chrono::Utc::now().format("%Y-%m-%d").to_string();
    let shop = artifacts.iter().find(|n| n.starts_with("shop-")).unwrap();
    let content = std::fs::read_to_string(harness.backup_dir.join(&date).join(shop.as_str())).unwrap();
    assert_eq!(content, MYSQL_DUMP);

    // Sidecars parse and carry the declared keys.
    let web = artifacts.iter().find(|n| n.starts_with("web-")).unwrap();
    let sidecar: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(
            harness
                .backup_dir
                .join(&date)
                .join(format!("{web}.meta")),
        )
        .unwrap(),
    )
    .unwrap();
    assert_eq!(sidecar["container_name"], "web");
    assert_eq!(sidecar["engine"], "postgres");
    assert_eq!(sidecar["database"], "webdb");
    assert_eq!(sidecar["compressed"], true);
    assert_eq!(sidecar["compression_type"], "gzip");
    assert!(sidecar["checksum"].as_str().unwrap().len() == 64);

    let summary = harness.monitor.summary();
    assert_eq!(summary.total, 3);
    assert_eq!(summary.successful, 3);
    assert_eq!(summary.success_rate, 100.0);
    assert!(summary.total_data_bytes > 0);
}

#[tokio::test]
async fn encrypted_cycle_publishes_framed_ciphertext() {
    let tmp = TempDir::new().unwrap();
    let mut config = base_config(tmp.path());
    config.encryption = EncryptionSettings {
        enabled: true,
        key_source: Some(KeySource::Literal("00".repeat(32))),
    };

    let runtime = ScriptedRuntime {
        containers: vec![summary(
            "pg1",
            "web",
            &[
                ("baktainer.backup", "true"),
                ("baktainer.db.engine", "postgres"),
                ("baktainer.db.name", "webdb"),
                ("baktainer.db.user", "postgres"),
                ("baktainer.db.password", "pw"),
            ],
        )],
        dumps: HashMap::from([("pg1".to_string(), PG_DUMP.to_string())]),
    };

    let harness = harness(config, runtime);
    let result = harness.scheduler.run_cycle().await;
    assert_eq!(result.succeeded, 1);

    let files = date_dir_files(&harness.backup_dir);
    let artifact = files
        .iter()
        .find(|f| f.ends_with(".sql.gz.encrypted"))
        .expect("encrypted artifact published");
    assert!(files.contains(&format!("{artifact}.meta")));
    // No plaintext stage left behind.
    assert!(files.iter().all(|f| f.contains(".encrypted")));

    let date = chrono::Utc::now().format("%Y-%m-%d").to_string();
    let data = std::fs::read(harness.backup_dir.join(&date).join(artifact.as_str())).unwrap();
    assert_eq!(&data[..4], b"BAKT");
    assert_eq!(data[4], 1);
    assert_eq!(&data[6..17], b"aes-256-gcm");

    // The configured key decrypts back to the gzipped dump.
    let manager = EncryptionManager::new([0u8; 32]);
    let restored = tmp.path().join("restored.sql.gz");
    manager
        .decrypt_file(
            &harness.backup_dir.join(&date).join(artifact.as_str()),
            &restored,
        )
        .unwrap();
    let mut decoder = flate2::read::GzDecoder::new(std::fs::File::open(&restored).unwrap());
    let mut dump = String::new();
    std::io::Read::read_to_string(&mut decoder, &mut dump).unwrap();
    assert_eq!(dump, PG_DUMP);
}

#[tokio::test]
async fn cycle_isolates_per_container_failures() {
    let tmp = TempDir::new().unwrap();
    let runtime = ScriptedRuntime {
        containers: vec![
            summary(
                "pg1",
                "healthy",
                &[
                    ("baktainer.backup", "true"),
                    ("baktainer.db.engine", "postgres"),
                    ("baktainer.db.name", "gooddb"),
                    ("baktainer.db.user", "postgres"),
                    ("baktainer.db.password", "pw"),
                ],
            ),
            // Missing credentials: fails validation, never execs.
            summary(
                "my1",
                "broken",
                &[
                    ("baktainer.backup", "true"),
                    ("baktainer.db.engine", "mysql"),
                    ("baktainer.db.name", "shop"),
                ],
            ),
            // Empty dump: fails integrity, leaves nothing behind.
            summary(
                "sq1",
                "hollow",
                &[
                    ("baktainer.backup", "true"),
                    ("baktainer.db.engine", "sqlite"),
                    ("baktainer.db.name", "void"),
                ],
            ),
        ],
        dumps: HashMap::from([("pg1".to_string(), PG_DUMP.to_string())]),
    };

    let harness = harness(base_config(tmp.path()), runtime);
    let result = harness.scheduler.run_cycle().await;

    assert!(result.aborted.is_none(), "one bad container never kills a cycle");
    assert_eq!(result.total, 3);
    assert_eq!(result.succeeded, 1);
    assert_eq!(result.failed, 2);

    let files = date_dir_files(&harness.backup_dir);
    assert!(files.iter().all(|f| f.starts_with("healthy-")), "got {files:?}");

    let summary = harness.monitor.summary();
    assert_eq!(summary.successful + summary.failed, summary.total);
    assert_eq!(harness.monitor.failures(10).len(), 2);
}

#[tokio::test]
async fn consecutive_cycles_accumulate_history() {
    let tmp = TempDir::new().unwrap();
    let runtime = ScriptedRuntime {
        containers: vec![summary(
            "pg1",
            "web",
            &[
                ("baktainer.backup", "true"),
                ("baktainer.db.engine", "postgres"),
                ("baktainer.db.name", "webdb"),
                ("baktainer.db.user", "postgres"),
                ("baktainer.db.password", "pw"),
            ],
        )],
        dumps: HashMap::from([("pg1".to_string(), PG_DUMP.to_string())]),
    };

    let harness = harness(base_config(tmp.path()), runtime);
    let first = harness.scheduler.run_cycle().await;
    // Artifact names carry second-resolution timestamps.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let second = harness.scheduler.run_cycle().await;

    assert_eq!(first.succeeded, 1);
    assert_eq!(second.succeeded, 1);
    assert_eq!(harness.monitor.summary().total, 2);

    let artifacts: Vec<String> = date_dir_files(&harness.backup_dir)
        .into_iter()
        .filter(|f| !f.ends_with(".meta"))
        .collect();
    assert_eq!(artifacts.len(), 2, "both cycles published, got {artifacts:?}");
}
