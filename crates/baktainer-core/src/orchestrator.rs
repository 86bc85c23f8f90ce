//! The per-container backup pipeline.
//!
//! prepare → exec → stage → finalize → verify → record. Output from the
//! dump command streams straight into a hidden temp file; the artifact
//! only becomes visible through the atomic rename (or gzip staging) at
//! the end, so observers never see a partial backup. Transport and disk
//! errors are retried with backoff; validation, security, encryption,
//! and integrity errors are not.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::container::Container;
use crate::encryption::{EncryptionManager, EncryptionMetadata};
use crate::error::{Error, Result};
use crate::fileops::{self, SpaceProbe};
use crate::labels::LabelSchema;
use crate::monitor::BackupMonitor;
use crate::runtime::{ContainerRuntime, StreamKind};
use crate::strategy::{DumpOptions, StrategyRegistry};
use crate::validator::ContainerValidator;

/// Stderr kept in memory before being flushed to the log.
const STDERR_BUFFER_LIMIT: usize = 64 * 1024;
/// Bytes of the dump head inspected by the content sniff.
const SNIFF_HEAD_BYTES: usize = 4096;
const SNIFF_HEAD_LINES: usize = 5;

/// Retry schedule for transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
            ],
        }
    }
}

impl RetryPolicy {
    fn delay(&self, completed_attempts: u32) -> Duration {
        self.delays
            .get((completed_attempts as usize).saturating_sub(1))
            .copied()
            .unwrap_or_else(|| *self.delays.last().unwrap_or(&Duration::from_secs(1)))
    }
}

/// Run `op` under the retry policy. Only retryable errors re-enter the
/// loop; everything else falls straight through.
pub async fn retry_with_backoff<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay(attempt);
                warn!(
                    target = label,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "retryable failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Sidecar written beside every published artifact.
#[derive(Debug, Clone, Serialize)]
pub struct BackupMetadata {
    pub timestamp: DateTime<Utc>,
    pub container_name: String,
    pub engine: String,
    pub database: Option<String>,
    pub file_size: u64,
    pub checksum: String,
    pub backup_file: String,
    pub compressed: bool,
    pub compression_type: Option<String>,
    #[serde(flatten)]
    pub encryption: Option<EncryptionMetadata>,
}

/// Drives one container through the full backup pipeline.
pub struct BackupOrchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<StrategyRegistry>,
    schema: LabelSchema,
    validator: ContainerValidator,
    monitor: Arc<BackupMonitor>,
    encryption: Option<Arc<EncryptionManager>>,
    probe: Arc<dyn SpaceProbe>,
    backup_dir: PathBuf,
    compress_default: bool,
    encrypt_default: bool,
    retry: RetryPolicy,
}

impl BackupOrchestrator {
    pub fn new(
        config: &Config,
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<StrategyRegistry>,
        monitor: Arc<BackupMonitor>,
        encryption: Option<Arc<EncryptionManager>>,
        probe: Arc<dyn SpaceProbe>,
    ) -> Self {
        Self {
            schema: LabelSchema::new(encryption.is_some()),
            validator: ContainerValidator::new(Arc::clone(&registry)),
            runtime,
            registry,
            monitor,
            encrypt_default: config.encryption.enabled && encryption.is_some(),
            encryption,
            probe,
            backup_dir: config.backup_dir.clone(),
            compress_default: config.compress,
            retry: RetryPolicy::default(),
        }
    }

    /// Override the retry schedule (used to tighten tests).
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Back up one container end to end, recording the outcome.
    pub async fn backup_container(&self, container: &Container) -> Result<PathBuf> {
        let verdict = self.schema.validate(&container.name, &container.labels);
        let settings = match self.validator.validate(Some(container), Some(&verdict)) {
            Ok(settings) => settings,
            Err(e) => {
                self.monitor.fail(&container.name, &e.to_string());
                return Err(e);
            }
        };

        self.monitor
            .start(&container.name, settings.engine.as_str());

        let result = retry_with_backoff(&self.retry, &container.name, || {
            self.attempt(container, &settings)
        })
        .await;

        match result {
            Ok(published) => {
                let size = std::fs::metadata(&published).map(|m| m.len()).ok();
                info!(
                    container = %container.name,
                    path = %published.display(),
                    size = size.unwrap_or(0),
                    "backup complete"
                );
                self.monitor.complete(&container.name, &published, size);
                Ok(published)
            }
            Err(e) => {
                self.monitor.fail(&container.name, &e.to_string());
                Err(e)
            }
        }
    }

    /// One pipeline attempt. Every failure path cleans up its own
    /// on-disk leavings before returning.
    async fn attempt(
        &self,
        container: &Container,
        settings: &crate::container::BackupSettings,
    ) -> Result<PathBuf> {
        let date_dir = self.backup_dir.join(Utc::now().format("%Y-%m-%d").to_string());
        fileops::create_backup_dir(&date_dir, self.probe.as_ref())?;

        let base = format!("{}-{}", settings.backup_name, Utc::now().timestamp());
        let compress = settings.compress.unwrap_or(self.compress_default);
        let temp = date_dir.join(format!(".{base}.sql.tmp"));
        let final_path = if compress {
            date_dir.join(format!("{base}.sql.gz"))
        } else {
            date_dir.join(format!("{base}.sql"))
        };

        let outcome = self
            .run_pipeline(container, settings, &temp, &final_path, compress)
            .await;
        if outcome.is_err() {
            self.cleanup_attempt(&date_dir, &base, &temp);
        }
        outcome
    }

    async fn run_pipeline(
        &self,
        container: &Container,
        settings: &crate::container::BackupSettings,
        temp: &Path,
        final_path: &Path,
        compress: bool,
    ) -> Result<PathBuf> {
        let opts = DumpOptions::from_settings(settings);
        let command = self.registry.command_for(settings.engine, &opts)?;

        self.stream_dump(container, &command.cmd, &command.env, temp)
            .await?;
        fileops::verify_created(temp)?;
        self.sniff_dump(temp, settings)?;

        if compress {
            fileops::compress(temp, final_path)?;
        } else {
            fileops::rename(temp, final_path)?;
        }

        let (published, encryption_metadata) = self.maybe_encrypt(settings, final_path)?;
        let integrity = fileops::verify_integrity(&published)?;

        let metadata = BackupMetadata {
            timestamp: Utc::now(),
            container_name: container.name.clone(),
            engine: settings.engine.as_str().to_string(),
            database: settings.database.clone(),
            file_size: integrity.size,
            checksum: integrity.checksum,
            backup_file: published
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            compressed: compress,
            compression_type: compress.then(|| "gzip".to_string()),
            encryption: encryption_metadata,
        };
        fileops::write_metadata(&published, &metadata);

        Ok(published)
    }

    /// Exec the dump command and route its stdout into the temp file.
    /// Stderr accumulates in a bounded buffer that flushes to the log.
    async fn stream_dump(
        &self,
        container: &Container,
        cmd: &[String],
        env: &[String],
        temp: &Path,
    ) -> Result<()> {
        let mut stream = self.runtime.exec(&container.id, cmd, env).await?;

        let file = tokio::fs::File::create(temp).await?;
        let mut writer = tokio::io::BufWriter::new(file);
        let mut stderr = Vec::new();

        let result = async {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                match chunk.kind {
                    StreamKind::Stdout => writer.write_all(&chunk.bytes).await?,
                    StreamKind::Stderr => {
                        stderr.extend_from_slice(&chunk.bytes);
                        if stderr.len() > STDERR_BUFFER_LIMIT {
                            warn!(
                                container = %container.name,
                                stderr = %String::from_utf8_lossy(&stderr),
                                "dump stderr"
                            );
                            stderr.clear();
                        }
                    }
                }
            }
            writer.flush().await?;
            writer.into_inner().sync_all().await?;
            Ok(())
        }
        .await;

        if !stderr.is_empty() {
            debug!(
                container = %container.name,
                stderr = %String::from_utf8_lossy(&stderr),
                "dump stderr"
            );
        }
        result
    }

    /// Warning-only content check over the dump head. Only real I/O
    /// failures propagate.
    fn sniff_dump(&self, temp: &Path, settings: &crate::container::BackupSettings) -> Result<()> {
        use std::io::Read;
        let mut head = vec![0u8; SNIFF_HEAD_BYTES];
        let mut file = std::fs::File::open(temp)?;
        let n = file.read(&mut head)?;
        head.truncate(n);

        let lines: Vec<String> = String::from_utf8_lossy(&head)
            .lines()
            .take(SNIFF_HEAD_LINES)
            .map(|l| l.to_ascii_lowercase())
            .collect();

        match self.registry.get(settings.engine.as_str()) {
            Ok(strategy) if !strategy.sniff(&lines) => {
                warn!(
                    engine = settings.engine.as_str(),
                    "dump head does not look like the expected engine output"
                );
            }
            _ => {}
        }
        Ok(())
    }

    fn maybe_encrypt(
        &self,
        settings: &crate::container::BackupSettings,
        final_path: &Path,
    ) -> Result<(PathBuf, Option<EncryptionMetadata>)> {
        let encrypt = settings.encrypt.unwrap_or(self.encrypt_default);
        if !encrypt {
            return Ok((final_path.to_path_buf(), None));
        }
        let manager = self.encryption.as_ref().ok_or_else(|| {
            Error::Encryption("encryption requested but no key is configured".into())
        })?;
        let (encrypted, metadata) = manager.encrypt_file(final_path)?;
        Ok((encrypted, Some(metadata)))
    }

    /// Single cleanup pass after a failed attempt: temp, both staged
    /// names, their sidecars, and the encrypted variants.
    fn cleanup_attempt(&self, date_dir: &Path, base: &str, temp: &Path) {
        let mut doomed = vec![temp.to_path_buf()];
        for staged in [
            date_dir.join(format!("{base}.sql")),
            date_dir.join(format!("{base}.sql.gz")),
        ] {
            let encrypted = PathBuf::from(format!("{}.encrypted", staged.display()));
            doomed.push(fileops::meta_path(&staged));
            doomed.push(fileops::meta_path(&encrypted));
            doomed.push(encrypted);
            doomed.push(staged);
        }
        fileops::cleanup(&doomed);
    }
}
