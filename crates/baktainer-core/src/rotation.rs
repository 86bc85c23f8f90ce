//! Artifact retention: age, count, and free-space policies.
//!
//! Rotation runs once after every backup cycle. It scans the artifact
//! tree without coordinating with running backups: artifacts only become
//! visible through the atomic rename at the end of a pipeline, and
//! rotation ignores `.tmp` and `.meta` files, so an in-progress backup
//! can never be raced into deletion.

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::SystemTime;
use tracing::{debug, info, warn};

use crate::config::RotationSettings;
use crate::fileops::{self, SpaceProbe};

/// Filename shape of a rotatable artifact, after any `.encrypted`
/// suffix is stripped: `<container>-<10-digit unix ts>.sql[.gz]`.
fn artifact_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(.+)-(\d{10})\.(sql|sql\.gz)$").expect("artifact pattern is valid")
    })
}

/// Per-container retention override carried on backup labels.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetentionOverride {
    pub days: Option<u32>,
    pub count: Option<u32>,
}

/// Outcome of one rotation run. Rotation never raises; failures are
/// accumulated here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RotationResult {
    pub deleted_count: usize,
    pub deleted_size: u64,
    pub errors: Vec<String>,
}

/// Aggregates for one container's surviving artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerArtifacts {
    pub container: String,
    pub count: usize,
    pub total_size: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// Aggregates for one date directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DateArtifacts {
    pub date: String,
    pub count: usize,
    pub total_size: u64,
}

/// Snapshot of the artifact tree for dashboards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RotationStatistics {
    pub total_count: usize,
    pub total_size: u64,
    pub per_container: Vec<ContainerArtifacts>,
    pub per_date: Vec<DateArtifacts>,
}

#[derive(Debug, Clone)]
struct ArtifactEntry {
    path: PathBuf,
    container: String,
    mtime: SystemTime,
    size: u64,
    date_dir: PathBuf,
}

/// Applies the retention policies to the artifact tree.
pub struct RotationEngine {
    backup_dir: PathBuf,
    settings: RotationSettings,
    probe: Box<dyn SpaceProbe>,
}

impl RotationEngine {
    pub fn new(backup_dir: PathBuf, settings: RotationSettings, probe: Box<dyn SpaceProbe>) -> Self {
        Self {
            backup_dir,
            settings,
            probe,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Run every pass in order: age, count, free-space, empty-dir sweep.
    ///
    /// `overrides` carries per-container retention settings from backup
    /// labels; containers without an entry use the global policy.
    pub fn run(&self, overrides: &HashMap<String, RetentionOverride>) -> RotationResult {
        let mut result = RotationResult::default();
        let mut artifacts = self.scan();

        self.age_pass(&mut artifacts, overrides, &mut result);
        self.count_pass(&mut artifacts, overrides, &mut result);
        self.space_pass(&mut artifacts, &mut result);
        self.sweep_empty_dirs(&artifacts);

        info!(
            deleted = result.deleted_count,
            freed_bytes = result.deleted_size,
            errors = result.errors.len(),
            "rotation finished"
        );
        result
    }

    /// Enumerate rotatable artifacts under `<backup_dir>/<YYYY-MM-DD>/`.
    fn scan(&self) -> Vec<ArtifactEntry> {
        let mut artifacts = Vec::new();
        let Ok(dates) = fs::read_dir(&self.backup_dir) else {
            return artifacts;
        };

        for date_entry in dates.flatten() {
            let date_dir = date_entry.path();
            if !date_dir.is_dir() || !is_date_dir(&date_dir) {
                continue;
            }
            let Ok(files) = fs::read_dir(&date_dir) else {
                continue;
            };
            for file in files.flatten() {
                let path = file.path();
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if name.ends_with(".meta") || name.ends_with(".tmp") || name.starts_with('.') {
                    continue;
                }
                let stem = name.strip_suffix(".encrypted").unwrap_or(name);
                let Some(captures) = artifact_pattern().captures(stem) else {
                    continue;
                };
                let Ok(metadata) = file.metadata() else {
                    continue;
                };
                artifacts.push(ArtifactEntry {
                    container: captures[1].to_string(),
                    path,
                    mtime: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                    size: metadata.len(),
                    date_dir: date_dir.clone(),
                });
            }
        }
        artifacts
    }

    /// Delete artifacts older than the effective retention age.
    fn age_pass(
        &self,
        artifacts: &mut Vec<ArtifactEntry>,
        overrides: &HashMap<String, RetentionOverride>,
        result: &mut RotationResult,
    ) {
        let now = SystemTime::now();
        let mut keep = Vec::with_capacity(artifacts.len());
        for entry in artifacts.drain(..) {
            let days = overrides
                .get(&entry.container)
                .and_then(|o| o.days)
                .unwrap_or(self.settings.retention_days);
            if days == 0 {
                keep.push(entry);
                continue;
            }
            let max_age = std::time::Duration::from_secs(u64::from(days) * 86_400);
            let expired = now
                .duration_since(entry.mtime)
                .map(|age| age > max_age)
                .unwrap_or(false);
            if expired {
                self.delete(&entry, result);
            } else {
                keep.push(entry);
            }
        }
        *artifacts = keep;
    }

    /// Keep only the newest N artifacts per container.
    fn count_pass(
        &self,
        artifacts: &mut Vec<ArtifactEntry>,
        overrides: &HashMap<String, RetentionOverride>,
        result: &mut RotationResult,
    ) {
        let mut by_container: HashMap<&str, Vec<usize>> = HashMap::new();
        for (index, entry) in artifacts.iter().enumerate() {
            by_container
                .entry(entry.container.as_str())
                .or_default()
                .push(index);
        }

        let mut doomed = Vec::new();
        for (container, mut indices) in by_container {
            let count = overrides
                .get(container)
                .and_then(|o| o.count)
                .unwrap_or(self.settings.retention_count);
            if count == 0 {
                continue;
            }
            indices.sort_by_key(|&i| std::cmp::Reverse(artifacts[i].mtime));
            doomed.extend(indices.into_iter().skip(count as usize));
        }

        doomed.sort_unstable();
        for index in doomed.into_iter().rev() {
            let entry = artifacts.remove(index);
            self.delete(&entry, result);
        }
    }

    /// Delete oldest-first until the filesystem has enough free space.
    fn space_pass(&self, artifacts: &mut Vec<ArtifactEntry>, result: &mut RotationResult) {
        if self.settings.min_free_space_gb == 0 {
            return;
        }
        let required = self.settings.min_free_space_gb * 1024 * 1024 * 1024;
        let mut free = match self.probe.free_space(&self.backup_dir) {
            Some(free) => free,
            None => {
                warn!("free-space probe unavailable, skipping free-space pass");
                return;
            }
        };
        if free >= required {
            return;
        }

        artifacts.sort_by_key(|e| e.mtime);
        while free < required && !artifacts.is_empty() {
            let entry = artifacts.remove(0);
            let size = entry.size;
            self.delete(&entry, result);
            free = free.saturating_add(size);
        }
    }

    /// Remove date directories that hold no artifacts any more.
    fn sweep_empty_dirs(&self, survivors: &[ArtifactEntry]) {
        let Ok(dates) = fs::read_dir(&self.backup_dir) else {
            return;
        };
        for date_entry in dates.flatten() {
            let dir = date_entry.path();
            if !dir.is_dir() || !is_date_dir(&dir) {
                continue;
            }
            if survivors.iter().any(|e| e.date_dir == dir) {
                continue;
            }
            match fs::remove_dir(&dir) {
                Ok(()) => debug!(dir = %dir.display(), "removed empty date directory"),
                // Leftover .tmp or .meta files keep the directory alive;
                // a later run will catch it.
                Err(e) => debug!(dir = %dir.display(), error = %e, "date directory not removed"),
            }
        }
    }

    /// Unlink an artifact and its sidecar, tallying into the result.
    fn delete(&self, entry: &ArtifactEntry, result: &mut RotationResult) {
        match fs::remove_file(&entry.path) {
            Ok(()) => {
                debug!(path = %entry.path.display(), "rotated out artifact");
                result.deleted_count += 1;
                result.deleted_size += entry.size;
            }
            Err(e) => {
                result
                    .errors
                    .push(format!("cannot delete '{}': {e}", entry.path.display()));
                return;
            }
        }
        let meta = fileops::meta_path(&entry.path);
        if meta.exists() {
            if let Err(e) = fs::remove_file(&meta) {
                warn!(path = %meta.display(), error = %e, "cannot delete sidecar");
            }
        }
    }

    /// Per-container and per-date aggregates for dashboards.
    pub fn statistics(&self) -> RotationStatistics {
        let artifacts = self.scan();
        let mut stats = RotationStatistics {
            total_count: artifacts.len(),
            total_size: artifacts.iter().map(|e| e.size).sum(),
            ..Default::default()
        };

        let mut containers: HashMap<String, ContainerArtifacts> = HashMap::new();
        let mut dates: HashMap<String, DateArtifacts> = HashMap::new();
        for entry in &artifacts {
            let mtime: DateTime<Utc> = entry.mtime.into();
            let per = containers
                .entry(entry.container.clone())
                .or_insert_with(|| ContainerArtifacts {
                    container: entry.container.clone(),
                    count: 0,
                    total_size: 0,
                    oldest: None,
                    newest: None,
                });
            per.count += 1;
            per.total_size += entry.size;
            per.oldest = Some(per.oldest.map_or(mtime, |t| t.min(mtime)));
            per.newest = Some(per.newest.map_or(mtime, |t| t.max(mtime)));

            let date_name = entry
                .date_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let per_date = dates.entry(date_name.clone()).or_insert_with(|| DateArtifacts {
                date: date_name,
                count: 0,
                total_size: 0,
            });
            per_date.count += 1;
            per_date.total_size += entry.size;
        }

        stats.per_container = containers.into_values().collect();
        stats.per_container.sort_by(|a, b| a.container.cmp(&b.container));
        stats.per_date = dates.into_values().collect();
        stats.per_date.sort_by(|a, b| a.date.cmp(&b.date));
        stats
    }
}

fn is_date_dir(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| NaiveDate::parse_from_str(n, "%Y-%m-%d").is_ok())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    struct FixedProbe(Option<u64>);

    impl SpaceProbe for FixedProbe {
        fn free_space(&self, _path: &Path) -> Option<u64> {
            self.0
        }
    }

    fn settings(days: u32, count: u32, min_free_gb: u64) -> RotationSettings {
        RotationSettings {
            enabled: true,
            retention_days: days,
            retention_count: count,
            min_free_space_gb: min_free_gb,
        }
    }

    /// Create an artifact with its sidecar, mtime set `age_days` back.
    fn make_artifact(root: &Path, date: &str, name: &str, age_days: u64, size: usize) -> PathBuf {
        let dir = root.join(date);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        fs::write(&path, vec![b'x'; size]).unwrap();
        fs::write(fileops::meta_path(&path), b"{}").unwrap();

        let ts = Utc::now().timestamp() as u64 - age_days * 86_400;
        let status = Command::new("touch")
            .arg("-d")
            .arg(format!("@{ts}"))
            .arg(&path)
            .status()
            .unwrap();
        assert!(status.success());
        path
    }

    fn engine(root: &Path, settings: RotationSettings) -> RotationEngine {
        RotationEngine::new(root.to_path_buf(), settings, Box::new(FixedProbe(None)))
    }

    #[test]
    fn test_age_pass_deletes_expired() {
        let tmp = TempDir::new().unwrap();
        let fresh = make_artifact(tmp.path(), "2024-01-15", "app-1705338000.sql", 1, 64);
        let old = make_artifact(tmp.path(), "2024-01-08", "app-1704733200.sql", 8, 64);
        let ancient = make_artifact(tmp.path(), "2023-12-17", "app-1702813200.sql", 30, 64);

        let result = engine(tmp.path(), settings(7, 0, 0)).run(&HashMap::new());
        assert_eq!(result.deleted_count, 2);
        assert!(result.errors.is_empty());
        assert!(fresh.exists());
        assert!(!old.exists());
        assert!(!ancient.exists());
        // Sidecars go with the artifacts.
        assert!(fileops::meta_path(&fresh).exists());
        assert!(!fileops::meta_path(&old).exists());
    }

    #[test]
    fn test_empty_date_dirs_are_swept() {
        let tmp = TempDir::new().unwrap();
        make_artifact(tmp.path(), "2023-12-17", "app-1702813200.sql", 30, 64);

        engine(tmp.path(), settings(7, 0, 0)).run(&HashMap::new());
        assert!(!tmp.path().join("2023-12-17").exists());
    }

    #[test]
    fn test_count_pass_keeps_newest() {
        let tmp = TempDir::new().unwrap();
        let a = make_artifact(tmp.path(), "2024-01-15", "app-1705338000.sql", 1, 64);
        let b = make_artifact(tmp.path(), "2024-01-14", "app-1705251600.sql", 2, 64);
        let c = make_artifact(tmp.path(), "2024-01-13", "app-1705165200.sql", 3, 64);
        let other = make_artifact(tmp.path(), "2024-01-13", "db-1705165200.sql", 3, 64);

        let result = engine(tmp.path(), settings(0, 2, 0)).run(&HashMap::new());
        assert_eq!(result.deleted_count, 1);
        assert!(a.exists());
        assert!(b.exists());
        assert!(!c.exists(), "third-newest is rotated out");
        assert!(other.exists(), "count applies per container");
    }

    #[test]
    fn test_count_zero_disables_pass() {
        let tmp = TempDir::new().unwrap();
        for (date, name, age) in [
            ("2024-01-15", "app-1705338000.sql", 1),
            ("2024-01-14", "app-1705251600.sql", 2),
            ("2024-01-13", "app-1705165200.sql", 3),
        ] {
            make_artifact(tmp.path(), date, name, age, 64);
        }
        let result = engine(tmp.path(), settings(0, 0, 0)).run(&HashMap::new());
        assert_eq!(result.deleted_count, 0);
    }

    #[test]
    fn test_space_pass_deletes_oldest_first() {
        let tmp = TempDir::new().unwrap();
        let oldest = make_artifact(tmp.path(), "2024-01-13", "app-1705165200.sql", 3, 512);
        let newer = make_artifact(tmp.path(), "2024-01-14", "app-1705251600.sql", 2, 512);
        let newest = make_artifact(tmp.path(), "2024-01-15", "app-1705338000.sql", 1, 512);

        // 1 GiB required, probe reports just below it: freeing one
        // 512-byte artifact closes the gap.
        let settings = settings(0, 0, 1);
        let engine = RotationEngine::new(
            tmp.path().to_path_buf(),
            settings,
            Box::new(FixedProbe(Some(1024 * 1024 * 1024 - 256))),
        );
        let result = engine.run(&HashMap::new());
        assert_eq!(result.deleted_count, 1);
        assert!(!oldest.exists());
        assert!(newer.exists());
        assert!(newest.exists());
    }

    #[test]
    fn test_space_pass_skipped_when_disabled_or_unprobed() {
        let tmp = TempDir::new().unwrap();
        let artifact = make_artifact(tmp.path(), "2024-01-15", "app-1705338000.sql", 1, 64);

        // min_free_space_gb == 0 disables.
        let result = engine(tmp.path(), settings(0, 0, 0)).run(&HashMap::new());
        assert_eq!(result.deleted_count, 0);

        // Probe failure assumes plenty.
        let engine = RotationEngine::new(
            tmp.path().to_path_buf(),
            settings(0, 0, 100),
            Box::new(FixedProbe(None)),
        );
        let result = engine.run(&HashMap::new());
        assert_eq!(result.deleted_count, 0);
        assert!(artifact.exists());
    }

    #[test]
    fn test_per_container_overrides() {
        let tmp = TempDir::new().unwrap();
        let app_old = make_artifact(tmp.path(), "2024-01-05", "app-1704412800.sql", 10, 64);
        let db_old = make_artifact(tmp.path(), "2024-01-05", "db-1704412800.sql", 10, 64);

        let mut overrides = HashMap::new();
        overrides.insert(
            "app".to_string(),
            RetentionOverride {
                days: Some(30),
                count: None,
            },
        );

        // Global age of 7 days would delete both; the override saves app.
        engine(tmp.path(), settings(7, 0, 0)).run(&overrides);
        assert!(app_old.exists());
        assert!(!db_old.exists());
    }

    #[test]
    fn test_non_artifacts_are_ignored() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("2024-01-15");
        fs::create_dir_all(&dir).unwrap();
        for name in [
            ".app-1705338000.sql.tmp",
            "notes.txt",
            "app-1705338000.sql.meta",
            "app-123.sql",
        ] {
            fs::write(dir.join(name), b"x").unwrap();
        }

        let result = engine(tmp.path(), settings(0, 1, 0)).run(&HashMap::new());
        assert_eq!(result.deleted_count, 0);
        // Directory stays: it still holds non-artifact files.
        assert!(dir.exists());
    }

    #[test]
    fn test_encrypted_artifacts_rotate() {
        let tmp = TempDir::new().unwrap();
        let encrypted = make_artifact(
            tmp.path(),
            "2023-12-17",
            "app-1702813200.sql.gz.encrypted",
            30,
            64,
        );
        let result = engine(tmp.path(), settings(7, 0, 0)).run(&HashMap::new());
        assert_eq!(result.deleted_count, 1);
        assert!(!encrypted.exists());
    }

    #[test]
    fn test_statistics_aggregates() {
        let tmp = TempDir::new().unwrap();
        make_artifact(tmp.path(), "2024-01-15", "app-1705338000.sql", 1, 100);
        make_artifact(tmp.path(), "2024-01-14", "app-1705251600.sql", 2, 100);
        make_artifact(tmp.path(), "2024-01-15", "db-1705338000.sql.gz", 1, 50);

        let stats = engine(tmp.path(), settings(0, 0, 0)).statistics();
        assert_eq!(stats.total_count, 3);
        assert_eq!(stats.total_size, 250);
        assert_eq!(stats.per_container.len(), 2);
        let app = &stats.per_container[0];
        assert_eq!(app.container, "app");
        assert_eq!(app.count, 2);
        assert!(app.oldest.unwrap() < app.newest.unwrap());
        assert_eq!(stats.per_date.len(), 2);
    }
}
