//! Backup outcome tracking, derived metrics, and alerting.
//!
//! The monitor is shared between the scheduler, the worker tasks, and
//! the HTTP surface, so every structure here is thread-safe: the
//! in-flight map is a concurrent map, the record and alert rings sit
//! behind a mutex each. Readers snapshot under the lock.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::notify::{BackupEvent, Notifier};

/// Capacity of the backup record ring.
pub const RECORD_CAPACITY: usize = 1000;
/// Capacity of the alert ring.
pub const ALERT_CAPACITY: usize = 100;

/// A backup took longer than this many seconds → `slow_backup`.
const SLOW_BACKUP_SECONDS: f64 = 600.0;
/// A successful artifact below this size → `small_backup`.
const SMALL_BACKUP_BYTES: u64 = 1024;
/// This many failures among a container's last 10 records → `repeated_failures`.
const REPEATED_FAILURE_THRESHOLD: usize = 3;
const REPEATED_FAILURE_WINDOW: usize = 10;

/// Outcome of one backup attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Success,
    Failed,
}

/// Append-only record of one finished backup attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    pub container_name: String,
    pub timestamp: DateTime<Utc>,
    pub duration_seconds: f64,
    pub file_size_bytes: u64,
    pub file_path: Option<String>,
    pub status: BackupStatus,
    pub error: Option<String>,
}

/// Kinds of operational alerts the monitor raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    SlowBackup,
    SmallBackup,
    RepeatedFailures,
}

/// An alert raised from the alerting rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Derived metrics over the record ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    /// Percentage of successes over the last 100 records.
    pub success_rate: f64,
    pub avg_duration_seconds: f64,
    pub avg_size_bytes: u64,
    pub total_data_bytes: u64,
    pub active_alerts: usize,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Per-container aggregate served to the HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerStats {
    pub container_name: String,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub total_size_bytes: u64,
    pub last_backup: Option<DateTime<Utc>>,
    pub last_status: Option<BackupStatus>,
}

/// Export formats for the record ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

struct InFlight {
    engine: String,
    started: Instant,
}

/// Thread-safe ring of backup outcomes with derived metrics and alerts.
pub struct BackupMonitor {
    in_flight: DashMap<String, InFlight>,
    records: Mutex<VecDeque<BackupRecord>>,
    alerts: Mutex<VecDeque<Alert>>,
    notifier: Option<Arc<Notifier>>,
}

impl BackupMonitor {
    pub fn new() -> Self {
        Self {
            in_flight: DashMap::new(),
            records: Mutex::new(VecDeque::with_capacity(RECORD_CAPACITY)),
            alerts: Mutex::new(VecDeque::with_capacity(ALERT_CAPACITY)),
            notifier: None,
        }
    }

    /// Monitor that forwards success/failure/warning events.
    pub fn with_notifier(notifier: Arc<Notifier>) -> Self {
        Self {
            notifier: Some(notifier),
            ..Self::new()
        }
    }

    /// Record that a backup attempt has begun.
    pub fn start(&self, container_name: &str, engine: &str) {
        debug!(container = container_name, engine, "backup started");
        self.in_flight.insert(
            container_name.to_string(),
            InFlight {
                engine: engine.to_string(),
                started: Instant::now(),
            },
        );
    }

    /// Containers currently mid-pipeline.
    pub fn in_flight(&self) -> Vec<(String, String)> {
        self.in_flight
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().engine.clone()))
            .collect()
    }

    /// Record a successful backup.
    pub fn complete(&self, container_name: &str, path: &Path, size: Option<u64>) {
        let duration = self.take_duration(container_name);
        let size = size.unwrap_or(0);
        let record = BackupRecord {
            container_name: container_name.to_string(),
            timestamp: Utc::now(),
            duration_seconds: duration,
            file_size_bytes: size,
            file_path: Some(path.display().to_string()),
            status: BackupStatus::Success,
            error: None,
        };
        self.push_record(record);

        self.emit(BackupEvent::Success {
            container: container_name.to_string(),
            size_bytes: size,
            duration_seconds: duration,
            path: path.display().to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Record a failed backup attempt.
    pub fn fail(&self, container_name: &str, error: &str) {
        let duration = self.take_duration(container_name);
        let record = BackupRecord {
            container_name: container_name.to_string(),
            timestamp: Utc::now(),
            duration_seconds: duration,
            file_size_bytes: 0,
            file_path: None,
            status: BackupStatus::Failed,
            error: Some(error.to_string()),
        };
        self.push_record(record);

        self.emit(BackupEvent::Failure {
            container: container_name.to_string(),
            error: error.to_string(),
            timestamp: Utc::now(),
        });
    }

    fn take_duration(&self, container_name: &str) -> f64 {
        match self.in_flight.remove(container_name) {
            Some((_, entry)) => entry.started.elapsed().as_secs_f64(),
            None => {
                debug!(container = container_name, "outcome recorded without a start mark");
                0.0
            }
        }
    }

    fn push_record(&self, record: BackupRecord) {
        let alerts = {
            let mut records = self.records.lock().expect("monitor lock poisoned");
            if records.len() == RECORD_CAPACITY {
                records.pop_front();
            }
            records.push_back(record.clone());
            evaluate_alert_rules(&records, &record)
        };

        for alert in alerts {
            warn!(alert_type = ?alert.alert_type, message = %alert.message, "alert raised");
            self.emit(BackupEvent::Warning {
                container: Some(record.container_name.clone()),
                message: alert.message.clone(),
                timestamp: alert.timestamp,
            });
            let mut ring = self.alerts.lock().expect("monitor lock poisoned");
            if ring.len() == ALERT_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(alert);
        }
    }

    /// Forward an event to the attached notifier without blocking the
    /// caller; dispatch happens on the runtime if one is available.
    fn emit(&self, event: BackupEvent) {
        let Some(notifier) = self.notifier.clone() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { notifier.dispatch(&event).await });
            }
            Err(_) => debug!("no async runtime, notification dropped"),
        }
    }

    /// Derived metrics snapshot.
    pub fn summary(&self) -> MonitorSummary {
        let records = self.records.lock().expect("monitor lock poisoned");
        let total = records.len();
        let successful = records
            .iter()
            .filter(|r| r.status == BackupStatus::Success)
            .count();
        let failed = total - successful;

        let window: Vec<_> = records.iter().rev().take(100).collect();
        let success_rate = if window.is_empty() {
            0.0
        } else {
            let wins = window
                .iter()
                .filter(|r| r.status == BackupStatus::Success)
                .count();
            wins as f64 / window.len() as f64 * 100.0
        };

        let (duration_sum, size_sum) = records
            .iter()
            .filter(|r| r.status == BackupStatus::Success)
            .fold((0.0, 0u64), |(d, s), r| {
                (d + r.duration_seconds, s + r.file_size_bytes)
            });
        let avg_duration_seconds = if successful > 0 {
            duration_sum / successful as f64
        } else {
            0.0
        };
        let avg_size_bytes = if successful > 0 {
            size_sum / successful as u64
        } else {
            0
        };

        MonitorSummary {
            total,
            successful,
            failed,
            success_rate,
            avg_duration_seconds,
            avg_size_bytes,
            total_data_bytes: size_sum,
            active_alerts: self.alerts.lock().expect("monitor lock poisoned").len(),
            last_updated: records.back().map(|r| r.timestamp),
        }
    }

    /// Aggregate for one container.
    pub fn per_container(&self, container_name: &str) -> ContainerStats {
        let records = self.records.lock().expect("monitor lock poisoned");
        let mine: Vec<_> = records
            .iter()
            .filter(|r| r.container_name == container_name)
            .collect();
        let successful = mine
            .iter()
            .filter(|r| r.status == BackupStatus::Success)
            .count();
        ContainerStats {
            container_name: container_name.to_string(),
            total: mine.len(),
            successful,
            failed: mine.len() - successful,
            total_size_bytes: mine.iter().map(|r| r.file_size_bytes).sum(),
            last_backup: mine.last().map(|r| r.timestamp),
            last_status: mine.last().map(|r| r.status),
        }
    }

    /// Names of every container seen in the ring.
    pub fn container_names(&self) -> Vec<String> {
        let records = self.records.lock().expect("monitor lock poisoned");
        let mut names: Vec<String> = records.iter().map(|r| r.container_name.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    /// The most recent `n` records, newest first.
    pub fn recent(&self, n: usize) -> Vec<BackupRecord> {
        let records = self.records.lock().expect("monitor lock poisoned");
        records.iter().rev().take(n).cloned().collect()
    }

    /// The most recent `n` failures, newest first.
    pub fn failures(&self, n: usize) -> Vec<BackupRecord> {
        let records = self.records.lock().expect("monitor lock poisoned");
        records
            .iter()
            .rev()
            .filter(|r| r.status == BackupStatus::Failed)
            .take(n)
            .cloned()
            .collect()
    }

    /// Current alert ring, newest first.
    pub fn alerts(&self) -> Vec<Alert> {
        let alerts = self.alerts.lock().expect("monitor lock poisoned");
        alerts.iter().rev().cloned().collect()
    }

    /// Export the record ring.
    pub fn export(&self, format: ExportFormat) -> Result<String> {
        let records = self.records.lock().expect("monitor lock poisoned");
        match format {
            ExportFormat::Json => {
                Ok(serde_json::to_string(&records.iter().collect::<Vec<_>>())?)
            }
            ExportFormat::Csv => {
                let mut out = String::from(
                    "container_name,timestamp,duration_seconds,file_size_bytes,file_path,status,error\n",
                );
                for r in records.iter() {
                    let status = match r.status {
                        BackupStatus::Success => "success",
                        BackupStatus::Failed => "failed",
                    };
                    out.push_str(&format!(
                        "{},{},{:.3},{},{},{},{}\n",
                        csv_field(&r.container_name),
                        r.timestamp.to_rfc3339(),
                        r.duration_seconds,
                        r.file_size_bytes,
                        csv_field(r.file_path.as_deref().unwrap_or("")),
                        status,
                        csv_field(r.error.as_deref().unwrap_or("")),
                    ));
                }
                Ok(out)
            }
        }
    }
}

impl Default for BackupMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Apply the alerting rules to a freshly pushed record.
fn evaluate_alert_rules(records: &VecDeque<BackupRecord>, record: &BackupRecord) -> Vec<Alert> {
    let mut alerts = Vec::new();
    let now = Utc::now();

    if record.duration_seconds > SLOW_BACKUP_SECONDS {
        alerts.push(Alert {
            id: Uuid::new_v4(),
            alert_type: AlertType::SlowBackup,
            message: format!(
                "backup of '{}' took {:.0}s",
                record.container_name, record.duration_seconds
            ),
            timestamp: now,
        });
    }

    if record.status == BackupStatus::Success && record.file_size_bytes < SMALL_BACKUP_BYTES {
        alerts.push(Alert {
            id: Uuid::new_v4(),
            alert_type: AlertType::SmallBackup,
            message: format!(
                "backup of '{}' is only {} bytes",
                record.container_name, record.file_size_bytes
            ),
            timestamp: now,
        });
    }

    if record.status == BackupStatus::Failed {
        let recent_failures = records
            .iter()
            .rev()
            .filter(|r| r.container_name == record.container_name)
            .take(REPEATED_FAILURE_WINDOW)
            .filter(|r| r.status == BackupStatus::Failed)
            .count();
        if recent_failures >= REPEATED_FAILURE_THRESHOLD {
            alerts.push(Alert {
                id: Uuid::new_v4(),
                alert_type: AlertType::RepeatedFailures,
                message: format!(
                    "'{}' failed {recent_failures} of its last {REPEATED_FAILURE_WINDOW} backups",
                    record.container_name
                ),
                timestamp: now,
            });
        }
    }

    alerts
}
