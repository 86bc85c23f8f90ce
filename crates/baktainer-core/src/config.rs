//! Process configuration.
//!
//! The `BT_*` environment surface is the authoritative configuration
//! source. Configuration is read once at startup, validated, and frozen;
//! there is no hot reload.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Channels the notifier knows how to drive.
pub const KNOWN_CHANNELS: &[&str] = &["log", "webhook", "slack", "discord", "teams", "email"];

/// Log verbosity, mapped onto the tracing filter by the binary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(Error::Config(format!(
                "invalid log level '{other}', expected debug|info|warn|error"
            ))),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// TLS material for the runtime client. Each field is either a file path
/// or an inline PEM document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSettings {
    pub ca: String,
    pub cert: String,
    pub key: String,
}

/// Retention policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationSettings {
    pub enabled: bool,
    /// Delete artifacts older than this many days. 0 disables the age pass.
    pub retention_days: u32,
    /// Keep at most this many artifacts per container. 0 means unlimited.
    pub retention_count: u32,
    /// Reap oldest artifacts until this much space is free. 0 disables.
    pub min_free_space_gb: u64,
}

/// Where the AES-256 key material comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KeySource {
    /// Raw key string: 32 bytes, 64 hex chars, `base64:` payload, or an
    /// arbitrary string run through PBKDF2.
    Literal(String),
    /// File whose contents are interpreted like [`KeySource::Literal`].
    File(PathBuf),
    /// Passphrase derived with the passphrase-specific salt.
    Passphrase(String),
}

/// Encryption-at-rest switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionSettings {
    pub enabled: bool,
    pub key_source: Option<KeySource>,
}

/// Notifier channel selection and per-event gates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationSettings {
    /// Lowercased channel names, validated against [`KNOWN_CHANNELS`].
    pub channels: Vec<String>,
    pub notify_success: bool,
    pub notify_failures: bool,
    pub notify_warnings: bool,
    pub notify_health: bool,
    pub notify_summary: bool,
    pub webhook_url: Option<String>,
    pub slack_webhook_url: Option<String>,
    pub discord_webhook_url: Option<String>,
    pub teams_webhook_url: Option<String>,
}

/// HTTP observability surface binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthServerSettings {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
}

/// Immutable typed settings for the whole process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Container runtime endpoint (unix://, tcp://, http://, https://).
    pub runtime_url: String,
    /// Five-field cron expression driving the backup cycle.
    pub cron_schedule: String,
    /// Worker pool size for the per-cycle fan-out.
    pub threads: usize,
    pub log_level: LogLevel,
    /// Absolute path artifacts are published under.
    pub backup_dir: PathBuf,
    /// Global gzip switch; containers may override per label.
    pub compress: bool,
    /// TLS material, present iff `BT_SSL=true`.
    pub tls: Option<TlsSettings>,
    pub rotation: RotationSettings,
    pub encryption: EncryptionSettings,
    pub notifications: NotificationSettings,
    pub health_server: HealthServerSettings,
}

impl Config {
    /// Read and validate configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary lookup function.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let runtime_url =
            get("BT_DOCKER_URL").unwrap_or_else(|| "unix:///var/run/docker.sock".to_string());
        let cron_schedule = get("BT_CRON").unwrap_or_else(|| "0 0 * * *".to_string());
        let threads = parse_int(&get("BT_THREADS"), "BT_THREADS", 4, 1, 50)? as usize;
        let log_level = match get("BT_LOG_LEVEL") {
            Some(v) => v.parse()?,
            None => LogLevel::default(),
        };
        let backup_dir = PathBuf::from(get("BT_BACKUP_DIR").unwrap_or_else(|| "/backups".into()));
        let compress = parse_bool(&get("BT_COMPRESS"), "BT_COMPRESS", true)?;

        let tls = if parse_bool(&get("BT_SSL"), "BT_SSL", false)? {
            Some(TlsSettings {
                ca: get("BT_CA").unwrap_or_default(),
                cert: get("BT_CERT").unwrap_or_default(),
                key: get("BT_KEY").unwrap_or_default(),
            })
        } else {
            None
        };

        let rotation = RotationSettings {
            enabled: parse_bool(&get("BT_ROTATION_ENABLED"), "BT_ROTATION_ENABLED", true)?,
            retention_days: parse_int(&get("BT_RETENTION_DAYS"), "BT_RETENTION_DAYS", 30, 0, 365)?,
            retention_count: parse_int(
                &get("BT_RETENTION_COUNT"),
                "BT_RETENTION_COUNT",
                0,
                0,
                1000,
            )?,
            min_free_space_gb: parse_int(
                &get("BT_MIN_FREE_SPACE_GB"),
                "BT_MIN_FREE_SPACE_GB",
                10,
                0,
                1000,
            )? as u64,
        };

        let encryption_enabled = parse_bool(
            &get("BT_ENCRYPTION_ENABLED"),
            "BT_ENCRYPTION_ENABLED",
            false,
        )?;
        let key = get("BT_ENCRYPTION_KEY");
        let key_file = get("BT_ENCRYPTION_KEY_FILE");
        let passphrase = get("BT_ENCRYPTION_PASSPHRASE");
        let key_source = match (key, key_file, passphrase) {
            (Some(k), None, None) => Some(KeySource::Literal(k)),
            (None, Some(f), None) => Some(KeySource::File(PathBuf::from(f))),
            (None, None, Some(p)) => Some(KeySource::Passphrase(p)),
            (None, None, None) => None,
            _ => {
                return Err(Error::Config(
                    "BT_ENCRYPTION_KEY, BT_ENCRYPTION_KEY_FILE and BT_ENCRYPTION_PASSPHRASE \
                     are mutually exclusive"
                        .into(),
                ))
            }
        };
        let encryption = EncryptionSettings {
            enabled: encryption_enabled,
            key_source,
        };

        let channels = get("BT_NOTIFICATION_CHANNELS")
            .map(|list| {
                list.split(',')
                    .map(|c| c.trim().to_ascii_lowercase())
                    .filter(|c| !c.is_empty())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_else(|| vec!["log".to_string()]);
        let notifications = NotificationSettings {
            channels,
            notify_success: parse_bool(&get("BT_NOTIFY_SUCCESS"), "BT_NOTIFY_SUCCESS", false)?,
            notify_failures: parse_bool(&get("BT_NOTIFY_FAILURES"), "BT_NOTIFY_FAILURES", true)?,
            notify_warnings: parse_bool(&get("BT_NOTIFY_WARNINGS"), "BT_NOTIFY_WARNINGS", true)?,
            notify_health: parse_bool(&get("BT_NOTIFY_HEALTH"), "BT_NOTIFY_HEALTH", true)?,
            notify_summary: parse_bool(&get("BT_NOTIFY_SUMMARY"), "BT_NOTIFY_SUMMARY", false)?,
            webhook_url: get("BT_WEBHOOK_URL"),
            slack_webhook_url: get("BT_SLACK_WEBHOOK_URL"),
            discord_webhook_url: get("BT_DISCORD_WEBHOOK_URL"),
            teams_webhook_url: get("BT_TEAMS_WEBHOOK_URL"),
        };

        let health_server = HealthServerSettings {
            enabled: parse_bool(
                &get("BT_HEALTH_SERVER_ENABLED"),
                "BT_HEALTH_SERVER_ENABLED",
                false,
            )?,
            bind: get("BT_HEALTH_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_int(&get("BT_HEALTH_PORT"), "BT_HEALTH_PORT", 8080, 1, 65535)? as u16,
        };

        let config = Config {
            runtime_url,
            cron_schedule,
            threads,
            log_level,
            backup_dir,
            compress,
            tls,
            rotation,
            encryption,
            notifications,
            health_server,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        const SCHEMES: &[&str] = &["unix://", "tcp://", "http://", "https://"];
        if !SCHEMES.iter().any(|s| self.runtime_url.starts_with(s)) {
            return Err(Error::Config(format!(
                "BT_DOCKER_URL must begin with one of {SCHEMES:?}, got '{}'",
                self.runtime_url
            )));
        }

        if self.cron_schedule.split_whitespace().count() != 5 {
            return Err(Error::Config(format!(
                "BT_CRON must have exactly 5 whitespace-separated fields, got '{}'",
                self.cron_schedule
            )));
        }

        if !self.backup_dir.is_absolute() {
            return Err(Error::Config(format!(
                "BT_BACKUP_DIR must be an absolute path, got '{}'",
                self.backup_dir.display()
            )));
        }

        if let Some(tls) = &self.tls {
            if tls.ca.is_empty() || tls.cert.is_empty() || tls.key.is_empty() {
                return Err(Error::Config(
                    "BT_SSL=true requires BT_CA, BT_CERT and BT_KEY".into(),
                ));
            }
        }

        if self.encryption.enabled && self.encryption.key_source.is_none() {
            return Err(Error::Config(
                "BT_ENCRYPTION_ENABLED=true requires exactly one of BT_ENCRYPTION_KEY, \
                 BT_ENCRYPTION_KEY_FILE or BT_ENCRYPTION_PASSPHRASE"
                    .into(),
            ));
        }

        for channel in &self.notifications.channels {
            if !KNOWN_CHANNELS.contains(&channel.as_str()) {
                return Err(Error::Config(format!(
                    "unknown notification channel '{channel}', expected a subset of {KNOWN_CHANNELS:?}"
                )));
            }
        }

        Ok(())
    }
}

fn parse_bool(value: &Option<String>, key: &str, default: bool) -> Result<bool> {
    match value {
        None => Ok(default),
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            other => Err(Error::Config(format!(
                "{key} must be a boolean, got '{other}'"
            ))),
        },
    }
}

fn parse_int(value: &Option<String>, key: &str, default: u32, min: u32, max: u32) -> Result<u32> {
    let n = match value {
        None => default,
        Some(v) => v
            .trim()
            .parse::<u32>()
            .map_err(|_| Error::Config(format!("{key} must be an integer, got '{v}'")))?,
    };
    if n < min || n > max {
        return Err(Error::Config(format!(
            "{key} must be between {min} and {max}, got {n}"
        )));
    }
    Ok(n)
}

/// Convenience for tests and embedding: build a lookup over a map.
pub fn map_lookup(map: &HashMap<String, String>) -> impl Fn(&str) -> Option<String> + '_ {
    move |key| map.get(key).cloned()
}
