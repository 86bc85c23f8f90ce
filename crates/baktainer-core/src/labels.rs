//! Declarative schema for the `baktainer.*` container label surface.
//!
//! The schema drives validation and normalization of backup labels:
//! required keys, type coercion, range checks, cross-field warnings, and
//! unknown-key detection. A container whose labels do not validate is
//! skipped with the errors logged and surfaced to the notifier.

use std::collections::HashMap;
use std::str::FromStr;

use crate::container::{BackupSettings, Engine, Priority};

/// `baktainer.backup`: must be `true` for a container to be considered.
pub const BACKUP_ENABLED: &str = "baktainer.backup";
/// `baktainer.name`: artifact base name, defaults to the container name.
pub const BACKUP_NAME: &str = "baktainer.name";
/// `baktainer.db.engine`: database engine selector.
pub const DB_ENGINE: &str = "baktainer.db.engine";
/// `baktainer.db.name`: database to dump (`*` with `db.all`).
pub const DB_NAME: &str = "baktainer.db.name";
/// `baktainer.db.user`: credentials, required for non-sqlite engines.
pub const DB_USER: &str = "baktainer.db.user";
/// `baktainer.db.password`: credentials, required for non-sqlite engines.
pub const DB_PASSWORD: &str = "baktainer.db.password";
/// `baktainer.db.all`: dump every database the engine holds.
pub const DB_ALL: &str = "baktainer.db.all";
/// `baktainer.backup.compress`: per-container gzip override.
pub const COMPRESS: &str = "baktainer.backup.compress";
/// `baktainer.backup.encrypt`: per-container encryption override.
pub const ENCRYPT: &str = "baktainer.backup.encrypt";
/// `baktainer.backup.retention.days`: per-container age override.
pub const RETENTION_DAYS: &str = "baktainer.backup.retention.days";
/// `baktainer.backup.retention.count`: per-container count override.
pub const RETENTION_COUNT: &str = "baktainer.backup.retention.count";
/// `baktainer.backup.priority`: informational priority.
pub const PRIORITY: &str = "baktainer.backup.priority";

/// Engines the label schema accepts for `baktainer.db.engine`.
const ENGINE_VALUES: &[&str] = &["mysql", "mariadb", "postgres", "postgresql", "sqlite"];

const PRIORITY_VALUES: &[&str] = &["low", "normal", "high", "critical"];

/// Value type of a schema entry.
#[derive(Debug, Clone, Copy)]
enum LabelKind {
    Bool,
    Int { min: i64, max: i64 },
    Enum(&'static [&'static str]),
    /// `[A-Za-z0-9_-]`, bounded length.
    Name { max_len: usize },
    /// Free-form value, bounded length. Shell-unsafe characters are
    /// caught later by command sanitization.
    Text { max_len: usize },
}

/// When a schema entry must be present.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Requirement {
    Required,
    RequiredUnlessSqlite,
    Optional,
}

struct LabelSpec {
    key: &'static str,
    kind: LabelKind,
    required: Requirement,
    #[allow(dead_code)]
    description: &'static str,
}

/// The declarative schema table. Defaults that depend on context (the
/// container name for `baktainer.name`, the global config for retention)
/// are deferred and applied during normalization.
const SCHEMA: &[LabelSpec] = &[
    LabelSpec {
        key: BACKUP_ENABLED,
        kind: LabelKind::Bool,
        required: Requirement::Required,
        description: "opt the container into scheduled backups",
    },
    LabelSpec {
        key: DB_ENGINE,
        kind: LabelKind::Enum(ENGINE_VALUES),
        required: Requirement::Required,
        description: "database engine the dump strategy is selected by",
    },
    LabelSpec {
        key: DB_NAME,
        kind: LabelKind::Name { max_len: 64 },
        required: Requirement::Required,
        description: "database to dump; '*' together with db.all",
    },
    LabelSpec {
        key: DB_USER,
        kind: LabelKind::Text { max_len: 128 },
        required: Requirement::RequiredUnlessSqlite,
        description: "database user",
    },
    LabelSpec {
        key: DB_PASSWORD,
        kind: LabelKind::Text { max_len: 256 },
        required: Requirement::RequiredUnlessSqlite,
        description: "database password",
    },
    LabelSpec {
        key: BACKUP_NAME,
        kind: LabelKind::Name { max_len: 64 },
        required: Requirement::Optional,
        description: "artifact base name, defaults to the container name",
    },
    LabelSpec {
        key: DB_ALL,
        kind: LabelKind::Bool,
        required: Requirement::Optional,
        description: "dump all databases where the engine supports it",
    },
    LabelSpec {
        key: COMPRESS,
        kind: LabelKind::Bool,
        required: Requirement::Optional,
        description: "override the global compression switch",
    },
    LabelSpec {
        key: ENCRYPT,
        kind: LabelKind::Bool,
        required: Requirement::Optional,
        description: "override the global encryption switch",
    },
    LabelSpec {
        key: RETENTION_DAYS,
        kind: LabelKind::Int { min: 1, max: 3650 },
        required: Requirement::Optional,
        description: "override the global retention age",
    },
    LabelSpec {
        key: RETENTION_COUNT,
        kind: LabelKind::Int { min: 0, max: 1000 },
        required: Requirement::Optional,
        description: "override the global retention count",
    },
    LabelSpec {
        key: PRIORITY,
        kind: LabelKind::Enum(PRIORITY_VALUES),
        required: Requirement::Optional,
        description: "informational backup priority",
    },
];

/// Outcome of validating one container's labels.
#[derive(Debug, Clone)]
pub struct LabelVerdict {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Present iff `valid`.
    pub normalized: Option<BackupSettings>,
}

/// Validator/normalizer for the `baktainer.*` label namespace.
#[derive(Debug, Clone)]
pub struct LabelSchema {
    /// Whether an encryption key is configured; `backup.encrypt=true`
    /// without one is a hard error.
    encryption_configured: bool,
}

impl LabelSchema {
    pub fn new(encryption_configured: bool) -> Self {
        Self {
            encryption_configured,
        }
    }

    /// Validate and normalize a label mapping.
    pub fn validate(&self, container_name: &str, labels: &HashMap<String, String>) -> LabelVerdict {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        // Pass 1: per-key checks from the schema table.
        let engine = self.parse_engine(labels, &mut errors);
        for spec in SCHEMA {
            self.check_entry(spec, labels, engine, &mut errors);
        }
        if let Ok(Some(false)) = coerce_bool(labels.get(BACKUP_ENABLED)) {
            errors.push(format!("{BACKUP_ENABLED} must be true"));
        }

        // Pass 2: unknown keys in our namespace.
        for key in labels.keys() {
            if key.starts_with("baktainer.") && !SCHEMA.iter().any(|s| s.key == key) {
                warnings.push(format!("unknown label '{key}'"));
            }
        }

        // Pass 3: cross-field rules.
        let all_databases = coerce_bool(labels.get(DB_ALL)).unwrap_or(Some(false)).unwrap_or(false);
        if let Some(engine) = engine {
            if engine == Engine::Sqlite {
                if labels.contains_key(DB_USER)
                    || labels.contains_key(DB_PASSWORD)
                    || labels.contains_key(DB_ALL)
                {
                    warnings.push(
                        "sqlite ignores db.user, db.password and db.all".to_string(),
                    );
                }
            }
            if engine.supports_all_databases()
                && all_databases
                && labels.get(DB_NAME).map(String::as_str) != Some("*")
            {
                warnings.push(format!(
                    "db.all=true dumps every database; set {DB_NAME}='*' to make that explicit"
                ));
            }
        }
        if let Some(Ok(days)) = labels.get(RETENTION_DAYS).map(|v| v.trim().parse::<i64>()) {
            if (1..7).contains(&days) {
                warnings.push(format!(
                    "retention of {days} days keeps less than one week of backups"
                ));
            }
        }
        if let Ok(Some(true)) = coerce_bool(labels.get(ENCRYPT)) {
            if !self.encryption_configured {
                errors.push(
                    "backup.encrypt=true but no encryption key is configured".to_string(),
                );
            }
        }

        let valid = errors.is_empty();
        let normalized = if valid {
            Some(self.normalize(container_name, labels, engine, all_databases))
        } else {
            None
        };

        LabelVerdict {
            valid,
            errors,
            warnings,
            normalized,
        }
    }

    fn parse_engine(
        &self,
        labels: &HashMap<String, String>,
        errors: &mut Vec<String>,
    ) -> Option<Engine> {
        let raw = labels.get(DB_ENGINE)?;
        match Engine::from_str(raw) {
            Ok(engine) if ENGINE_VALUES.contains(&raw.to_ascii_lowercase().as_str()) => {
                Some(engine)
            }
            _ => {
                errors.push(format!(
                    "{DB_ENGINE} must be one of {ENGINE_VALUES:?}, got '{raw}'"
                ));
                None
            }
        }
    }

    fn check_entry(
        &self,
        spec: &LabelSpec,
        labels: &HashMap<String, String>,
        engine: Option<Engine>,
        errors: &mut Vec<String>,
    ) {
        let value = labels.get(spec.key);

        let required = match spec.required {
            Requirement::Required => true,
            Requirement::RequiredUnlessSqlite => {
                engine.map(|e| e.requires_credentials()).unwrap_or(false)
            }
            Requirement::Optional => false,
        };
        let value = match value {
            Some(v) => v,
            None => {
                if required {
                    errors.push(format!("required label '{}' is missing", spec.key));
                }
                return;
            }
        };

        match spec.kind {
            LabelKind::Bool => {
                if coerce_bool(Some(value)).is_err() {
                    errors.push(format!(
                        "{} must be a boolean (true|1|yes|on / false|0|no|off), got '{value}'",
                        spec.key
                    ));
                }
            }
            LabelKind::Int { min, max } => match value.trim().parse::<i64>() {
                Ok(n) if (min..=max).contains(&n) => {}
                Ok(n) => errors.push(format!(
                    "{} must be between {min} and {max}, got {n}",
                    spec.key
                )),
                Err(_) => errors.push(format!("{} must be an integer, got '{value}'", spec.key)),
            },
            LabelKind::Enum(values) => {
                // The engine enum is reported separately with its own message.
                if spec.key != DB_ENGINE
                    && !values.contains(&value.to_ascii_lowercase().as_str())
                {
                    errors.push(format!(
                        "{} must be one of {values:?}, got '{value}'",
                        spec.key
                    ));
                }
            }
            LabelKind::Name { max_len } => {
                // '*' is the explicit spelling of "all databases".
                if spec.key == DB_NAME && value == "*" {
                    return;
                }
                let ok = !value.is_empty()
                    && value.len() <= max_len
                    && value
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
                if !ok {
                    errors.push(format!(
                        "{} must be 1-{max_len} chars of [A-Za-z0-9_-], got '{value}'",
                        spec.key
                    ));
                }
            }
            LabelKind::Text { max_len } => {
                if value.is_empty() || value.len() > max_len {
                    errors.push(format!(
                        "{} must be 1-{max_len} chars, got {} chars",
                        spec.key,
                        value.len()
                    ));
                }
            }
        }
    }

    /// Build the normalized settings. Only called on validated labels,
    /// so every coercion here is infallible.
    fn normalize(
        &self,
        container_name: &str,
        labels: &HashMap<String, String>,
        engine: Option<Engine>,
        all_databases: bool,
    ) -> BackupSettings {
        let database = labels.get(DB_NAME).filter(|v| v.as_str() != "*").cloned();
        BackupSettings {
            engine: engine.expect("validated labels always carry an engine"),
            database,
            user: labels.get(DB_USER).cloned(),
            password: labels.get(DB_PASSWORD).cloned(),
            backup_name: labels
                .get(BACKUP_NAME)
                .cloned()
                .unwrap_or_else(|| container_name.to_string()),
            all_databases,
            compress: coerce_bool(labels.get(COMPRESS)).unwrap_or(None),
            encrypt: coerce_bool(labels.get(ENCRYPT)).unwrap_or(None),
            retention_days: labels
                .get(RETENTION_DAYS)
                .and_then(|v| v.trim().parse().ok()),
            retention_count: labels
                .get(RETENTION_COUNT)
                .and_then(|v| v.trim().parse().ok()),
            priority: labels
                .get(PRIORITY)
                .and_then(|v| v.parse::<Priority>().ok())
                .unwrap_or_default(),
        }
    }
}

/// Coerce a label value to a boolean.
///
/// `Ok(None)` means the label was absent; `Err` carries the raw value.
fn coerce_bool(value: Option<&String>) -> Result<Option<bool>, String> {
    match value {
        None => Ok(None),
        Some(v) => match v.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Some(true)),
            "false" | "0" | "no" | "off" => Ok(Some(false)),
            other => Err(other.to_string()),
        },
    }
}

/// Whether a label mapping opts the container into backups at all.
///
/// Used by discovery as a cheap pre-filter before full validation.
pub fn backup_enabled(labels: &HashMap<String, String>) -> bool {
    matches!(coerce_bool(labels.get(BACKUP_ENABLED)), Ok(Some(true)))
}
