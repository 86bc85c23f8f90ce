//! Per-engine dump command generation.
//!
//! Each strategy turns normalized backup settings into the argv/env pair
//! executed inside the container, and carries the token set used for the
//! warning-only content sniff. Strategies are looked up through a
//! registry keyed by canonical engine name; new strategies can be
//! registered by name at startup.

use std::collections::HashMap;
use std::sync::Arc;

use crate::container::{BackupSettings, Engine};
use crate::error::{Error, Result};

/// Executables a generated command may invoke.
pub const COMMAND_WHITELIST: &[&str] =
    &["mysqldump", "pg_dump", "pg_dumpall", "sqlite3", "mongodump"];

/// Shell metacharacters no argument may contain.
const FORBIDDEN_CHARS: &[char] = &[
    ';', '&', '|', '`', '$', '(', ')', '{', '}', '[', ']', '<', '>',
];

/// A sanitized command ready for container exec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupCommand {
    /// `KEY=VALUE` environment entries, in order.
    pub env: Vec<String>,
    /// argv tokens; the first is the executable.
    pub cmd: Vec<String>,
}

impl BackupCommand {
    /// Build a command, enforcing the executable whitelist and the
    /// argument character fence.
    pub fn new(env: Vec<String>, cmd: Vec<String>) -> Result<Self> {
        let executable = cmd
            .first()
            .ok_or_else(|| Error::Security("empty command".into()))?;
        if !COMMAND_WHITELIST.contains(&executable.as_str()) {
            return Err(Error::Security(format!(
                "Command '{executable}' is not allowed"
            )));
        }

        for arg in &cmd {
            sanitize_token(arg)?;
            if arg.starts_with('/') {
                return Err(Error::Security(format!(
                    "argument '{arg}' must not be an absolute path"
                )));
            }
            if arg.contains("..") {
                return Err(Error::Security(format!(
                    "argument '{arg}' must not contain '..'"
                )));
            }
        }
        for entry in &env {
            if !entry.contains('=') {
                return Err(Error::Security(format!(
                    "environment entry '{entry}' is not KEY=VALUE"
                )));
            }
            if entry.chars().any(|c| c.is_control()) {
                return Err(Error::Security(
                    "environment entry contains control characters".into(),
                ));
            }
        }

        Ok(Self { env, cmd })
    }
}

fn sanitize_token(arg: &str) -> Result<()> {
    if let Some(bad) = arg.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
        return Err(Error::Security(format!(
            "argument '{arg}' contains forbidden character '{bad}'"
        )));
    }
    if arg
        .bytes()
        .any(|b| b < 0x20 || b == 0x7f)
    {
        return Err(Error::Security(format!(
            "argument '{arg}' contains control characters"
        )));
    }
    Ok(())
}

/// Inputs a strategy builds its command from.
#[derive(Debug, Clone, Default)]
pub struct DumpOptions {
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    pub all_databases: bool,
}

impl DumpOptions {
    pub fn from_settings(settings: &BackupSettings) -> Self {
        Self {
            user: settings.user.clone(),
            password: settings.password.clone(),
            database: settings.database.clone(),
            all_databases: settings.all_databases,
        }
    }

    fn require(&self, field: &str, value: &Option<String>, engine: &str) -> Result<String> {
        value
            .clone()
            .ok_or_else(|| Error::Validation(format!("{engine} backup requires {field}")))
    }
}

/// A dump command generator for one engine.
pub trait DumpStrategy: Send + Sync {
    /// Canonical engine name, the registry key.
    fn engine(&self) -> &'static str;

    /// Build the dump command for the given options.
    fn command(&self, opts: &DumpOptions) -> Result<BackupCommand>;

    /// Tokens expected somewhere in the first lines of a dump.
    fn sniff_tokens(&self) -> &'static [&'static str];

    /// Heuristic content check over lowercased head lines. Warning-only:
    /// a miss never aborts a backup.
    fn sniff(&self, lines: &[String]) -> bool {
        lines
            .iter()
            .any(|line| self.sniff_tokens().iter().any(|t| line.contains(t)))
    }
}

struct MysqlStrategy;

impl DumpStrategy for MysqlStrategy {
    fn engine(&self) -> &'static str {
        "mysql"
    }

    fn command(&self, opts: &DumpOptions) -> Result<BackupCommand> {
        let user = opts.require("db.user", &opts.user, self.engine())?;
        let password = opts.require("db.password", &opts.password, self.engine())?;
        let database = opts.require("db.name", &opts.database, self.engine())?;
        BackupCommand::new(
            vec![],
            vec![
                "mysqldump".into(),
                "-u".into(),
                user,
                format!("-p{password}"),
                database,
            ],
        )
    }

    fn sniff_tokens(&self) -> &'static [&'static str] {
        &["mysql dump", "mysqldump", "create", "insert"]
    }
}

struct MariadbStrategy;

impl DumpStrategy for MariadbStrategy {
    fn engine(&self) -> &'static str {
        "mariadb"
    }

    // mariadb ships the mysqldump-compatible tool, so the argv is shared.
    fn command(&self, opts: &DumpOptions) -> Result<BackupCommand> {
        let user = opts.require("db.user", &opts.user, self.engine())?;
        let password = opts.require("db.password", &opts.password, self.engine())?;
        let database = opts.require("db.name", &opts.database, self.engine())?;
        BackupCommand::new(
            vec![],
            vec![
                "mysqldump".into(),
                "-u".into(),
                user,
                format!("-p{password}"),
                database,
            ],
        )
    }

    fn sniff_tokens(&self) -> &'static [&'static str] {
        &["mariadb dump", "mysql dump", "mysqldump", "create", "insert"]
    }
}

struct PostgresStrategy;

impl DumpStrategy for PostgresStrategy {
    fn engine(&self) -> &'static str {
        "postgres"
    }

    fn command(&self, opts: &DumpOptions) -> Result<BackupCommand> {
        let user = opts.require("db.user", &opts.user, self.engine())?;
        let password = opts.require("db.password", &opts.password, self.engine())?;
        let env = vec![format!("PGPASSWORD={password}")];
        if opts.all_databases {
            BackupCommand::new(env, vec!["pg_dumpall".into(), "-U".into(), user])
        } else {
            let database = opts.require("db.name", &opts.database, self.engine())?;
            BackupCommand::new(
                env,
                vec!["pg_dump".into(), "-U".into(), user, "-d".into(), database],
            )
        }
    }

    fn sniff_tokens(&self) -> &'static [&'static str] {
        &["postgresql database dump", "pg_dump", "create", "copy"]
    }
}

struct SqliteStrategy;

impl DumpStrategy for SqliteStrategy {
    fn engine(&self) -> &'static str {
        "sqlite"
    }

    fn command(&self, opts: &DumpOptions) -> Result<BackupCommand> {
        let database = opts.require("db.name", &opts.database, self.engine())?;
        BackupCommand::new(vec![], vec!["sqlite3".into(), database, ".dump".into()])
    }

    fn sniff_tokens(&self) -> &'static [&'static str] {
        &["sqlite", "pragma", "create", "insert"]
    }
}

struct MongoStrategy;

impl DumpStrategy for MongoStrategy {
    fn engine(&self) -> &'static str {
        "mongodb"
    }

    fn command(&self, opts: &DumpOptions) -> Result<BackupCommand> {
        let database = opts.require("db.name", &opts.database, self.engine())?;
        let mut cmd = vec!["mongodump".into(), "--db".into(), database];
        if let (Some(user), Some(password)) = (&opts.user, &opts.password) {
            cmd.push("--username".into());
            cmd.push(user.clone());
            cmd.push("--password".into());
            cmd.push(password.clone());
        }
        BackupCommand::new(vec![], cmd)
    }

    fn sniff_tokens(&self) -> &'static [&'static str] {
        &["mongodump", "bson", "collection"]
    }
}

/// Registry mapping engine names to dump strategies.
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn DumpStrategy>>,
}

impl StrategyRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    /// Registry with every built-in engine.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(MysqlStrategy));
        registry.register(Arc::new(MariadbStrategy));
        registry.register(Arc::new(PostgresStrategy));
        registry.register(Arc::new(SqliteStrategy));
        registry.register(Arc::new(MongoStrategy));
        registry
    }

    /// Register a strategy under its engine name. Idempotent: a later
    /// registration for the same name replaces the earlier one.
    pub fn register(&mut self, strategy: Arc<dyn DumpStrategy>) {
        self.strategies
            .insert(strategy.engine().to_string(), strategy);
    }

    /// Look up the strategy for an engine name.
    pub fn get(&self, engine: &str) -> Result<Arc<dyn DumpStrategy>> {
        self.strategies
            .get(engine)
            .cloned()
            .ok_or_else(|| Error::UnsupportedEngine(engine.to_string()))
    }

    pub fn supports(&self, engine: &str) -> bool {
        self.strategies.contains_key(engine)
    }

    /// Build the dump command for a typed engine.
    pub fn command_for(&self, engine: Engine, opts: &DumpOptions) -> Result<BackupCommand> {
        self.get(engine.as_str())?.command(opts)
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(user: &str, password: &str, database: &str) -> DumpOptions {
        DumpOptions {
            user: Some(user.into()),
            password: Some(password.into()),
            database: Some(database.into()),
            all_databases: false,
        }
    }

    #[test]
    fn test_mysql_command_shape() {
        let registry = StrategyRegistry::with_defaults();
        let command = registry
            .command_for(Engine::MySql, &opts("u", "p", "d"))
            .unwrap();
        assert_eq!(command.cmd, vec!["mysqldump", "-u", "u", "-pp", "d"]);
        assert!(command.env.is_empty());
    }

    #[test]
    fn test_postgres_single_database() {
        let registry = StrategyRegistry::with_defaults();
        let command = registry
            .command_for(Engine::Postgres, &opts("postgres", "pw", "appdb"))
            .unwrap();
        assert_eq!(command.env, vec!["PGPASSWORD=pw"]);
        assert_eq!(command.cmd, vec!["pg_dump", "-U", "postgres", "-d", "appdb"]);
    }

    #[test]
    fn test_postgres_all_databases() {
        let registry = StrategyRegistry::with_defaults();
        let command = registry
            .command_for(
                Engine::Postgres,
                &DumpOptions {
                    user: Some("pg".into()),
                    password: Some("pw".into()),
                    database: None,
                    all_databases: true,
                },
            )
            .unwrap();
        assert_eq!(command.env, vec!["PGPASSWORD=pw"]);
        assert_eq!(command.cmd, vec!["pg_dumpall", "-U", "pg"]);
    }

    #[test]
    fn test_sqlite_command_shape() {
        let registry = StrategyRegistry::with_defaults();
        let command = registry
            .command_for(
                Engine::Sqlite,
                &DumpOptions {
                    database: Some("app".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(command.cmd, vec!["sqlite3", "app", ".dump"]);
    }

    #[test]
    fn test_mongodb_credentials_optional() {
        let registry = StrategyRegistry::with_defaults();
        let command = registry
            .command_for(
                Engine::MongoDb,
                &DumpOptions {
                    database: Some("events".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(command.cmd, vec!["mongodump", "--db", "events"]);

        let command = registry
            .command_for(Engine::MongoDb, &opts("admin", "pw", "events"))
            .unwrap();
        assert_eq!(
            command.cmd,
            vec![
                "mongodump",
                "--db",
                "events",
                "--username",
                "admin",
                "--password",
                "pw"
            ]
        );
    }

    #[test]
    fn test_missing_required_options() {
        let registry = StrategyRegistry::with_defaults();
        let err = registry
            .command_for(Engine::MySql, &DumpOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_non_whitelisted_executable_rejected() {
        let err = BackupCommand::new(vec![], vec!["rm".into(), "-rf".into(), "tmp".into()])
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Security error: Command 'rm' is not allowed"
        );
    }

    #[test]
    fn test_forbidden_characters_rejected() {
        for bad in ["a;b", "a|b", "a`b", "a$b", "a(b)", "a<b", "a[b]"] {
            let result =
                BackupCommand::new(vec![], vec!["mysqldump".into(), bad.into()]);
            assert!(matches!(result, Err(Error::Security(_))), "accepted {bad}");
        }
    }

    #[test]
    fn test_path_escape_rejected() {
        assert!(matches!(
            BackupCommand::new(vec![], vec!["sqlite3".into(), "/data/app.db".into()]),
            Err(Error::Security(_))
        ));
        assert!(matches!(
            BackupCommand::new(vec![], vec!["sqlite3".into(), "../app.db".into()]),
            Err(Error::Security(_))
        ));
    }

    #[test]
    fn test_control_characters_rejected() {
        assert!(matches!(
            BackupCommand::new(vec![], vec!["mysqldump".into(), "a\x07b".into()]),
            Err(Error::Security(_))
        ));
        assert!(matches!(
            BackupCommand::new(vec!["PGPASSWORD=a\nb".into()], vec!["pg_dump".into()]),
            Err(Error::Security(_))
        ));
    }

    #[test]
    fn test_every_builtin_strategy_is_whitelisted() {
        let registry = StrategyRegistry::with_defaults();
        let all = opts("u", "p", "d");
        for engine in [
            Engine::MySql,
            Engine::MariaDb,
            Engine::Postgres,
            Engine::Sqlite,
            Engine::MongoDb,
        ] {
            let command = registry.command_for(engine, &all).unwrap();
            assert!(COMMAND_WHITELIST.contains(&command.cmd[0].as_str()));
        }
    }

    #[test]
    fn test_sniff_matches_head_lines() {
        let registry = StrategyRegistry::with_defaults();
        let postgres = registry.get("postgres").unwrap();
        let head = vec![
            "-- postgresql database dump".to_string(),
            "set statement_timeout = 0".to_string(),
        ];
        assert!(postgres.sniff(&head));
        assert!(!postgres.sniff(&["binary garbage".to_string()]));
    }

    #[test]
    fn test_unknown_engine() {
        let registry = StrategyRegistry::with_defaults();
        assert!(matches!(
            registry.get("oracle"),
            Err(Error::UnsupportedEngine(_))
        ));
        assert!(!registry.supports("custom"));
    }

    #[test]
    fn test_registration_is_idempotent() {
        let mut registry = StrategyRegistry::with_defaults();
        registry.register(Arc::new(SqliteStrategy));
        registry.register(Arc::new(SqliteStrategy));
        assert!(registry.supports("sqlite"));
    }
}
