use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use pg_backup_core::{BackupError, BackupFormat, RetentionPolicy};
use pg_backup_tools::{ConnectionSettings, DumpOptions, ToolPaths};
use serde::Deserialize;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub backup: BackupConfig,
    pub retention: RetentionConfig,
    pub tools: ToolPaths,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct BackupConfig {
    pub dir: Option<String>,
    pub format: Option<String>,
    pub compression_level: Option<u32>,
    pub parallel_jobs: Option<u32>,
    pub compress_sql: Option<bool>,
    pub verbose: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct RetentionConfig {
    pub days: Option<i64>,
    pub mode: Option<String>,
    pub keep_daily: Option<u32>,
    pub keep_weekly: Option<u32>,
    pub keep_monthly: Option<u32>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading config file {path:?}"))?;
    toml::from_str(&contents)
        .map_err(|e| BackupError::config(format!("parsing config file {path:?}: {e}")).into())
}

/// Database coordinates after env overrides. Name and user stay optional
/// until an operation actually needs the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseSettings {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub name: Option<String>,
}

/// Fully resolved configuration: file values overlaid with environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub backup_dir: PathBuf,
    pub format: BackupFormat,
    pub dump: DumpOptions,
    pub compress_sql: bool,
    pub retention: RetentionPolicy,
    pub tools: ToolPaths,
}

impl Settings {
    pub fn from_env(cfg: Config) -> Result<Self> {
        Self::resolve(cfg, |key| env::var(key).ok())
    }

    /// Resolves `cfg` with `lookup` as the environment.
    pub fn resolve(cfg: Config, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let port = match lookup("DATABASE_PORT") {
            Some(raw) => parse_env("DATABASE_PORT", &raw)?,
            None => cfg.database.port.unwrap_or(5432),
        };
        let database = DatabaseSettings {
            host: lookup("DATABASE_HOST")
                .or(cfg.database.host)
                .unwrap_or_else(|| "localhost".to_owned()),
            port,
            user: lookup("DATABASE_USER").or(cfg.database.user),
            password: lookup("DATABASE_PASSWORD").or(cfg.database.password),
            name: lookup("DATABASE_NAME").or(cfg.database.name),
        };

        let backup_dir = lookup("PG_BACKUP_DIR")
            .or(cfg.backup.dir)
            .unwrap_or_else(|| "backups".to_owned());

        let format = match lookup("PG_BACKUP_FORMAT").or(cfg.backup.format) {
            Some(raw) => raw.parse()?,
            None => BackupFormat::Custom,
        };

        let compression_level = match lookup("PG_BACKUP_COMPRESSION_LEVEL") {
            Some(raw) => parse_env("PG_BACKUP_COMPRESSION_LEVEL", &raw)?,
            None => cfg.backup.compression_level.unwrap_or(6),
        };
        if compression_level > 9 {
            return Err(BackupError::config(format!(
                "compression_level must be between 0 and 9, got {compression_level}"
            ))
            .into());
        }

        let parallel_jobs = match lookup("PG_BACKUP_PARALLEL_JOBS") {
            Some(raw) => parse_env("PG_BACKUP_PARALLEL_JOBS", &raw)?,
            None => cfg.backup.parallel_jobs.unwrap_or(4),
        };
        if !(1..=16).contains(&parallel_jobs) {
            return Err(BackupError::config(format!(
                "parallel_jobs must be between 1 and 16, got {parallel_jobs}"
            ))
            .into());
        }

        let retention_days = match lookup("PG_BACKUP_RETENTION_DAYS") {
            Some(raw) => Some(parse_env("PG_BACKUP_RETENTION_DAYS", &raw)?),
            None => cfg.retention.days,
        };
        let retention = retention_policy(&cfg.retention, retention_days)?;

        Ok(Self {
            database,
            backup_dir: PathBuf::from(backup_dir),
            format,
            dump: DumpOptions {
                compression_level,
                parallel_jobs,
                verbose: cfg.backup.verbose.unwrap_or(false),
            },
            compress_sql: cfg.backup.compress_sql.unwrap_or(false),
            retention,
            tools: cfg.tools,
        })
    }

    /// Connection parameters for the external tools.
    pub fn connection(&self) -> Result<ConnectionSettings, BackupError> {
        let name = self.database.name.clone().ok_or_else(|| {
            BackupError::config("database name is not set (DATABASE_NAME or [database] name)")
        })?;
        let user = self.database.user.clone().ok_or_else(|| {
            BackupError::config("database user is not set (DATABASE_USER or [database] user)")
        })?;
        Ok(ConnectionSettings {
            host: self.database.host.clone(),
            port: self.database.port,
            user,
            password: self.database.password.clone(),
            database: name,
        })
    }
}

fn retention_policy(cfg: &RetentionConfig, days: Option<i64>) -> Result<RetentionPolicy> {
    match cfg.mode.as_deref().unwrap_or("max-age") {
        "max-age" => {
            let days = days.unwrap_or(7);
            if days < 0 {
                return Err(BackupError::config(format!(
                    "retention days must not be negative, got {days}"
                ))
                .into());
            }
            Ok(RetentionPolicy::max_age_days(days))
        }
        "tiered" if days.is_some() => Err(BackupError::config(
            "retention days (PG_BACKUP_RETENTION_DAYS or [retention] days) only apply to mode max-age",
        )
        .into()),
        "tiered" => Ok(RetentionPolicy::Tiered {
            keep_daily: cfg.keep_daily.unwrap_or(7),
            keep_weekly: cfg.keep_weekly.unwrap_or(4),
            keep_monthly: cfg.keep_monthly.unwrap_or(6),
        }),
        other => Err(BackupError::config(format!(
            "unknown retention mode {other:?} (expected max-age or tiered)"
        ))
        .into()),
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| BackupError::config(format!("{key} has an invalid value: {raw:?}")).into())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn kind(err: &anyhow::Error) -> &BackupError {
        err.downcast_ref::<BackupError>().expect("backup error")
    }

    #[test]
    fn defaults_without_file_or_env() {
        let settings = Settings::resolve(Config::default(), env_of(&[])).expect("settings");
        assert_eq!(settings.database.host, "localhost");
        assert_eq!(settings.database.port, 5432);
        assert_eq!(settings.backup_dir, PathBuf::from("backups"));
        assert_eq!(settings.format, BackupFormat::Custom);
        assert_eq!(settings.dump, DumpOptions::default());
        assert!(!settings.compress_sql);
        assert_eq!(settings.retention, RetentionPolicy::max_age_days(7));
        assert_eq!(settings.tools, ToolPaths::default());
    }

    #[test]
    fn env_overrides_file() {
        let cfg: Config = toml::from_str(
            r#"
            [database]
            host = "db.internal"
            port = 5433
            user = "backup"
            name = "shop"

            [backup]
            dir = "/srv/backups"
            format = "directory"
            parallel_jobs = 8

            [retention]
            days = 30

            [tools]
            pg_dump = "/opt/pg16/bin/pg_dump"
            "#,
        )
        .expect("toml");

        let settings = Settings::resolve(
            cfg,
            env_of(&[
                ("DATABASE_NAME", "shop_staging"),
                ("PG_BACKUP_FORMAT", "sql"),
                ("PG_BACKUP_RETENTION_DAYS", "14"),
            ]),
        )
        .expect("settings");

        let conn = settings.connection().expect("connection");
        assert_eq!(conn.host, "db.internal");
        assert_eq!(conn.port, 5433);
        assert_eq!(conn.database, "shop_staging");
        assert_eq!(settings.backup_dir, PathBuf::from("/srv/backups"));
        assert_eq!(settings.format, BackupFormat::Sql);
        assert_eq!(settings.dump.parallel_jobs, 8);
        assert_eq!(settings.retention, RetentionPolicy::max_age_days(14));
        assert_eq!(settings.tools.pg_dump, PathBuf::from("/opt/pg16/bin/pg_dump"));
        assert_eq!(settings.tools.psql, PathBuf::from("psql"));
    }

    #[test]
    fn missing_connection_settings_are_config_errors() {
        let settings = Settings::resolve(Config::default(), env_of(&[("DATABASE_USER", "u")]))
            .expect("settings");
        let err = settings.connection().unwrap_err();
        assert!(matches!(err, BackupError::Config(_)));
        assert!(err.to_string().contains("DATABASE_NAME"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        for pairs in [
            [("DATABASE_PORT", "not-a-port")],
            [("PG_BACKUP_FORMAT", "zip")],
            [("PG_BACKUP_COMPRESSION_LEVEL", "12")],
            [("PG_BACKUP_PARALLEL_JOBS", "0")],
            [("PG_BACKUP_RETENTION_DAYS", "-1")],
        ] {
            let err = Settings::resolve(Config::default(), env_of(&pairs)).unwrap_err();
            assert!(matches!(kind(&err), BackupError::Config(_)), "{pairs:?}");
        }
    }

    #[test]
    fn tiered_retention_from_file() {
        let cfg: Config = toml::from_str(
            r#"
            [retention]
            mode = "tiered"
            keep_weekly = 8
            "#,
        )
        .expect("toml");
        let settings = Settings::resolve(cfg, env_of(&[])).expect("settings");
        assert_eq!(
            settings.retention,
            RetentionPolicy::Tiered {
                keep_daily: 7,
                keep_weekly: 8,
                keep_monthly: 6
            }
        );
    }

    #[test]
    fn tiered_retention_rejects_a_day_limit() {
        let tiered = || -> Config {
            toml::from_str("[retention]\nmode = \"tiered\"\n").expect("toml")
        };
        let err = Settings::resolve(tiered(), env_of(&[("PG_BACKUP_RETENTION_DAYS", "14")]))
            .unwrap_err();
        assert!(matches!(kind(&err), BackupError::Config(_)));

        let mut cfg = tiered();
        cfg.retention.days = Some(30);
        let err = Settings::resolve(cfg, env_of(&[])).unwrap_err();
        assert!(err.to_string().contains("max-age"));
    }
}
