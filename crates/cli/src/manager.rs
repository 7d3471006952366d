use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use pg_backup_core::{
    ArtifactName, BackupArtifact, BackupError, BackupFormat, NewBackupMetadata, RetentionPolicy,
};
use pg_backup_storage::{
    BackupRepository, ChecksumReport, CleanupReport, Listing, RepositoryInfo,
};
use pg_backup_tools::{codec, PgTools};
use tracing::{info, warn};

use crate::config::Settings;

/// Label carried by backups made through [`BackupManager::run_scheduled`].
pub const SCHEDULED_LABEL: &str = "scheduled";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreOptions {
    pub drop_and_recreate: bool,
    pub verify_first: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            drop_and_recreate: false,
            verify_first: true,
        }
    }
}

/// What a restore is about to do, shown to the operator before confirming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestorePlan {
    pub source: PathBuf,
    pub database: String,
    pub drop_and_recreate: bool,
    pub verified: bool,
}

/// Outcome of the scheduled create + verify + cleanup sequence.
#[derive(Debug, Clone)]
pub struct ScheduledRun {
    pub artifact: BackupArtifact,
    pub cleanup: CleanupReport,
    pub info: RepositoryInfo,
}

/// Ties the backups directory to the PostgreSQL tools.
#[derive(Debug, Clone)]
pub struct BackupManager {
    settings: Settings,
    repo: BackupRepository,
}

impl BackupManager {
    pub fn new(settings: Settings) -> Result<Self> {
        let repo = BackupRepository::open(&settings.backup_dir)?;
        Ok(Self { settings, repo })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn repository(&self) -> &BackupRepository {
        &self.repo
    }

    fn tools(&self) -> Result<PgTools> {
        let conn = self.settings.connection()?;
        Ok(PgTools::new(conn, self.settings.tools.clone()))
    }

    pub fn create(&self, label: Option<&str>, format: Option<BackupFormat>) -> Result<BackupArtifact> {
        self.create_at(label, format, Utc::now())
    }

    /// Dumps the database into a new artifact named after `now`.
    ///
    /// Partial output of a failed dump is removed; nothing else is touched.
    pub fn create_at(
        &self,
        label: Option<&str>,
        format: Option<BackupFormat>,
        now: DateTime<Utc>,
    ) -> Result<BackupArtifact> {
        let tools = self.tools()?;
        let format = format.unwrap_or(self.settings.format);
        let database = tools.connection().database.clone();
        let name = ArtifactName::new(&database, label, format, now)?;
        let compressed = format == BackupFormat::Sql && self.settings.compress_sql;
        let path = self.repo.allocate(&name, compressed)?;

        info!(artifact = %name, "starting database backup");
        if let Err(e) = tools.dump(&path, format, &self.settings.dump) {
            self.discard_partial(&path);
            return Err(e);
        }

        let path = if compressed {
            let level = self.settings.dump.compression_level as i32;
            match codec::compress_sql(&path, level) {
                Ok(packed) => packed,
                Err(e) => {
                    self.discard_partial(&path);
                    return Err(e);
                }
            }
        } else {
            path
        };

        let database_version = tools.server_version();
        let sealed = self.repo.seal(
            &path,
            NewBackupMetadata {
                format,
                label: label.map(str::to_owned),
                created_at: now,
                database_name: database,
                database_version,
                compressed,
            },
        );
        let artifact = match sealed {
            Ok(artifact) => artifact,
            Err(e) => {
                // an artifact without a sidecar is never listed or cleaned up
                self.discard_partial(&path);
                return Err(e);
            }
        };
        info!(artifact = %artifact.path.display(), "backup created");
        Ok(artifact)
    }

    fn discard_partial(&self, path: &Path) {
        match self.repo.discard(path) {
            Ok(true) => warn!(path = %path.display(), "removed partial backup output"),
            Ok(false) => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not remove partial backup output")
            }
        }
    }

    pub fn list(&self) -> Result<Listing> {
        self.repo.list()
    }

    pub fn check(&self, path: &Path) -> Result<ChecksumReport> {
        self.repo.check(path)
    }

    pub fn verify(&self, path: &Path) -> Result<bool> {
        self.repo.verify(path)
    }

    /// Restores an artifact into the configured database.
    ///
    /// Order: checksum (unless disabled), confirmation, optional drop and
    /// recreate, restore tool. Nothing touches the database before `confirm`
    /// returns `true`.
    pub fn restore<F>(&self, path: &Path, opts: RestoreOptions, confirm: F) -> Result<PathBuf>
    where
        F: FnOnce(&RestorePlan) -> bool,
    {
        let tools = self.tools()?;
        let source = self.repo.resolve(path)?;

        let artifact = if opts.verify_first {
            let artifact = self.repo.load(&source)?;
            self.repo.check(&artifact.path)?.ensure_valid()?;
            info!(artifact = %source.display(), "backup integrity verified");
            Some(artifact)
        } else {
            match self.repo.load(&source) {
                Ok(artifact) => Some(artifact),
                Err(e) => {
                    warn!(artifact = %source.display(), error = %e, "restoring without metadata");
                    None
                }
            }
        };
        let (format, compressed) = match &artifact {
            Some(a) => (a.metadata.format, a.metadata.compressed),
            None => BackupFormat::detect(&source),
        };

        let plan = RestorePlan {
            source: source.clone(),
            database: tools.connection().database.clone(),
            drop_and_recreate: opts.drop_and_recreate,
            verified: opts.verify_first,
        };
        if !confirm(&plan) {
            info!("restore cancelled");
            return Err(BackupError::UserAborted.into());
        }

        if opts.drop_and_recreate {
            warn!(database = %plan.database, "dropping existing database");
            tools.drop_database()?;
            tools.create_database()?;
        }
        tools.restore(&source, format, compressed, &self.settings.dump)?;
        info!(artifact = %source.display(), database = %plan.database, "database restored");
        Ok(source)
    }

    /// Applies the configured retention policy at the current time.
    pub fn cleanup(&self) -> Result<CleanupReport> {
        self.cleanup_with(&self.settings.retention, Utc::now())
    }

    pub fn cleanup_with(&self, policy: &RetentionPolicy, now: DateTime<Utc>) -> Result<CleanupReport> {
        self.repo.cleanup(policy, now)
    }

    pub fn info(&self) -> Result<RepositoryInfo> {
        self.repo.info()
    }

    /// Create, verify and clean up in one call. This is what cron invokes.
    pub fn run_scheduled(&self) -> Result<ScheduledRun> {
        info!("starting scheduled backup");
        let artifact = self.create(Some(SCHEDULED_LABEL), None)?;
        self.repo.check(&artifact.path)?.ensure_valid()?;
        info!(artifact = %artifact.file_name(), "backup verified");
        let cleanup = self.cleanup()?;
        let info = self.info()?;
        info!(
            artifact = %artifact.file_name(),
            removed = cleanup.count(),
            total_backups = info.count,
            total_bytes = info.total_bytes,
            "scheduled backup completed"
        );
        Ok(ScheduledRun {
            artifact,
            cleanup,
            info,
        })
    }
}
