use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pg_backup_core::{
    artifact_hash, artifact_size, compressed_path, is_artifact_name, sidecar_path, ArtifactName,
    BackupArtifact, BackupError, BackupMetadata, NewBackupMetadata, RetentionPolicy,
};
use tracing::{debug, info, warn};

/// The backups directory: artifacts plus one `.meta.json` sidecar each.
#[derive(Debug, Clone)]
pub struct BackupRepository {
    dir: PathBuf,
}

/// Stored versus recomputed digest of one artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumReport {
    pub path: PathBuf,
    pub expected: String,
    pub actual: String,
}

impl ChecksumReport {
    pub fn is_valid(&self) -> bool {
        self.expected == self.actual
    }

    /// Converts a mismatch into [`BackupError::ChecksumMismatch`].
    pub fn ensure_valid(self) -> Result<(), BackupError> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(BackupError::ChecksumMismatch {
                path: self.path,
                expected: self.expected,
                actual: self.actual,
            })
        }
    }
}

/// Known artifacts, newest first. Iterate it as many times as needed.
#[derive(Debug, Clone, Default)]
pub struct Listing {
    artifacts: Vec<BackupArtifact>,
}

impl Listing {
    pub fn iter(&self) -> std::slice::Iter<'_, BackupArtifact> {
        self.artifacts.iter()
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn info(&self) -> RepositoryInfo {
        RepositoryInfo {
            count: self.artifacts.len(),
            total_bytes: self.artifacts.iter().map(|a| a.metadata.size_bytes).sum(),
            oldest: self.artifacts.iter().map(|a| a.metadata.created_at).min(),
            newest: self.artifacts.iter().map(|a| a.metadata.created_at).max(),
        }
    }
}

impl IntoIterator for Listing {
    type Item = BackupArtifact;
    type IntoIter = std::vec::IntoIter<BackupArtifact>;

    fn into_iter(self) -> Self::IntoIter {
        self.artifacts.into_iter()
    }
}

impl<'a> IntoIterator for &'a Listing {
    type Item = &'a BackupArtifact;
    type IntoIter = std::slice::Iter<'a, BackupArtifact>;

    fn into_iter(self) -> Self::IntoIter {
        self.artifacts.iter()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: Vec<String>,
}

impl CleanupReport {
    pub fn count(&self) -> usize {
        self.removed.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryInfo {
    pub count: usize,
    pub total_bytes: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

impl BackupRepository {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("create backups directory: {}", dir.display()))?;
        debug!(dir = %dir.display(), "opened backup repository");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reserves the path pg_dump writes to for a new artifact.
    ///
    /// Fails rather than reuse a name that already has an artifact or sidecar.
    /// With `compressed`, the `.zst` the dump ends up as is checked as well.
    pub fn allocate(&self, name: &ArtifactName, compressed: bool) -> Result<PathBuf> {
        let path = self.dir.join(name.file_name());
        let mut taken = vec![path.clone()];
        if compressed {
            taken.push(compressed_path(&path));
        }
        for candidate in taken {
            if exists(&candidate) || exists(&sidecar_path(&candidate)) {
                return Err(BackupError::AlreadyExists(candidate).into());
            }
        }
        Ok(path)
    }

    /// Checksums a freshly written artifact and writes its sidecar.
    pub fn seal(&self, path: &Path, draft: NewBackupMetadata) -> Result<BackupArtifact> {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("artifact path has no file name: {}", path.display()))?;
        let checksum = artifact_hash(path)?;
        let size_bytes = artifact_size(path)?;
        let metadata = draft.into_metadata(filename, size_bytes, checksum);

        let sidecar = sidecar_path(path);
        let file = match OpenOptions::new().write(true).create_new(true).open(&sidecar) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(BackupError::AlreadyExists(sidecar).into());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("create sidecar: {}", sidecar.display()));
            }
        };
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &metadata).context("serialize backup metadata")?;
        writer
            .flush()
            .with_context(|| format!("write sidecar: {}", sidecar.display()))?;

        info!(
            artifact = %metadata.filename,
            size_bytes = metadata.size_bytes,
            checksum = %metadata.checksum,
            "sealed backup artifact"
        );
        Ok(BackupArtifact {
            path: path.to_path_buf(),
            metadata,
        })
    }

    /// Accepts a path as given, or a bare file name inside the backups directory.
    pub fn resolve(&self, path: &Path) -> Result<PathBuf> {
        if exists(path) {
            return Ok(path.to_path_buf());
        }
        if path.is_relative() {
            let candidate = self.dir.join(path);
            if exists(&candidate) {
                return Ok(candidate);
            }
        }
        Err(BackupError::ArtifactNotFound(path.to_path_buf()).into())
    }

    pub fn load(&self, path: &Path) -> Result<BackupArtifact> {
        let path = self.resolve(path)?;
        let sidecar = sidecar_path(&path);
        if !exists(&sidecar) {
            return Err(BackupError::ArtifactNotFound(sidecar).into());
        }
        let metadata = read_metadata(&sidecar)?;
        Ok(BackupArtifact { path, metadata })
    }

    /// Recomputes the digest of an artifact and pairs it with the stored one.
    pub fn check(&self, path: &Path) -> Result<ChecksumReport> {
        let artifact = self.load(path)?;
        let actual = artifact_hash(&artifact.path)?;
        Ok(ChecksumReport {
            path: artifact.path,
            expected: artifact.metadata.checksum,
            actual,
        })
    }

    pub fn verify(&self, path: &Path) -> Result<bool> {
        let report = self.check(path)?;
        if report.is_valid() {
            info!(artifact = %report.path.display(), "backup integrity verified");
        } else {
            warn!(
                artifact = %report.path.display(),
                expected = %report.expected,
                actual = %report.actual,
                "checksum mismatch"
            );
        }
        Ok(report.is_valid())
    }

    pub fn list(&self) -> Result<Listing> {
        let mut artifacts = Vec::new();
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("read backups directory: {}", self.dir.display()))?;
        for entry in entries {
            let entry = entry.context("read backups directory entry")?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !is_artifact_name(name) {
                continue;
            }
            let path = entry.path();
            let sidecar = sidecar_path(&path);
            if !exists(&sidecar) {
                debug!(artifact = name, "skipping artifact without sidecar");
                continue;
            }
            match read_metadata(&sidecar) {
                Ok(metadata) => artifacts.push(BackupArtifact { path, metadata }),
                Err(e) => warn!(artifact = name, error = %e, "skipping unreadable sidecar"),
            }
        }
        artifacts.sort_by(|a, b| {
            b.metadata
                .created_at
                .cmp(&a.metadata.created_at)
                .then_with(|| b.metadata.filename.cmp(&a.metadata.filename))
        });
        Ok(Listing { artifacts })
    }

    /// Deletes every artifact the policy marks as expired at `now`.
    pub fn cleanup(&self, policy: &RetentionPolicy, now: DateTime<Utc>) -> Result<CleanupReport> {
        let listing = self.list()?;
        let created: Vec<_> = listing.iter().map(|a| a.metadata.created_at).collect();
        let mut report = CleanupReport::default();
        for index in policy.expired(&created, now) {
            let artifact = &listing.artifacts[index];
            if self.remove(artifact)? {
                report.removed.push(artifact.metadata.filename.clone());
            }
        }
        info!(removed = report.count(), "retention cleanup finished");
        Ok(report)
    }

    /// Removes an artifact, then its sidecar. Returns whether the artifact existed.
    pub fn remove(&self, artifact: &BackupArtifact) -> Result<bool> {
        let existed = self.discard(&artifact.path)?;
        let sidecar = artifact.sidecar_path();
        if exists(&sidecar) {
            fs::remove_file(&sidecar)
                .with_context(|| format!("remove sidecar: {}", sidecar.display()))?;
        }
        if existed {
            info!(artifact = %artifact.metadata.filename, "deleted old backup");
        }
        Ok(existed)
    }

    /// Removes whatever sits at `path` without touching any sidecar.
    ///
    /// Used for partial output of a failed dump.
    pub fn discard(&self, path: &Path) -> Result<bool> {
        let Ok(meta) = fs::symlink_metadata(path) else {
            return Ok(false);
        };
        if meta.is_dir() {
            fs::remove_dir_all(path)
                .with_context(|| format!("remove directory: {}", path.display()))?;
        } else {
            fs::remove_file(path).with_context(|| format!("remove file: {}", path.display()))?;
        }
        Ok(true)
    }

    pub fn info(&self) -> Result<RepositoryInfo> {
        Ok(self.list()?.info())
    }
}

fn exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

fn read_metadata(sidecar: &Path) -> Result<BackupMetadata> {
    let raw = fs::read_to_string(sidecar)
        .with_context(|| format!("read sidecar: {}", sidecar.display()))?;
    let metadata = serde_json::from_str(&raw)
        .with_context(|| format!("parse sidecar: {}", sidecar.display()))?;
    Ok(metadata)
}
