use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BackupError;

/// Every artifact file name starts with this prefix.
pub const ARTIFACT_PREFIX: &str = "backup_";

/// Suffix appended to an artifact's file name to form its sidecar.
pub const SIDECAR_SUFFIX: &str = ".meta.json";

const COMPRESSED_SQL_EXTENSION: &str = ".sql.zst";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BackupFormat {
    /// Plain SQL script, replayed with psql.
    Sql,
    /// pg_dump custom archive, compressed by pg_dump itself.
    Custom,
    /// pg_dump directory archive, dumped and restored in parallel.
    Directory,
    Tar,
}

impl BackupFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            BackupFormat::Sql => "sql",
            BackupFormat::Custom => "custom",
            BackupFormat::Directory => "directory",
            BackupFormat::Tar => "tar",
        }
    }

    /// File extension for a fresh artifact, before any post-compression.
    pub fn extension(self) -> &'static str {
        match self {
            BackupFormat::Sql => ".sql",
            BackupFormat::Custom => ".dump",
            BackupFormat::Directory => "",
            BackupFormat::Tar => ".tar",
        }
    }

    /// Infers the format of an existing artifact from its shape on disk.
    ///
    /// Returns the format and whether the artifact is a zstd-compressed SQL
    /// script. Used when an artifact is restored without its sidecar.
    pub fn detect(path: &Path) -> (BackupFormat, bool) {
        if path.is_dir() {
            return (BackupFormat::Directory, false);
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if name.ends_with(COMPRESSED_SQL_EXTENSION) {
            (BackupFormat::Sql, true)
        } else if name.ends_with(".sql") {
            (BackupFormat::Sql, false)
        } else if name.ends_with(".tar") {
            (BackupFormat::Tar, false)
        } else {
            (BackupFormat::Custom, false)
        }
    }
}

impl fmt::Display for BackupFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupFormat {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sql" | "plain" => Ok(BackupFormat::Sql),
            "custom" | "dump" => Ok(BackupFormat::Custom),
            "directory" | "dir" => Ok(BackupFormat::Directory),
            "tar" => Ok(BackupFormat::Tar),
            other => Err(BackupError::config(format!(
                "unknown backup format {other:?} (expected sql, custom, directory or tar)"
            ))),
        }
    }
}

/// File name of a new artifact: `backup_<db>[_<label>]_<YYYYmmdd_HHMMSS><ext>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactName {
    stem: String,
    format: BackupFormat,
}

impl ArtifactName {
    pub fn new(
        database: &str,
        label: Option<&str>,
        format: BackupFormat,
        created_at: DateTime<Utc>,
    ) -> Result<Self, BackupError> {
        if database.is_empty() {
            return Err(BackupError::config("database name is empty"));
        }
        let timestamp = format_timestamp(created_at);
        let stem = match label {
            Some(label) => {
                validate_label(label)?;
                format!("{ARTIFACT_PREFIX}{database}_{label}_{timestamp}")
            }
            None => format!("{ARTIFACT_PREFIX}{database}_{timestamp}"),
        };
        Ok(Self { stem, format })
    }

    pub fn stem(&self) -> &str {
        &self.stem
    }

    pub fn format(&self) -> BackupFormat {
        self.format
    }

    pub fn file_name(&self) -> String {
        format!("{}{}", self.stem, self.format.extension())
    }
}

impl fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

fn validate_label(label: &str) -> Result<(), BackupError> {
    let valid = !label.is_empty()
        && label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(BackupError::config(format!(
            "invalid backup name {label:?}: use letters, digits, '-' or '_'"
        )))
    }
}

fn format_timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d_%H%M%S").to_string()
}

/// Contents of an artifact's `.meta.json` sidecar.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupMetadata {
    pub id: Uuid,
    pub filename: String,
    pub format: BackupFormat,
    #[serde(default)]
    pub label: Option<String>,
    pub size_bytes: u64,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
    pub database_name: String,
    #[serde(default)]
    pub database_version: Option<String>,
    #[serde(default)]
    pub compressed: bool,
}

/// Everything the caller knows about an artifact before it is checksummed.
#[derive(Debug, Clone)]
pub struct NewBackupMetadata {
    pub format: BackupFormat,
    pub label: Option<String>,
    pub created_at: DateTime<Utc>,
    pub database_name: String,
    pub database_version: Option<String>,
    pub compressed: bool,
}

impl NewBackupMetadata {
    pub fn into_metadata(self, filename: String, size_bytes: u64, checksum: String) -> BackupMetadata {
        BackupMetadata {
            id: Uuid::new_v4(),
            filename,
            format: self.format,
            label: self.label,
            size_bytes,
            checksum,
            created_at: self.created_at,
            database_name: self.database_name,
            database_version: self.database_version,
            compressed: self.compressed,
        }
    }
}

/// An artifact on disk paired with its sidecar metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupArtifact {
    pub path: PathBuf,
    pub metadata: BackupMetadata,
}

impl BackupArtifact {
    pub fn file_name(&self) -> &str {
        &self.metadata.filename
    }

    pub fn sidecar_path(&self) -> PathBuf {
        sidecar_path(&self.path)
    }
}

/// Path of the sidecar belonging to `artifact`.
pub fn sidecar_path(artifact: &Path) -> PathBuf {
    let mut name = artifact
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(SIDECAR_SUFFIX);
    artifact.with_file_name(name)
}

/// Where a plain SQL script lands once zstd-compressed: `<name>.zst`.
pub fn compressed_path(plain: &Path) -> PathBuf {
    let mut name = plain
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".zst");
    plain.with_file_name(name)
}

/// True for names that look like artifacts rather than sidecars or strays.
pub fn is_artifact_name(name: &str) -> bool {
    name.starts_with(ARTIFACT_PREFIX) && !name.ends_with(SIDECAR_SUFFIX)
}
