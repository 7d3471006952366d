pub mod backup;
pub mod error;
pub mod hash;
pub mod retention;
pub mod units;

pub use backup::{
    compressed_path, is_artifact_name, sidecar_path, ArtifactName, BackupArtifact, BackupFormat,
    BackupMetadata, NewBackupMetadata, ARTIFACT_PREFIX, SIDECAR_SUFFIX,
};
pub use error::{exit_code_for, BackupError};
pub use hash::{artifact_hash, artifact_size, file_hash, tree_hash};
pub use retention::RetentionPolicy;
pub use units::format_size;
