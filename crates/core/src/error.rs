use std::path::PathBuf;

use thiserror::Error;

/// Failure kinds surfaced to the operator.
///
/// Operations return `anyhow::Result`; these variants travel inside the
/// `anyhow::Error` and callers recover them with `downcast_ref`.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("{tool} failed{}: {stderr}", exit_suffix(.code))]
    ExternalTool {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("checksum mismatch for {}: expected {expected}, got {actual}", .path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("backup artifact not found: {}", .0.display())]
    ArtifactNotFound(PathBuf),

    #[error("backup artifact already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("operation aborted by user")]
    UserAborted,
}

fn exit_suffix(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" (exit code {code})"),
        None => String::new(),
    }
}

impl BackupError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Process exit code reported by the CLI for this kind of failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 2,
            Self::ExternalTool { .. } => 3,
            Self::ChecksumMismatch { .. } => 4,
            Self::ArtifactNotFound(_) => 5,
            Self::UserAborted => 6,
            Self::AlreadyExists(_) => 7,
        }
    }
}

/// Exit code for an arbitrary error, `1` when it is not a [`BackupError`].
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<BackupError>()
        .map(BackupError::exit_code)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_tool_message_includes_stderr_and_code() {
        let err = BackupError::ExternalTool {
            tool: "pg_dump".to_owned(),
            code: Some(1),
            stderr: "connection refused".to_owned(),
        };
        assert_eq!(
            err.to_string(),
            "pg_dump failed (exit code 1): connection refused"
        );
    }

    #[test]
    fn exit_code_survives_anyhow_context() {
        let err = anyhow::Error::from(BackupError::UserAborted).context("restore");
        assert_eq!(exit_code_for(&err), 6);

        let other = anyhow::anyhow!("boom");
        assert_eq!(exit_code_for(&other), 1);
    }
}
