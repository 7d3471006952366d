//! zstd wrapping for plain SQL dumps.

use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use pg_backup_core::{compressed_path, BackupError};
use tracing::info;

/// Replaces `dump.sql` by `dump.sql.zst` and returns the new path.
///
/// Never overwrites an existing `.zst`. The plain script is only removed once
/// the compressed copy is complete.
pub fn compress_sql(path: &Path, level: i32) -> Result<PathBuf> {
    let target = compressed_path(path);
    let input = crate::open(path)?;
    let output = match OpenOptions::new().write(true).create_new(true).open(&target) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            return Err(BackupError::AlreadyExists(target).into());
        }
        Err(e) => return Err(e).with_context(|| format!("create {}", target.display())),
    };
    let mut writer = BufWriter::new(output);
    zstd::stream::copy_encode(input, &mut writer, level)
        .with_context(|| format!("compress {}", path.display()))?;
    writer
        .flush()
        .with_context(|| format!("write {}", target.display()))?;
    drop(writer);

    fs::remove_file(path).with_context(|| format!("remove {}", path.display()))?;
    info!(from = %path.display(), to = %target.display(), "compressed sql dump");
    Ok(target)
}

/// Streams the decoded contents of a `.zst` file into `dest`.
pub fn decode_into<W: Write>(path: &Path, dest: &mut W) -> Result<()> {
    let input = crate::open(path)?;
    zstd::stream::copy_decode(input, dest)?;
    Ok(())
}
