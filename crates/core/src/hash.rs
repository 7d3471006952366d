use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

/// Hashes an artifact, whichever shape it has on disk.
pub fn artifact_hash(path: &Path) -> Result<String> {
    if path.is_dir() {
        tree_hash(path)
    } else {
        file_hash(path)
    }
}

/// Streams a single file through SHA-256.
pub fn file_hash(path: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    stream_into(&mut hasher, path)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Hashes every regular file under `root` in relative-path order.
///
/// Each relative path is bound into the digest ahead of its bytes so that
/// renaming or moving a file changes the result.
pub fn tree_hash(root: &Path) -> Result<String> {
    let mut files = Vec::<PathBuf>::new();
    for entry in walkdir::WalkDir::new(root).follow_links(false) {
        let entry = entry.with_context(|| format!("walk {}", root.display()))?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    files.sort_by(|a, b| {
        a.strip_prefix(root)
            .unwrap_or(a)
            .as_os_str()
            .cmp(b.strip_prefix(root).unwrap_or(b).as_os_str())
    });

    let mut hasher = Sha256::new();
    for path in files {
        let rel = path.strip_prefix(root).unwrap_or(&path);
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        stream_into(&mut hasher, &path)?;
        hasher.update([0u8]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Total size in bytes of a file, or of every regular file under a directory.
pub fn artifact_size(path: &Path) -> Result<u64> {
    if !path.is_dir() {
        let meta = path
            .metadata()
            .with_context(|| format!("stat {}", path.display()))?;
        return Ok(meta.len());
    }
    let mut total = 0;
    for entry in walkdir::WalkDir::new(path).follow_links(false) {
        let entry = entry.with_context(|| format!("walk {}", path.display()))?;
        if entry.file_type().is_file() {
            total += entry
                .metadata()
                .with_context(|| format!("stat {}", entry.path().display()))?
                .len();
        }
    }
    Ok(total)
}

fn stream_into(hasher: &mut Sha256, path: &Path) -> Result<()> {
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    io::copy(&mut file, hasher).with_context(|| format!("read {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn file_hash_is_hex_sha256() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("dump.sql");
        fs::write(&path, b"abc").expect("write");
        assert_eq!(
            file_hash(&path).expect("hash"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(artifact_hash(&path).expect("hash"), file_hash(&path).expect("hash"));
    }

    #[test]
    fn tree_hash_tracks_contents_and_names() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path().join("backup_db");
        fs::create_dir_all(root.join("sub")).expect("mkdir");
        fs::write(root.join("toc.dat"), b"toc").expect("write");
        fs::write(root.join("sub").join("3001.dat"), b"rows").expect("write");

        let original = tree_hash(&root).expect("hash");
        assert_eq!(original, artifact_hash(&root).expect("hash"));

        fs::write(root.join("sub").join("3001.dat"), b"rowz").expect("write");
        let edited = tree_hash(&root).expect("hash");
        assert_ne!(original, edited);

        fs::rename(root.join("sub").join("3001.dat"), root.join("3001.dat")).expect("rename");
        assert_ne!(edited, tree_hash(&root).expect("hash"));
    }

    #[test]
    fn size_sums_directory_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("a"), b"12345").expect("write");
        fs::write(tmp.path().join("b"), b"123").expect("write");
        assert_eq!(artifact_size(tmp.path()).expect("size"), 8);
        assert_eq!(artifact_size(&tmp.path().join("a")).expect("size"), 5);
    }
}
