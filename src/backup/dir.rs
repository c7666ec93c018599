//! Filesystem backup store.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::error::{Result, StripError};
use crate::model::attachment::Digest;

use super::{BackupStore, WriteReceipt};

/// Stores backups as plain files under a root directory.
#[derive(Debug, Clone)]
pub struct DirBackupStore {
    root: PathBuf,
}

impl DirBackupStore {
    /// Create the store, creating `root` if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| StripError::io(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative path, refusing anything that escapes the root.
    fn resolve(&self, rel: &Path) -> Result<PathBuf> {
        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || rel.as_os_str().is_empty() {
            return Err(StripError::io(
                rel,
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "backup path must be relative and stay inside the store",
                ),
            ));
        }
        Ok(self.root.join(rel))
    }
}

impl BackupStore for DirBackupStore {
    fn write(&self, path: &Path, bytes: &[u8]) -> Result<WriteReceipt> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).map_err(|e| StripError::io(parent, e))?;
        }

        // Temp file + fsync + rename so a crash never leaves a torn object.
        let tmp = full.with_extension(format!(
            "{}tmp",
            full.extension()
                .map(|e| format!("{}.", e.to_string_lossy()))
                .unwrap_or_default()
        ));
        {
            let mut file = File::create(&tmp).map_err(|e| StripError::io(&tmp, e))?;
            file.write_all(bytes).map_err(|e| StripError::io(&tmp, e))?;
            file.sync_all().map_err(|e| StripError::io(&tmp, e))?;
        }
        fs::rename(&tmp, &full).map_err(|e| StripError::io(&full, e))?;

        let stored = fs::read(&full).map_err(|e| StripError::io(&full, e))?;
        debug!(path = %full.display(), size = stored.len(), "Backup written");
        Ok(WriteReceipt {
            size: stored.len() as u64,
            digest: Digest::of(&stored),
        })
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let full = self.resolve(path)?;
        fs::read(&full).map_err(|e| StripError::io(&full, e))
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.resolve(path)?.is_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_roundtrip_confirms_digest() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirBackupStore::open(dir.path()).unwrap();
        let data = b"%PDF-1.7 fake".to_vec();
        let receipt = store.write(Path::new("a/b/report.pdf"), &data).unwrap();
        assert_eq!(receipt.size, data.len() as u64);
        assert_eq!(receipt.digest, Digest::of(&data));
        assert_eq!(store.read(Path::new("a/b/report.pdf")).unwrap(), data);
        assert!(store.exists(Path::new("a/b/report.pdf")).unwrap());
        assert!(!dir.path().join("a/b/report.pdf.tmp").exists());
    }

    #[test]
    fn test_empty_attachment() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirBackupStore::open(dir.path()).unwrap();
        let receipt = store.write(Path::new("empty.bin"), b"").unwrap();
        assert_eq!(receipt.size, 0);
        assert_eq!(receipt.digest, Digest::of(b""));
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirBackupStore::open(dir.path()).unwrap();
        assert!(store.write(Path::new("../evil"), b"x").is_err());
        assert!(store.write(Path::new("/abs/evil"), b"x").is_err());
    }

    #[test]
    fn test_missing_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirBackupStore::open(dir.path()).unwrap();
        assert!(!store.exists(Path::new("nope")).unwrap());
        assert!(store.read(Path::new("nope")).is_err());
    }
}
