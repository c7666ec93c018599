//! In-memory backup store for tests and benchmarks.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Result, StripError};
use crate::model::attachment::Digest;

use super::{BackupStore, WriteReceipt};

/// Backup store held in a map.
///
/// `corrupt_reads_of` makes every later read of a path return altered
/// bytes, which is how integrity failures are simulated.
#[derive(Debug, Default)]
pub struct MemoryBackupStore {
    objects: Mutex<HashMap<PathBuf, Vec<u8>>>,
    corrupted: Mutex<Vec<PathBuf>>,
    corrupt_writes: Mutex<bool>,
}

impl MemoryBackupStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads of `path` return flipped bytes from now on.
    pub fn corrupt_reads_of(&self, path: impl Into<PathBuf>) {
        lock(&self.corrupted).push(path.into());
    }

    /// Every write stores altered bytes from now on.
    pub fn corrupt_writes(&self) {
        *lock(&self.corrupt_writes) = true;
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        lock(&self.objects).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All stored paths, sorted.
    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = lock(&self.objects).keys().cloned().collect();
        paths.sort();
        paths
    }

    fn tampered(&self, path: &Path, bytes: Vec<u8>) -> Vec<u8> {
        if lock(&self.corrupted).iter().any(|p| p == path) {
            flip(bytes)
        } else {
            bytes
        }
    }
}

fn flip(mut bytes: Vec<u8>) -> Vec<u8> {
    match bytes.first_mut() {
        Some(b) => *b ^= 0xFF,
        None => bytes.push(0),
    }
    bytes
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl BackupStore for MemoryBackupStore {
    fn write(&self, path: &Path, bytes: &[u8]) -> Result<WriteReceipt> {
        let stored = if *lock(&self.corrupt_writes) {
            flip(bytes.to_vec())
        } else {
            bytes.to_vec()
        };
        lock(&self.objects).insert(path.to_path_buf(), stored);
        let read_back = self.read(path)?;
        Ok(WriteReceipt {
            size: read_back.len() as u64,
            digest: Digest::of(&read_back),
        })
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let bytes = lock(&self.objects).get(path).cloned().ok_or_else(|| {
            StripError::io(
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "no such backup object"),
            )
        })?;
        Ok(self.tampered(path, bytes))
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(lock(&self.objects).contains_key(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corruption_hook_changes_digest() {
        let store = MemoryBackupStore::new();
        let receipt = store.write(Path::new("x"), b"abc").unwrap();
        assert_eq!(receipt.digest, Digest::of(b"abc"));
        store.corrupt_reads_of("x");
        assert_ne!(Digest::of(&store.read(Path::new("x")).unwrap()), receipt.digest);
    }

    #[test]
    fn test_corrupt_writes_visible_in_receipt() {
        let store = MemoryBackupStore::new();
        store.corrupt_writes();
        let receipt = store.write(Path::new("y"), b"abc").unwrap();
        assert_ne!(receipt.digest, Digest::of(b"abc"));
    }
}
