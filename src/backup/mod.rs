//! Attachment backup stores.
//!
//! A backup object counts as safely stored only when it exists and its
//! digest matches the one recorded at extraction time.

pub mod dir;
pub mod layout;
pub mod memory;

use std::path::Path;

use crate::error::Result;
use crate::model::attachment::Digest;

pub use dir::DirBackupStore;
pub use memory::MemoryBackupStore;

/// What the store confirms after a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    /// Bytes actually stored.
    pub size: u64,
    /// Digest of the bytes read back from the store.
    pub digest: Digest,
}

/// Backup storage capability.
///
/// Paths are relative to the store root. Implementations must be safe to
/// share between worker threads.
pub trait BackupStore: Send + Sync {
    /// Store `bytes` at `path`, replacing any previous object, and confirm
    /// what was stored.
    fn write(&self, path: &Path, bytes: &[u8]) -> Result<WriteReceipt>;

    /// Read the object at `path`.
    fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Whether an object exists at `path`.
    fn exists(&self, path: &Path) -> Result<bool>;
}
