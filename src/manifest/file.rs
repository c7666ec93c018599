//! Binary manifest file.
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │ HEADER (64 bytes, fixed)             │
//! │  magic: [u8; 8] = b"MSTRIPMF"        │
//! │  version: u32                        │
//! │  flags: u32                          │
//! │  entry_count: u64                    │
//! │  payload_sha256: [u8; 32]            │
//! │  (padding to 64 bytes)               │
//! ├──────────────────────────────────────┤
//! │ PAYLOAD (variable)                   │
//! │  bincode-serialized Vec<ManifestEntry>│
//! └──────────────────────────────────────┘
//! ```
//!
//! The file is rewritten through a temporary file and a rename, so readers
//! only ever see a complete manifest.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{Result, StripError};
use crate::model::manifest::ManifestEntry;

use super::ManifestStore;

/// Magic bytes identifying a mailstrip manifest.
pub const MAGIC: &[u8; 8] = b"MSTRIPMF";

/// Current manifest format version.
pub const VERSION: u32 = 1;

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 64;

/// Serializable manifest header.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct ManifestHeader {
    /// Magic bytes (must equal [`MAGIC`]).
    pub magic: [u8; 8],
    /// Format version (must equal [`VERSION`]).
    pub version: u32,
    /// Reserved flags (currently unused).
    pub flags: u32,
    /// Number of entries in the payload.
    pub entry_count: u64,
    /// SHA-256 of the payload.
    pub payload_sha256: [u8; 32],
}

impl ManifestHeader {
    /// Validate that the header is well-formed and matches the current format.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.magic != *MAGIC {
            return Err("Invalid magic bytes".into());
        }
        if self.version != VERSION {
            return Err(format!(
                "Incompatible version: expected {VERSION}, found {}",
                self.version
            ));
        }
        Ok(())
    }
}

/// Manifest persisted to a single binary file.
#[derive(Debug)]
pub struct FileManifest {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, ManifestEntry>>,
}

impl FileManifest {
    /// Open the manifest at `path`, starting empty if the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            load(&path)?
        } else {
            debug!(path = %path.display(), "No manifest yet");
            Vec::new()
        };
        Ok(Self {
            path,
            entries: Mutex::new(
                entries
                    .into_iter()
                    .map(|e| (e.message_id().to_string(), e))
                    .collect(),
            ),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, ManifestEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, entries: &BTreeMap<String, ManifestEntry>) -> Result<()> {
        let list: Vec<&ManifestEntry> = entries.values().collect();
        write(&self.path, &list)
    }
}

fn invalid(path: &Path, reason: impl Into<String>) -> StripError {
    StripError::InvalidManifest {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Load and validate a manifest file.
fn load(path: &Path) -> Result<Vec<ManifestEntry>> {
    let data = fs::read(path).map_err(|e| StripError::io(path, e))?;

    if data.len() < HEADER_SIZE {
        return Err(invalid(path, "File too small"));
    }

    let header: ManifestHeader = bincode::deserialize(&data[..HEADER_SIZE])
        .map_err(|e| invalid(path, format!("Header deserialization failed: {e}")))?;
    header.validate().map_err(|reason| invalid(path, reason))?;

    let payload = &data[HEADER_SIZE..];
    let hash: [u8; 32] = Sha256::digest(payload).into();
    if hash != header.payload_sha256 {
        return Err(invalid(path, "Payload checksum mismatch"));
    }

    let entries: Vec<ManifestEntry> = bincode::deserialize(payload)
        .map_err(|e| invalid(path, format!("Entry deserialization failed: {e}")))?;

    if entries.len() as u64 != header.entry_count {
        return Err(invalid(path, "Entry count mismatch"));
    }
    Ok(entries)
}

/// Write header + payload atomically.
fn write(path: &Path, entries: &[&ManifestEntry]) -> Result<()> {
    let payload =
        bincode::serialize(entries).map_err(|e| invalid(path, format!("Serialization failed: {e}")))?;
    let header = ManifestHeader {
        magic: *MAGIC,
        version: VERSION,
        flags: 0,
        entry_count: entries.len() as u64,
        payload_sha256: Sha256::digest(&payload).into(),
    };
    let header_bytes =
        bincode::serialize(&header).map_err(|e| invalid(path, format!("Serialization failed: {e}")))?;

    // Pad header to HEADER_SIZE
    let mut padded_header = vec![0u8; HEADER_SIZE];
    let copy_len = header_bytes.len().min(HEADER_SIZE);
    padded_header[..copy_len].copy_from_slice(&header_bytes[..copy_len]);

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| StripError::io(parent, e))?;
        }
    }
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp).map_err(|e| StripError::io(&tmp, e))?;
        file.write_all(&padded_header)
            .map_err(|e| StripError::io(&tmp, e))?;
        file.write_all(&payload).map_err(|e| StripError::io(&tmp, e))?;
        file.sync_all().map_err(|e| StripError::io(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| StripError::io(path, e))?;
    debug!(path = %path.display(), entries = entries.len(), "Manifest written");
    Ok(())
}

impl ManifestStore for FileManifest {
    fn get(&self, message_id: &str) -> Result<Option<ManifestEntry>> {
        Ok(self.lock().get(message_id).cloned())
    }

    fn upsert(&self, entry: &ManifestEntry) -> Result<()> {
        let mut entries = self.lock();
        entries.insert(entry.message_id().to_string(), entry.clone());
        self.persist(&entries)
    }

    fn all(&self) -> Result<Vec<ManifestEntry>> {
        Ok(self.lock().values().cloned().collect())
    }

    fn replace_all(&self, new_entries: Vec<ManifestEntry>) -> Result<()> {
        let mut entries = self.lock();
        *entries = new_entries
            .into_iter()
            .map(|e| (e.message_id().to_string(), e))
            .collect();
        self.persist(&entries)?;
        info!(path = %self.path.display(), entries = entries.len(), "Manifest replaced");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::model::manifest::ManifestStatus;
    use crate::model::message::MessageRef;

    #[test]
    fn test_header_fits() {
        let header = ManifestHeader {
            magic: *MAGIC,
            version: VERSION,
            flags: 0,
            entry_count: 0,
            payload_sha256: [0; 32],
        };
        assert!(bincode::serialize(&header).unwrap().len() <= HEADER_SIZE);
    }

    #[test]
    fn test_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.bin");
        let store = FileManifest::open(&path).unwrap();
        let mut entry = ManifestEntry::scanned(MessageRef::new("1", "<a@x>"), Utc::now());
        entry.transition(ManifestStatus::Processing, Utc::now()).unwrap();
        store.upsert(&entry).unwrap();

        let reopened = FileManifest::open(&path).unwrap();
        assert_eq!(reopened.get("<a@x>").unwrap(), Some(entry));
        assert!(!dir.path().join("manifest.tmp").exists());
    }

    #[test]
    fn test_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.bin");
        let store = FileManifest::open(&path).unwrap();
        store
            .upsert(&ManifestEntry::scanned(MessageRef::new("1", "<a@x>"), Utc::now()))
            .unwrap();

        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        fs::write(&path, &data).unwrap();
        assert!(matches!(
            FileManifest::open(&path),
            Err(StripError::InvalidManifest { .. })
        ));
    }

    #[test]
    fn test_rejects_other_versions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.bin");
        FileManifest::open(&path)
            .unwrap()
            .replace_all(Vec::new())
            .unwrap();
        let mut data = fs::read(&path).unwrap();
        data[8] = 2; // version, little-endian u32 after the magic
        fs::write(&path, &data).unwrap();
        let err = FileManifest::open(&path).unwrap_err();
        assert!(err.to_string().contains("Incompatible version"));
    }
}
