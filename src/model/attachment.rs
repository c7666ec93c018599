//! Attachment records and content digests.

use std::fmt;
use std::path::PathBuf;

use sha2::{Digest as _, Sha256};

/// SHA-256 content digest, rendered as `sha256:<lowercase hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    /// Hash raw bytes.
    pub fn of(data: &[u8]) -> Self {
        Self(format!("sha256:{}", hex::encode(Sha256::digest(data))))
    }

    /// Accept an already formatted digest (e.g. read back from a placeholder).
    pub fn parse(s: &str) -> Option<Self> {
        let hex_part = s.trim().strip_prefix("sha256:")?;
        if hex_part.len() == 64 && hex_part.bytes().all(|b| b.is_ascii_hexdigit()) {
            Some(Self(format!("sha256:{}", hex_part.to_ascii_lowercase())))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The hex part without the algorithm prefix.
    pub fn hex(&self) -> &str {
        self.0.strip_prefix("sha256:").unwrap_or(&self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One stripped attachment.
///
/// The digest is computed once at extraction time and never rewritten;
/// later checks compare against it.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AttachmentRecord {
    /// Filename of the attachment. Generated if missing from the headers.
    pub filename: String,

    /// Declared MIME content type (e.g. `"application/pdf"`).
    pub content_type: String,

    /// Decoded size in bytes.
    pub size: u64,

    /// Digest of the decoded bytes.
    pub digest: Digest,

    /// Location inside the backup store, relative to its root.
    pub backup_path: PathBuf,

    /// MIME part path within the original message (`"2"`, `"1.3"`).
    pub part_path: String,
}
