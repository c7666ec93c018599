//! Backup layout policies: where a given attachment lands in the store.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::attachment::Digest;

/// What a layout policy may look at.
#[derive(Debug, Clone)]
pub struct BackupTarget<'a> {
    pub message_id: &'a str,
    pub subject: &'a str,
    pub date: Option<DateTime<Utc>>,
    pub filename: &'a str,
    pub digest: &'a Digest,
}

/// Maps an attachment to a path relative to the backup root.
///
/// Must be deterministic: the same target always yields the same path, so a
/// retried or recovered extraction overwrites instead of duplicating.
pub trait LayoutPolicy: Send + Sync {
    fn path_for(&self, target: &BackupTarget<'_>) -> PathBuf;
}

/// Configured layout kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayoutKind {
    /// `by-digest/<aa>/<hex>-<filename>`
    Digest,
    /// `<date>_<subject>/<digest8>_<filename>`
    Message,
}

impl LayoutKind {
    pub fn policy(self) -> Box<dyn LayoutPolicy> {
        match self {
            Self::Digest => Box::new(DigestLayout),
            Self::Message => Box::new(MessageLayout),
        }
    }
}

/// Content-addressed layout. Identical attachments share one file.
#[derive(Debug, Clone, Copy, Default)]
pub struct DigestLayout;

impl LayoutPolicy for DigestLayout {
    fn path_for(&self, target: &BackupTarget<'_>) -> PathBuf {
        let hex = target.digest.hex();
        PathBuf::from("by-digest")
            .join(&hex[..2])
            .join(format!("{hex}-{}", sanitize_filename_part(target.filename, 100)))
    }
}

/// One folder per message, named after its date and subject.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageLayout;

impl LayoutPolicy for MessageLayout {
    fn path_for(&self, target: &BackupTarget<'_>) -> PathBuf {
        let date = target
            .date
            .map(|d| d.format("%Y%m%d_%H%M%S").to_string())
            .unwrap_or_else(|| "undated".to_string());
        let subject = sanitize_filename_part(target.subject, 60);
        let folder = format!("{date}_{subject}");
        let prefix = &target.digest.hex()[..8];
        PathBuf::from(folder).join(format!(
            "{prefix}_{}",
            sanitize_filename_part(target.filename, 100)
        ))
    }
}

/// Sanitize a string for use as part of a filename.
pub fn sanitize_filename_part(s: &str, max_len: usize) -> String {
    let sanitized: String = s
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '.' || c == '_' || c == '@' {
                c
            } else {
                '_'
            }
        })
        .take(max_len)
        .collect();

    // A name made only of dots would escape the folder.
    if sanitized.is_empty() || sanitized.chars().all(|c| c == '.') {
        "unknown".to_string()
    } else {
        sanitized
    }
}
