//! Manifest entries: one per original message ever processed.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};

use crate::error::{Result, StripError};

use super::attachment::AttachmentRecord;
use super::message::MessageRef;

/// Lifecycle status of an original message.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum ManifestStatus {
    /// Seen by a scan, nothing done yet.
    Scanned,
    /// Encrypted payload; never touched.
    SkippedEncrypted,
    /// A replace transaction is in flight.
    Processing,
    /// Replacement verified, labelled, original trashed.
    Committed,
    /// Transaction aborted; original untouched.
    Failed,
    /// Transaction aborted after upload; the replacement was removed.
    RolledBack,
    /// Original restored from trash, replacement removed.
    Reverted,
}

impl ManifestStatus {
    pub const ALL: [ManifestStatus; 7] = [
        Self::Scanned,
        Self::SkippedEncrypted,
        Self::Processing,
        Self::Committed,
        Self::Failed,
        Self::RolledBack,
        Self::Reverted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scanned => "scanned",
            Self::SkippedEncrypted => "skipped-encrypted",
            Self::Processing => "processing",
            Self::Committed => "committed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled-back",
            Self::Reverted => "reverted",
        }
    }

    /// Whether `process` may start a new replace transaction for this entry.
    pub fn is_eligible_for_processing(self) -> bool {
        matches!(self, Self::Scanned | Self::Failed | Self::RolledBack)
    }
}

impl fmt::Display for ManifestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timestamped status change.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StatusTransition {
    pub status: ManifestStatus,
    pub at: DateTime<Utc>,
}

/// Materialized state of one original message.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ManifestEntry {
    /// The message as it was found by the scan.
    pub original: MessageRef,

    /// The stripped replacement, once uploaded.
    pub replacement: Option<MessageRef>,

    /// The original as restored by a revert.
    pub restored: Option<MessageRef>,

    /// Stripped attachments, in MIME order.
    pub attachments: Vec<AttachmentRecord>,

    /// Labels carried by the original.
    pub labels: BTreeSet<String>,

    /// Decoded subject, for reports.
    pub subject: String,

    /// Raw size of the original in bytes.
    pub original_size: u64,

    /// Raw size of the replacement in bytes.
    pub stripped_size: Option<u64>,

    /// Current status.
    pub status: ManifestStatus,

    /// Every status change, oldest first.
    pub transitions: Vec<StatusTransition>,

    /// Last failure reason, if any.
    pub error: Option<String>,
}

impl ManifestEntry {
    /// A freshly scanned entry.
    pub fn scanned(original: MessageRef, at: DateTime<Utc>) -> Self {
        Self {
            original,
            replacement: None,
            restored: None,
            attachments: Vec::new(),
            labels: BTreeSet::new(),
            subject: String::new(),
            original_size: 0,
            stripped_size: None,
            status: ManifestStatus::Scanned,
            transitions: vec![StatusTransition {
                status: ManifestStatus::Scanned,
                at,
            }],
            error: None,
        }
    }

    /// The durable key of this entry.
    pub fn message_id(&self) -> &str {
        &self.original.message_id
    }

    /// Move to `status`, recording the time.
    ///
    /// A committed entry only accepts `Reverted`. Re-applying the current
    /// status is a no-op so recovery can redo bookkeeping safely.
    pub fn transition(&mut self, status: ManifestStatus, at: DateTime<Utc>) -> Result<()> {
        if self.status == status {
            return Ok(());
        }
        let allowed = match self.status {
            ManifestStatus::Committed => status == ManifestStatus::Reverted,
            ManifestStatus::Reverted | ManifestStatus::SkippedEncrypted => false,
            _ => true,
        };
        if !allowed {
            return Err(StripError::InvalidTransition {
                message_id: self.original.message_id.clone(),
                from: self.status.to_string(),
                step: status.to_string(),
            });
        }
        self.status = status;
        self.transitions.push(StatusTransition { status, at });
        Ok(())
    }

    /// Time of the most recent transition into `status`.
    pub fn transitioned_at(&self, status: ManifestStatus) -> Option<DateTime<Utc>> {
        self.transitions
            .iter()
            .rev()
            .find(|t| t.status == status)
            .map(|t| t.at)
    }

    /// Total decoded bytes of the stripped attachments.
    pub fn stripped_bytes(&self) -> u64 {
        self.attachments.iter().map(|a| a.size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> ManifestEntry {
        ManifestEntry::scanned(MessageRef::new("1", "<a@x>"), Utc::now())
    }

    #[test]
    fn test_committed_only_moves_to_reverted() {
        let mut e = entry();
        e.transition(ManifestStatus::Processing, Utc::now()).unwrap();
        e.transition(ManifestStatus::Committed, Utc::now()).unwrap();
        assert!(e.transition(ManifestStatus::Failed, Utc::now()).is_err());
        assert!(e.transition(ManifestStatus::Processing, Utc::now()).is_err());
        e.transition(ManifestStatus::Reverted, Utc::now()).unwrap();
        assert_eq!(e.status, ManifestStatus::Reverted);
    }

    #[test]
    fn test_same_status_is_noop() {
        let mut e = entry();
        e.transition(ManifestStatus::Scanned, Utc::now()).unwrap();
        assert_eq!(e.transitions.len(), 1);
    }

    #[test]
    fn test_transition_timestamps_recorded() {
        let mut e = entry();
        e.transition(ManifestStatus::Processing, Utc::now()).unwrap();
        assert!(e.transitioned_at(ManifestStatus::Processing).is_some());
        assert!(e.transitioned_at(ManifestStatus::Committed).is_none());
    }

    #[test]
    fn test_eligibility() {
        assert!(ManifestStatus::Failed.is_eligible_for_processing());
        assert!(ManifestStatus::RolledBack.is_eligible_for_processing());
        assert!(!ManifestStatus::Committed.is_eligible_for_processing());
        assert!(!ManifestStatus::SkippedEncrypted.is_eligible_for_processing());
        assert!(!ManifestStatus::Reverted.is_eligible_for_processing());
    }
}
