//! Message identity and search criteria.

use std::fmt;

/// Identity of one mailbox object.
///
/// `mailbox_id` is assigned by the mailbox service and changes whenever a
/// message is recreated (upload, restore). `message_id` is the RFC 5322
/// `Message-ID` header value, angle brackets included, and is the durable
/// cross-reference used by revert.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct MessageRef {
    /// Mailbox-assigned identifier (IMAP UID, Gmail id, file stem, ...).
    pub mailbox_id: String,
    /// The `Message-ID` header value.
    pub message_id: String,
}

impl MessageRef {
    pub fn new(mailbox_id: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            mailbox_id: mailbox_id.into(),
            message_id: message_id.into(),
        }
    }
}

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.message_id, self.mailbox_id)
    }
}

/// Filter handed to the mailbox `search` capability.
///
/// Building these from user-facing filters (dates, senders, labels) is the
/// caller's business; the engine only needs folder and Message-ID lookups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchCriteria {
    /// Folder to search. `None` means the mailbox's active folder.
    pub folder: Option<String>,
    /// Exact `Message-ID` match.
    pub message_id: Option<String>,
    /// Minimum raw message size in bytes.
    pub min_size: Option<u64>,
    /// Stop after this many results.
    pub limit: Option<usize>,
}

impl SearchCriteria {
    /// Criteria matching every message carrying `message_id` in `folder`.
    pub fn by_message_id(folder: &str, message_id: &str) -> Self {
        Self {
            folder: Some(folder.to_string()),
            message_id: Some(message_id.to_string()),
            ..Self::default()
        }
    }
}
