//! Centralized error types for mailstrip.

use std::path::PathBuf;
use thiserror::Error;

/// All errors produced by the mailstrip library.
#[derive(Error, Debug)]
pub enum StripError {
    /// I/O error with the associated file path.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Network hiccup or timeout talking to the mailbox service. Retried.
    #[error("Transient mailbox error: {0}")]
    TransientRemote(String),

    /// Non-retryable mailbox failure (authorization, missing message, rejected upload).
    #[error("Mailbox error: {0}")]
    Remote(String),

    /// A digest did not match on re-verification.
    #[error("Backup integrity check failed for '{path}': expected {expected}, found {actual}")]
    BackupIntegrity {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// An attachment exceeds the configured maximum size.
    #[error("Attachment '{filename}' is {size} bytes, above the {max} byte limit")]
    AttachmentTooLarge { filename: String, size: u64, max: u64 },

    /// The message is S/MIME or PGP encrypted and must not be touched.
    #[error("Message {0} is encrypted")]
    EncryptedContent(String),

    /// The original is no longer in trash.
    #[error("Message {0} cannot be reverted: original is no longer in trash")]
    NotRevertible(String),

    /// Revert was requested for an entry that is not committed.
    #[error("Message {message_id} is not committed (status: {status})")]
    NotCommitted { message_id: String, status: String },

    /// The transaction journal could not be written. Fatal to the whole run.
    #[error("Transaction log write failed: {0}")]
    LogWrite(String),

    /// A MIME structure could not be parsed or rebuilt.
    #[error("MIME error: {0}")]
    Mime(String),

    /// A step was attempted out of order.
    #[error("Invalid transition for {message_id}: {from} -> {step}")]
    InvalidTransition {
        message_id: String,
        from: String,
        step: String,
    },

    /// The manifest file is corrupt or was written by an incompatible version.
    #[error("Corrupt or incompatible manifest '{path}': {reason}")]
    InvalidManifest { path: PathBuf, reason: String },

    /// Another worker holds the transaction for this Message-ID.
    #[error("Message {0} is already being processed")]
    Busy(String),

    /// A transaction was cut short by a crash and abandoned by recovery.
    #[error("Transaction interrupted during {0}")]
    Interrupted(String),

    /// The batch was cancelled before this message started.
    #[error("Operation cancelled")]
    Cancelled,

    /// An export operation failed.
    #[error("Export error: {0}")]
    Export(String),
}

/// Convenience alias for `Result<T, StripError>`.
pub type Result<T> = std::result::Result<T, StripError>;

impl StripError {
    /// Create an `Io` variant from a path and an `io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the retry policy may try the operation again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientRemote(_))
    }

    /// Errors that abort the entire run instead of failing one message.
    pub fn is_fatal_to_run(&self) -> bool {
        matches!(self, Self::LogWrite(_))
    }
}

/// Allow `?` on `std::io::Error` when no path context is available
/// (rare, prefer `StripError::io`).
impl From<std::io::Error> for StripError {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::from("<unknown>"),
            source,
        }
    }
}
