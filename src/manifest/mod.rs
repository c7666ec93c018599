//! Manifest: materialized per-message state, keyed by original Message-ID.
//!
//! The journal is authoritative. Every manifest write is an idempotent
//! upsert, and the whole manifest can be rebuilt from the journal.

pub mod file;

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use tracing::warn;

use crate::error::Result;
use crate::journal::state::group_transactions;
use crate::journal::{LogEntry, Outcome, Step, TxnKind};
use crate::model::manifest::{ManifestEntry, ManifestStatus};

pub use file::FileManifest;

/// Storage for manifest entries.
pub trait ManifestStore: Send + Sync {
    fn get(&self, message_id: &str) -> Result<Option<ManifestEntry>>;

    /// Insert or overwrite the entry for its Message-ID.
    fn upsert(&self, entry: &ManifestEntry) -> Result<()>;

    /// Every entry, ordered by Message-ID.
    fn all(&self) -> Result<Vec<ManifestEntry>>;

    /// Replace the whole manifest.
    fn replace_all(&self, entries: Vec<ManifestEntry>) -> Result<()>;
}

/// Manifest held in memory.
#[derive(Debug, Default)]
pub struct MemoryManifest {
    entries: Mutex<BTreeMap<String, ManifestEntry>>,
}

impl MemoryManifest {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, ManifestEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ManifestStore for MemoryManifest {
    fn get(&self, message_id: &str) -> Result<Option<ManifestEntry>> {
        Ok(self.lock().get(message_id).cloned())
    }

    fn upsert(&self, entry: &ManifestEntry) -> Result<()> {
        self.lock()
            .insert(entry.message_id().to_string(), entry.clone());
        Ok(())
    }

    fn all(&self) -> Result<Vec<ManifestEntry>> {
        Ok(self.lock().values().cloned().collect())
    }

    fn replace_all(&self, entries: Vec<ManifestEntry>) -> Result<()> {
        *self.lock() = entries
            .into_iter()
            .map(|e| (e.message_id().to_string(), e))
            .collect();
        Ok(())
    }
}

/// Entry counts per status.
pub fn status_counts(entries: &[ManifestEntry]) -> BTreeMap<ManifestStatus, usize> {
    let mut counts: BTreeMap<ManifestStatus, usize> =
        ManifestStatus::ALL.iter().map(|s| (*s, 0)).collect();
    for e in entries {
        *counts.entry(e.status).or_insert(0) += 1;
    }
    counts
}

/// Rebuild every manifest entry from the journal.
///
/// Simulated transactions are ignored.
pub fn materialize(entries: &[LogEntry]) -> Vec<ManifestEntry> {
    let mut manifest: HashMap<String, ManifestEntry> = HashMap::new();

    for txn in group_transactions(entries) {
        if txn.simulated || txn.kind == TxnKind::Maintenance {
            continue;
        }
        let id = txn.message.message_id.clone();
        let entry = manifest
            .entry(id)
            .or_insert_with(|| ManifestEntry::scanned(txn.message.clone(), txn.entries[0].at));
        for log in &txn.entries {
            apply(entry, log);
        }
    }

    let mut out: Vec<ManifestEntry> = manifest.into_values().collect();
    out.sort_by(|a, b| a.message_id().cmp(b.message_id()));
    out
}

/// Fold one journal entry into a manifest entry.
///
/// Transitions the entry cannot take (e.g. a committed entry seeing a
/// failure) are logged and ignored.
pub fn apply(entry: &mut ManifestEntry, log: &LogEntry) {
    let data = &log.data;
    let status = match (log.kind, log.step, log.outcome) {
        (TxnKind::Replace, Step::Scan, Outcome::Succeeded) => {
            entry.original = log.message.clone();
            if let Some(labels) = &data.labels {
                entry.labels = labels.clone();
            }
            if let Some(subject) = &data.subject {
                entry.subject = subject.clone();
            }
            if let Some(size) = data.original_size {
                entry.original_size = size;
            }
            None
        }
        (TxnKind::Replace, Step::SkipEncrypted, Outcome::Succeeded) => {
            Some(ManifestStatus::SkippedEncrypted)
        }
        (TxnKind::Replace, Step::Extract, Outcome::Attempted) => {
            entry.error = None;
            Some(ManifestStatus::Processing)
        }
        (TxnKind::Replace, Step::Extract, Outcome::Succeeded) => {
            entry.attachments = data.attachments.clone();
            None
        }
        (TxnKind::Replace, Step::Reconstruct, Outcome::Succeeded) => {
            entry.stripped_size = data.stripped_size.or(entry.stripped_size);
            None
        }
        (TxnKind::Replace, Step::Upload, Outcome::Succeeded) => {
            entry.replacement = data.new_ref.clone();
            None
        }
        (TxnKind::Replace, Step::Commit, Outcome::Succeeded) => Some(ManifestStatus::Committed),
        (TxnKind::Replace, Step::Rollback, Outcome::Succeeded) => {
            entry.replacement = None;
            Some(ManifestStatus::RolledBack)
        }
        (TxnKind::Replace, Step::Rollback, _) => None,
        (TxnKind::Replace, _, Outcome::Failed) => {
            entry.error = data.error.clone();
            Some(ManifestStatus::Failed)
        }
        (TxnKind::Revert, Step::RestoreOriginal, Outcome::Succeeded) => {
            entry.restored = data.new_ref.clone();
            None
        }
        (TxnKind::Revert, Step::MarkReverted, Outcome::Succeeded) => Some(ManifestStatus::Reverted),
        _ => None,
    };

    if let Some(status) = status {
        if let Err(e) = entry.transition(status, log.at) {
            warn!(
                message_id = %entry.message_id(),
                seq = log.seq,
                error = %e,
                "Ignoring journal entry during manifest rebuild"
            );
        }
    }
}
