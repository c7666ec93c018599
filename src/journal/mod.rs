//! Append-only transaction journal.
//!
//! Every transactional step is logged as `attempted` before its side effect
//! and as `succeeded` or `failed` after it. The journal is the source of truth
//! for recovery; the manifest is rebuilt from it when needed.

pub mod state;
pub mod store;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, StripError};
use crate::model::attachment::{AttachmentRecord, Digest};
use crate::model::message::MessageRef;

pub use store::{FileJournal, JournalStore, MemoryJournal};

/// On-disk schema version of [`LogEntry`].
pub const ENTRY_VERSION: u32 = 1;

/// Transaction types sharing the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TxnKind {
    Replace,
    Revert,
    Maintenance,
}

/// Journaled steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Step {
    // Replace
    Scan,
    SkipEncrypted,
    Extract,
    Reconstruct,
    Upload,
    Verify,
    ApplyLabels,
    TrashOriginal,
    Commit,
    Rollback,
    // Revert
    LocateOriginal,
    RestoreOriginal,
    RestoreLabels,
    DeleteReplacement,
    MarkReverted,
    // Maintenance
    Compact,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scan => "scan",
            Self::SkipEncrypted => "skip-encrypted",
            Self::Extract => "extract",
            Self::Reconstruct => "reconstruct",
            Self::Upload => "upload",
            Self::Verify => "verify",
            Self::ApplyLabels => "apply-labels",
            Self::TrashOriginal => "trash-original",
            Self::Commit => "commit",
            Self::Rollback => "rollback",
            Self::LocateOriginal => "locate-original",
            Self::RestoreOriginal => "restore-original",
            Self::RestoreLabels => "restore-labels",
            Self::DeleteReplacement => "delete-replacement",
            Self::MarkReverted => "mark-reverted",
            Self::Compact => "compact",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one step record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Attempted,
    Succeeded,
    Failed,
}

/// Step payload. Only the fields relevant to a step are set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepData {
    /// Reference created by the step (uploaded replacement, restored original).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_ref: Option<MessageRef>,
    /// Replacement a revert transaction removes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replacement: Option<MessageRef>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeSet<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stripped_size: Option<u64>,
    /// Digest of the reconstructed message bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replacement_digest: Option<Digest>,
    /// Retry attempt number, for repeated `attempted` records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Entries removed by a compaction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub removed: Option<usize>,
}

impl StepData {
    pub fn error(e: &StripError) -> Self {
        Self {
            error: Some(e.to_string()),
            ..Self::default()
        }
    }

    pub fn with_ref(new_ref: MessageRef) -> Self {
        Self {
            new_ref: Some(new_ref),
            ..Self::default()
        }
    }
}

/// One journal record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Schema version.
    pub v: u32,
    /// Append order.
    pub seq: u64,
    pub txn_id: String,
    /// `<txn_id>:<step>`; identical for an attempt, its retries and its outcome.
    pub token: String,
    pub kind: TxnKind,
    /// The original message this transaction is about. Empty for maintenance.
    pub message: MessageRef,
    pub step: Step,
    pub outcome: Outcome,
    /// Dry-run records. Ignored by recovery and manifest rebuilds.
    #[serde(default)]
    pub simulated: bool,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub data: StepData,
}

/// Handle for one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Txn {
    pub id: String,
    pub kind: TxnKind,
    pub message: MessageRef,
    pub simulated: bool,
}

/// The journal as seen by the engine.
///
/// Assigns sequence numbers and maps every storage failure to
/// [`StripError::LogWrite`], which aborts the run.
pub struct TransactionLog {
    store: Arc<dyn JournalStore>,
    next_seq: Mutex<u64>,
}

impl TransactionLog {
    pub fn open(store: Arc<dyn JournalStore>) -> Result<Self> {
        let last = store
            .read_all()?
            .iter()
            .map(|e| e.seq)
            .max()
            .map_or(0, |s| s + 1);
        Ok(Self {
            store,
            next_seq: Mutex::new(last),
        })
    }

    /// Start a new transaction.
    pub fn begin(&self, kind: TxnKind, message: MessageRef, simulated: bool) -> Txn {
        Txn {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            message,
            simulated,
        }
    }

    /// Durably record a step. Returns once the entry is flushed.
    pub fn record(&self, txn: &Txn, step: Step, outcome: Outcome, data: StepData) -> Result<LogEntry> {
        self.record_at(txn, step, outcome, data, Utc::now())
    }

    pub fn record_at(
        &self,
        txn: &Txn,
        step: Step,
        outcome: Outcome,
        data: StepData,
        at: DateTime<Utc>,
    ) -> Result<LogEntry> {
        let mut next_seq = self
            .next_seq
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = LogEntry {
            v: ENTRY_VERSION,
            seq: *next_seq,
            txn_id: txn.id.clone(),
            token: format!("{}:{}", txn.id, step),
            kind: txn.kind,
            message: txn.message.clone(),
            step,
            outcome,
            simulated: txn.simulated,
            at,
            data,
        };
        self.store.append(&entry).map_err(|e| match e {
            StripError::LogWrite(_) => e,
            other => StripError::LogWrite(other.to_string()),
        })?;
        *next_seq += 1;
        debug!(
            message_id = %entry.message.message_id,
            txn = %entry.txn_id,
            step = %step,
            outcome = ?outcome,
            simulated = entry.simulated,
            "Journaled"
        );
        Ok(entry)
    }

    /// Every entry in append order.
    pub fn entries(&self) -> Result<Vec<LogEntry>> {
        let mut entries = self.store.read_all()?;
        entries.sort_by_key(|e| e.seq);
        Ok(entries)
    }

    /// Drop history older than `retention` that recovery and rebuilds no
    /// longer need, and log the compaction itself.
    ///
    /// Removed: simulated transactions, and every transaction of a message
    /// that has a later, non-simulated replace transaction. The latest replace
    /// transaction of each message and everything after it always stay.
    pub fn compact(&self, retention: chrono::Duration, now: DateTime<Utc>) -> Result<usize> {
        let removed = {
            // Hold the sequence lock so no entry is appended mid-rewrite.
            let _seq = self
                .next_seq
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let mut entries = self.store.read_all()?;
            entries.sort_by_key(|e| e.seq);

            let doomed = compactable_transactions(&entries, now - retention);
            let (removed, kept): (Vec<LogEntry>, Vec<LogEntry>) = entries
                .into_iter()
                .partition(|e| doomed.contains(&e.txn_id));
            if !removed.is_empty() {
                self.store
                    .replace_all(&kept)
                    .map_err(|e| StripError::LogWrite(e.to_string()))?;
            }
            removed.len()
        };

        let txn = self.begin(TxnKind::Maintenance, MessageRef::new("", ""), false);
        self.record_at(
            &txn,
            Step::Compact,
            Outcome::Succeeded,
            StepData {
                removed: Some(removed),
                ..StepData::default()
            },
            now,
        )?;
        info!(removed, "Journal compacted");
        Ok(removed)
    }
}

/// Transactions whose entries may be dropped by a compaction at `cutoff`.
fn compactable_transactions(entries: &[LogEntry], cutoff: DateTime<Utc>) -> HashSet<String> {
    let groups = state::group_transactions(entries);

    // First seq of the latest real replace transaction per message.
    let mut latest_replace: HashMap<&str, u64> = HashMap::new();
    for g in &groups {
        if g.kind == TxnKind::Replace && !g.simulated {
            let slot = latest_replace
                .entry(g.message.message_id.as_str())
                .or_insert(g.first_seq);
            *slot = (*slot).max(g.first_seq);
        }
    }

    groups
        .iter()
        .filter(|g| g.kind != TxnKind::Maintenance && g.last_at < cutoff)
        .filter(|g| {
            g.simulated
                || latest_replace
                    .get(g.message.message_id.as_str())
                    .is_some_and(|&latest| g.first_seq < latest)
        })
        .map(|g| g.txn_id.clone())
        .collect()
}
