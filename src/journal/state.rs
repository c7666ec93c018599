//! Transaction state machines and journal replay.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};

use crate::error::{Result, StripError};
use crate::model::attachment::AttachmentRecord;
use crate::model::message::MessageRef;

use super::{LogEntry, Outcome, Step, TxnKind};

/// Replace transaction states, strictly ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TxnState {
    Scanned,
    Extracting,
    Extracted,
    Reconstructed,
    Uploading,
    Uploaded,
    Verifying,
    Verified,
    LabelsApplied,
    OriginalTrashed,
    Committed,
    /// Absorbing failure state.
    Failed,
    /// Failed after upload; the replacement has been removed.
    RolledBack,
    /// Encrypted message; never touched.
    SkippedEncrypted,
}

const FORWARD: [TxnState; 11] = [
    TxnState::Scanned,
    TxnState::Extracting,
    TxnState::Extracted,
    TxnState::Reconstructed,
    TxnState::Uploading,
    TxnState::Uploaded,
    TxnState::Verifying,
    TxnState::Verified,
    TxnState::LabelsApplied,
    TxnState::OriginalTrashed,
    TxnState::Committed,
];

impl TxnState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Committed | Self::RolledBack | Self::SkippedEncrypted
        )
    }

    fn position(self) -> Option<usize> {
        FORWARD.iter().position(|s| *s == self)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_advance_to(self, next: TxnState) -> bool {
        match (self, next) {
            (Self::Failed, Self::RolledBack) => true,
            (Self::Scanned, Self::SkippedEncrypted) => true,
            (from, Self::Failed) => !from.is_terminal() && from != Self::Failed,
            (from, to) => match (from.position(), to.position()) {
                (Some(a), Some(b)) => b == a + 1,
                _ => false,
            },
        }
    }

    /// Whether the replacement may exist in the mailbox.
    pub fn upload_started(self) -> bool {
        self.position()
            .is_some_and(|p| p >= TxnState::Uploading.position().unwrap_or(usize::MAX))
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// In-process driver for one replace transaction.
#[derive(Debug, Clone)]
pub struct StateMachine {
    message_id: String,
    state: TxnState,
}

impl StateMachine {
    pub fn new(message_id: impl Into<String>) -> Self {
        Self::resume(message_id, TxnState::Scanned)
    }

    pub fn resume(message_id: impl Into<String>, state: TxnState) -> Self {
        Self {
            message_id: message_id.into(),
            state,
        }
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Move to `next`, rejecting skipped or backward transitions.
    pub fn advance(&mut self, next: TxnState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(StripError::InvalidTransition {
                message_id: self.message_id.clone(),
                from: self.state.to_string(),
                step: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }
}

/// Revert transaction states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RevertState {
    Requested,
    Located,
    OriginalRestored,
    LabelsRestored,
    ReplacementDeleted,
    Reverted,
    Failed,
}

/// Everything the journal says about one transaction.
#[derive(Debug, Clone)]
pub struct TxnSummary {
    pub txn_id: String,
    pub kind: TxnKind,
    pub message: MessageRef,
    pub simulated: bool,
    pub first_seq: u64,
    pub last_at: DateTime<Utc>,
    pub entries: Vec<LogEntry>,
}

impl TxnSummary {
    fn outcome_of(&self, step: Step) -> Option<Outcome> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.step == step)
            .map(|e| e.outcome)
    }

    pub fn succeeded(&self, step: Step) -> bool {
        self.entries
            .iter()
            .any(|e| e.step == step && e.outcome == Outcome::Succeeded)
    }

    pub fn attempted(&self, step: Step) -> bool {
        self.entries.iter().any(|e| e.step == step)
    }

    pub fn has_failure(&self) -> bool {
        self.entries.iter().any(|e| e.outcome == Outcome::Failed)
    }

    /// Reference recorded by the last successful `step`.
    pub fn new_ref(&self, step: Step) -> Option<MessageRef> {
        self.entries
            .iter()
            .rev()
            .filter(|e| e.step == step && e.outcome == Outcome::Succeeded)
            .find_map(|e| e.data.new_ref.clone())
    }

    /// The replacement this transaction concerns: uploaded by a replace, or
    /// targeted by a revert.
    pub fn replacement(&self) -> Option<MessageRef> {
        match self.kind {
            TxnKind::Replace => self.new_ref(Step::Upload),
            _ => self.entries.iter().find_map(|e| e.data.replacement.clone()),
        }
    }

    pub fn attachments(&self) -> Vec<AttachmentRecord> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.step == Step::Extract && e.outcome == Outcome::Succeeded)
            .map(|e| e.data.attachments.clone())
            .unwrap_or_default()
    }

    pub fn labels(&self) -> BTreeSet<String> {
        self.entries
            .iter()
            .find_map(|e| e.data.labels.clone())
            .unwrap_or_default()
    }

    /// State of a replace transaction according to the journal.
    pub fn replace_state(&self) -> TxnState {
        if self.succeeded(Step::Rollback) {
            return TxnState::RolledBack;
        }
        if self.succeeded(Step::SkipEncrypted) {
            return TxnState::SkippedEncrypted;
        }
        if self.succeeded(Step::Commit) {
            return TxnState::Committed;
        }
        if self.has_failure() {
            return TxnState::Failed;
        }
        self.forward_state()
    }

    /// Furthest point reached on the forward path, ignoring failures.
    pub fn forward_state(&self) -> TxnState {
        let steps = [
            (Step::TrashOriginal, TxnState::OriginalTrashed, TxnState::LabelsApplied),
            (Step::ApplyLabels, TxnState::LabelsApplied, TxnState::Verified),
            (Step::Verify, TxnState::Verified, TxnState::Verifying),
            (Step::Upload, TxnState::Uploaded, TxnState::Uploading),
            (Step::Reconstruct, TxnState::Reconstructed, TxnState::Extracted),
            (Step::Extract, TxnState::Extracted, TxnState::Extracting),
        ];
        for (step, done, in_flight) in steps {
            match self.outcome_of(step) {
                Some(Outcome::Succeeded) => return done,
                Some(_) => return in_flight,
                None => {}
            }
        }
        TxnState::Scanned
    }

    /// State of a revert transaction according to the journal.
    pub fn revert_state(&self) -> RevertState {
        if self.succeeded(Step::MarkReverted) {
            return RevertState::Reverted;
        }
        let reached = if self.succeeded(Step::DeleteReplacement) {
            RevertState::ReplacementDeleted
        } else if self.succeeded(Step::RestoreLabels) {
            RevertState::LabelsRestored
        } else if self.succeeded(Step::RestoreOriginal) {
            RevertState::OriginalRestored
        } else if self.succeeded(Step::LocateOriginal) {
            RevertState::Located
        } else {
            RevertState::Requested
        };
        if self.has_failure() && reached < RevertState::OriginalRestored {
            RevertState::Failed
        } else {
            reached
        }
    }

    pub fn is_resolved(&self) -> bool {
        match self.kind {
            TxnKind::Replace => {
                let state = self.replace_state();
                // Scanned only: nothing beyond a read happened.
                state == TxnState::Scanned
                    || state.is_terminal()
                    || (state == TxnState::Failed && !self.needs_rollback())
            }
            TxnKind::Revert => matches!(
                self.revert_state(),
                RevertState::Reverted | RevertState::Failed
            ),
            TxnKind::Maintenance => true,
        }
    }

    /// A failed replace whose upload may have left a replacement behind.
    pub fn needs_rollback(&self) -> bool {
        self.kind == TxnKind::Replace
            && !self.succeeded(Step::Rollback)
            && !self.succeeded(Step::Commit)
            && self.attempted(Step::Upload)
    }
}

/// Group entries into transactions, ordered by first appearance.
pub fn group_transactions(entries: &[LogEntry]) -> Vec<TxnSummary> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut groups: Vec<TxnSummary> = Vec::new();
    let mut sorted: Vec<&LogEntry> = entries.iter().collect();
    sorted.sort_by_key(|e| e.seq);

    for entry in sorted {
        match index.get(entry.txn_id.as_str()) {
            Some(&i) => {
                let g = &mut groups[i];
                g.last_at = g.last_at.max(entry.at);
                g.entries.push(entry.clone());
            }
            None => {
                index.insert(entry.txn_id.as_str(), groups.len());
                groups.push(TxnSummary {
                    txn_id: entry.txn_id.clone(),
                    kind: entry.kind,
                    message: entry.message.clone(),
                    simulated: entry.simulated,
                    first_seq: entry.seq,
                    last_at: entry.at,
                    entries: vec![entry.clone()],
                });
            }
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::{StepData, ENTRY_VERSION};

    fn entry(seq: u64, txn: &str, step: Step, outcome: Outcome) -> LogEntry {
        LogEntry {
            v: ENTRY_VERSION,
            seq,
            txn_id: txn.to_string(),
            token: format!("{txn}:{step}"),
            kind: TxnKind::Replace,
            message: MessageRef::new("1", "<a@x>"),
            step,
            outcome,
            simulated: false,
            at: Utc::now(),
            data: StepData::default(),
        }
    }

    #[test]
    fn test_no_skipping() {
        let mut sm = StateMachine::new("<a@x>");
        assert!(sm.advance(TxnState::Uploading).is_err());
        sm.advance(TxnState::Extracting).unwrap();
        sm.advance(TxnState::Extracted).unwrap();
        assert!(sm.advance(TxnState::Scanned).is_err());
    }

    #[test]
    fn test_failed_is_absorbing_except_rollback() {
        let mut sm = StateMachine::resume("<a@x>", TxnState::Uploaded);
        sm.advance(TxnState::Failed).unwrap();
        assert!(sm.advance(TxnState::Verifying).is_err());
        assert!(sm.advance(TxnState::Committed).is_err());
        sm.advance(TxnState::RolledBack).unwrap();
        assert!(sm.advance(TxnState::Failed).is_err());
    }

    #[test]
    fn test_committed_cannot_fail() {
        let mut sm = StateMachine::resume("<a@x>", TxnState::Committed);
        assert!(sm.advance(TxnState::Failed).is_err());
    }

    #[test]
    fn test_full_forward_path() {
        let mut sm = StateMachine::new("<a@x>");
        for next in &FORWARD[1..] {
            sm.advance(*next).unwrap();
        }
        assert_eq!(sm.state(), TxnState::Committed);
    }

    #[test]
    fn test_replay_state_from_entries() {
        let entries = vec![
            entry(0, "t", Step::Scan, Outcome::Succeeded),
            entry(1, "t", Step::Extract, Outcome::Attempted),
            entry(2, "t", Step::Extract, Outcome::Succeeded),
            entry(3, "t", Step::Reconstruct, Outcome::Succeeded),
            entry(4, "t", Step::Upload, Outcome::Attempted),
        ];
        let g = &group_transactions(&entries)[0];
        assert_eq!(g.replace_state(), TxnState::Uploading);
        assert!(!g.is_resolved());
    }

    #[test]
    fn test_replay_failed_after_upload_needs_rollback() {
        let entries = vec![
            entry(0, "t", Step::Upload, Outcome::Attempted),
            entry(1, "t", Step::Upload, Outcome::Succeeded),
            entry(2, "t", Step::Verify, Outcome::Attempted),
            entry(3, "t", Step::Verify, Outcome::Failed),
        ];
        let g = &group_transactions(&entries)[0];
        assert_eq!(g.replace_state(), TxnState::Failed);
        assert!(g.needs_rollback());
        assert!(!g.is_resolved());
    }

    #[test]
    fn test_replay_failed_before_upload_is_resolved() {
        let entries = vec![
            entry(0, "t", Step::Extract, Outcome::Attempted),
            entry(1, "t", Step::Extract, Outcome::Failed),
        ];
        let g = &group_transactions(&entries)[0];
        assert_eq!(g.replace_state(), TxnState::Failed);
        assert!(g.is_resolved());
    }

    #[test]
    fn test_grouping_keeps_transactions_apart() {
        let entries = vec![
            entry(0, "a", Step::Scan, Outcome::Succeeded),
            entry(1, "b", Step::Scan, Outcome::Succeeded),
            entry(2, "a", Step::Extract, Outcome::Attempted),
        ];
        let groups = group_transactions(&entries);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].entries.len(), 2);
        assert_eq!(groups[1].first_seq, 1);
    }
}
