//! Restoring originals from trash.

use tracing::{info, warn};

use crate::error::{Result, StripError};
use crate::journal::state::{RevertState, TxnSummary};
use crate::journal::{Outcome, Step, StepData, Txn, TxnKind};
use crate::mailbox::MailboxClient;
use crate::manifest;
use crate::model::manifest::{ManifestEntry, ManifestStatus};
use crate::model::message::{MessageRef, SearchCriteria};

use super::coordinator::journal_retry;
use super::reconstruct;
use super::EngineContext;

/// Which entries to revert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevertTarget {
    /// One message, by Message-ID.
    One(String),
    /// Every committed entry.
    All,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevertStatus {
    Reverted,
    /// Dry run: the original is in trash and would be restored.
    WouldRevert,
    /// The original is gone from trash.
    NotRevertible,
    Failed(String),
}

/// Result of reverting one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevertOutcome {
    pub message_id: String,
    pub status: RevertStatus,
    /// The restored original, once copied back.
    pub restored: Option<MessageRef>,
}

/// A revert transaction in flight.
struct Reverting {
    txn: Txn,
    entry: ManifestEntry,
    state: RevertState,
    step: Step,
    trashed: Option<MessageRef>,
    restored: Option<MessageRef>,
    replacement: Option<MessageRef>,
}

/// Restores committed entries to their pre-strip state.
pub struct RevertEngine<'c> {
    ctx: &'c EngineContext,
}

impl<'c> RevertEngine<'c> {
    pub(crate) fn new(ctx: &'c EngineContext) -> Self {
        Self { ctx }
    }

    /// Revert one entry, or every committed one.
    ///
    /// A single target propagates its error. For `All`, per-entry failures
    /// are reported in the outcomes and only journal failures abort.
    pub fn revert(&self, target: &RevertTarget, dry_run: bool) -> Result<Vec<RevertOutcome>> {
        if let RevertTarget::One(id) = target {
            return Ok(vec![self.revert_one(id, dry_run)?]);
        }

        let committed: Vec<String> = self
            .ctx
            .manifest
            .all()?
            .into_iter()
            .filter(|e| e.status == ManifestStatus::Committed)
            .map(|e| e.original.message_id)
            .collect();

        let mut outcomes = Vec::with_capacity(committed.len());
        for id in committed {
            let outcome = match self.revert_one(&id, dry_run) {
                Ok(outcome) => outcome,
                Err(e) if e.is_fatal_to_run() => return Err(e),
                Err(StripError::NotRevertible(_)) => RevertOutcome {
                    message_id: id,
                    status: RevertStatus::NotRevertible,
                    restored: None,
                },
                Err(e) => RevertOutcome {
                    message_id: id,
                    status: RevertStatus::Failed(e.to_string()),
                    restored: None,
                },
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Revert one committed entry.
    ///
    /// Fails with [`StripError::NotRevertible`] when the original is no
    /// longer in trash; the entry stays `Committed`.
    pub fn revert_one(&self, message_id: &str, dry_run: bool) -> Result<RevertOutcome> {
        let _guard = self.ctx.locks.acquire(message_id)?;

        let entry = self
            .ctx
            .manifest
            .get(message_id)?
            .ok_or_else(|| StripError::NotCommitted {
                message_id: message_id.to_string(),
                status: "unknown".to_string(),
            })?;
        if entry.status != ManifestStatus::Committed {
            return Err(StripError::NotCommitted {
                message_id: message_id.to_string(),
                status: entry.status.to_string(),
            });
        }

        let mut r = Reverting {
            txn: self
                .ctx
                .log
                .begin(TxnKind::Revert, entry.original.clone(), dry_run),
            replacement: entry.replacement.clone(),
            entry,
            state: RevertState::Requested,
            step: Step::LocateOriginal,
            trashed: None,
            restored: None,
        };

        let intent = StepData {
            replacement: r.replacement.clone(),
            ..StepData::default()
        };
        self.record(&mut r, Step::LocateOriginal, Outcome::Attempted, intent)?;
        let found = match self.call(&r.txn, Step::LocateOriginal, |c| c.find_in_trash(message_id)) {
            Ok(found) => found,
            Err(e) => return Err(self.fail(&mut r, e)),
        };
        let Some(trashed) = found else {
            return Err(self.fail(&mut r, StripError::NotRevertible(message_id.to_string())));
        };
        self.record(
            &mut r,
            Step::LocateOriginal,
            Outcome::Succeeded,
            StepData::with_ref(trashed.clone()),
        )?;
        r.trashed = Some(trashed);
        r.state = RevertState::Located;

        if dry_run {
            info!(message_id, "Original found in trash; dry run stops here");
            return Ok(RevertOutcome {
                message_id: message_id.to_string(),
                status: RevertStatus::WouldRevert,
                restored: None,
            });
        }

        if let Err(e) = self.complete(&mut r, false) {
            return Err(self.fail(&mut r, e));
        }
        Ok(RevertOutcome {
            message_id: message_id.to_string(),
            status: RevertStatus::Reverted,
            restored: r.restored,
        })
    }

    /// Continue a journaled revert. Returns the state it ended in.
    pub(crate) fn resume(&self, summary: &TxnSummary, entry: ManifestEntry) -> Result<RevertState> {
        let state = summary.revert_state();
        let mut r = Reverting {
            txn: Txn {
                id: summary.txn_id.clone(),
                kind: TxnKind::Revert,
                message: summary.message.clone(),
                simulated: false,
            },
            entry,
            state,
            step: summary.entries.last().map_or(Step::LocateOriginal, |e| e.step),
            trashed: summary.new_ref(Step::LocateOriginal),
            restored: summary.new_ref(Step::RestoreOriginal),
            replacement: summary.replacement(),
        };

        if state == RevertState::Requested {
            // Nothing happened beyond the lookup.
            let step = r.step.to_string();
            let e = self.fail(&mut r, StripError::Interrupted(step));
            return if e.is_fatal_to_run() {
                Err(e)
            } else {
                Ok(RevertState::Failed)
            };
        }
        if let Err(e) = self.complete(&mut r, true) {
            return Err(self.fail(&mut r, e));
        }
        Ok(r.state)
    }

    /// Restore, relabel, delete the replacement, mark reverted.
    fn complete(&self, r: &mut Reverting, resuming: bool) -> Result<()> {
        let active = self.ctx.settings.active_folder.as_str();

        if r.state < RevertState::OriginalRestored {
            self.record(r, Step::RestoreOriginal, Outcome::Attempted, StepData::default())?;
            let already = if resuming { self.find_restored(r)? } else { None };
            let restored = match already {
                Some(restored) => restored,
                None => {
                    let trashed = r.trashed.clone().ok_or_else(|| {
                        StripError::NotRevertible(r.txn.message.message_id.clone())
                    })?;
                    self.call(&r.txn, Step::RestoreOriginal, |c| {
                        c.copy_from_trash(&trashed, active)
                    })?
                }
            };
            self.record(
                r,
                Step::RestoreOriginal,
                Outcome::Succeeded,
                StepData::with_ref(restored.clone()),
            )?;
            r.restored = Some(restored);
            r.state = RevertState::OriginalRestored;
        }

        if r.state < RevertState::LabelsRestored {
            self.record(r, Step::RestoreLabels, Outcome::Attempted, StepData::default())?;
            if let Some(restored) = r.restored.as_ref().filter(|_| !r.entry.labels.is_empty()) {
                self.call(&r.txn, Step::RestoreLabels, |c| {
                    c.apply_labels(restored, &r.entry.labels)
                })?;
            }
            self.record(r, Step::RestoreLabels, Outcome::Succeeded, StepData::default())?;
            r.state = RevertState::LabelsRestored;
        }

        if r.state < RevertState::ReplacementDeleted {
            self.record(r, Step::DeleteReplacement, Outcome::Attempted, StepData::default())?;
            if let Some(replacement) = r.replacement.as_ref() {
                self.call(&r.txn, Step::DeleteReplacement, |c| c.delete(replacement))?;
            }
            self.record(r, Step::DeleteReplacement, Outcome::Succeeded, StepData::default())?;
            r.state = RevertState::ReplacementDeleted;
        }

        self.record(r, Step::MarkReverted, Outcome::Succeeded, StepData::default())?;
        r.state = RevertState::Reverted;
        self.ctx.persist(&r.entry, false)?;
        info!(message_id = %r.txn.message.message_id, "Reverted");
        Ok(())
    }

    /// A copy restored before a crash: same Message-ID, no replacement marker.
    fn find_restored(&self, r: &Reverting) -> Result<Option<MessageRef>> {
        let criteria = SearchCriteria::by_message_id(
            &self.ctx.settings.active_folder,
            &r.txn.message.message_id,
        );
        let found: Vec<MessageRef> =
            self.call(&r.txn, Step::RestoreOriginal, |c| c.search(&criteria)?.collect())?;
        for candidate in found {
            if Some(&candidate) == r.replacement.as_ref() {
                continue;
            }
            let raw = self.call(&r.txn, Step::RestoreOriginal, |c| c.fetch(&candidate))?;
            if reconstruct::marker_txn(&raw).is_none() {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    /// Journal the failure of the current step. Returns the error to surface.
    fn fail(&self, r: &mut Reverting, e: StripError) -> StripError {
        if e.is_fatal_to_run() {
            return e;
        }
        let step = r.step;
        warn!(
            message_id = %r.txn.message.message_id,
            step = %step,
            error = %e,
            "Revert failed"
        );
        match self.record(r, step, Outcome::Failed, StepData::error(&e)) {
            Ok(()) => e,
            Err(log_error) => log_error,
        }
    }

    fn record(&self, r: &mut Reverting, step: Step, outcome: Outcome, data: StepData) -> Result<()> {
        if outcome == Outcome::Attempted {
            r.step = step;
        }
        let logged = self.ctx.log.record(&r.txn, step, outcome, data)?;
        if !r.txn.simulated {
            manifest::apply(&mut r.entry, &logged);
        }
        Ok(())
    }

    fn call<T>(
        &self,
        txn: &Txn,
        step: Step,
        op: impl FnMut(&dyn MailboxClient) -> Result<T>,
    ) -> Result<T> {
        let log = &self.ctx.log;
        self.ctx.gateway.call(
            step.as_str(),
            &mut |attempt, e: &StripError| journal_retry(log, txn, step, attempt, e),
            op,
        )
    }
}
