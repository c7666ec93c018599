//! Startup recovery.
//!
//! Replays the journal, finishes or rolls back every transaction a crash
//! left open, then brings the manifest in line with the journal. Every
//! resumed action is safe to repeat: labels and trash are idempotent, and
//! uploads or restores that may have happened are looked up before being
//! redone.

use std::collections::HashMap;

use tracing::{info, warn};

use crate::error::{Result, StripError};
use crate::journal::state::{group_transactions, RevertState, TxnState, TxnSummary};
use crate::journal::TxnKind;
use crate::manifest;
use crate::model::manifest::ManifestEntry;

use super::coordinator::{Active, ReplaceCoordinator};
use super::revert::RevertEngine;
use super::EngineContext;

/// What a recovery pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Unfinished transactions found in the journal.
    pub examined: usize,
    /// Replace transactions driven to `Committed`.
    pub committed: usize,
    /// Replace transactions whose replacement was removed.
    pub rolled_back: usize,
    /// Transactions interrupted before any mailbox change, marked failed.
    pub abandoned: usize,
    /// Revert transactions completed.
    pub reverted: usize,
    /// Transactions still open (a mailbox call failed again).
    pub pending: usize,
    /// Manifest entries rewritten from the journal.
    pub manifest_repaired: usize,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.examined == 0 && self.manifest_repaired == 0
    }
}

pub struct RecoveryManager<'c> {
    ctx: &'c EngineContext,
}

impl<'c> RecoveryManager<'c> {
    pub(crate) fn new(ctx: &'c EngineContext) -> Self {
        Self { ctx }
    }

    pub fn run(&self) -> Result<RecoveryReport> {
        let entries = self.ctx.log.entries()?;
        let materialized: HashMap<String, ManifestEntry> = manifest::materialize(&entries)
            .into_iter()
            .map(|e| (e.original.message_id.clone(), e))
            .collect();
        let open: Vec<TxnSummary> = group_transactions(&entries)
            .into_iter()
            .filter(|t| !t.simulated && !t.is_resolved())
            .collect();

        let mut report = RecoveryReport::default();
        for txn in &open {
            report.examined += 1;
            let message_id = txn.message.message_id.as_str();
            let _guard = match self.ctx.locks.acquire(message_id) {
                Ok(guard) => guard,
                Err(StripError::Busy(_)) => {
                    report.pending += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let entry = materialized
                .get(message_id)
                .cloned()
                .unwrap_or_else(|| ManifestEntry::scanned(txn.message.clone(), txn.last_at));

            info!(
                message_id,
                txn = %txn.txn_id,
                kind = ?txn.kind,
                "Recovering interrupted transaction"
            );
            match txn.kind {
                TxnKind::Replace => self.recover_replace(txn, entry, &mut report)?,
                TxnKind::Revert => self.recover_revert(txn, entry, &mut report)?,
                TxnKind::Maintenance => {}
            }
        }

        report.manifest_repaired = self.reconcile_manifest()?;
        if !report.is_clean() {
            info!(?report, "Recovery finished");
        }
        Ok(report)
    }

    fn recover_replace(
        &self,
        txn: &TxnSummary,
        entry: ManifestEntry,
        report: &mut RecoveryReport,
    ) -> Result<()> {
        let coordinator = ReplaceCoordinator::new(self.ctx);
        let state = txn.replace_state();
        let mut a = Active::resume(txn, entry, state);

        match state {
            // A failure was journaled but the rollback never completed.
            TxnState::Failed => {
                coordinator.rollback(&mut a)?;
                self.ctx.persist(&a.entry, false)?;
            }
            // Cut off before the upload finished: nothing to keep.
            TxnState::Extracting
            | TxnState::Extracted
            | TxnState::Reconstructed
            | TxnState::Uploading => {
                let step = a.step.to_string();
                coordinator.fail(&mut a, StripError::Interrupted(step))?;
            }
            // The replacement exists: carry on from where the journal stops.
            TxnState::Uploaded
            | TxnState::Verifying
            | TxnState::Verified
            | TxnState::LabelsApplied
            | TxnState::OriginalTrashed => {
                if let Err(e) = coordinator.finish(&mut a) {
                    coordinator.fail(&mut a, e)?;
                }
            }
            other => {
                warn!(message_id = %txn.message.message_id, state = %other, "Nothing to recover");
                return Ok(());
            }
        }

        match a.sm.state() {
            TxnState::Committed => report.committed += 1,
            TxnState::RolledBack => report.rolled_back += 1,
            TxnState::Failed if !state.upload_started() => report.abandoned += 1,
            _ => report.pending += 1,
        }
        Ok(())
    }

    fn recover_revert(
        &self,
        txn: &TxnSummary,
        entry: ManifestEntry,
        report: &mut RecoveryReport,
    ) -> Result<()> {
        match RevertEngine::new(self.ctx).resume(txn, entry) {
            Ok(RevertState::Reverted) => report.reverted += 1,
            Ok(RevertState::Failed) => report.abandoned += 1,
            Ok(_) => report.pending += 1,
            Err(e) if e.is_fatal_to_run() => return Err(e),
            Err(e) => {
                warn!(message_id = %txn.message.message_id, error = %e, "Revert still incomplete");
                report.pending += 1;
            }
        }
        Ok(())
    }

    /// Upsert every materialized entry whose status or references differ
    /// from the stored one.
    fn reconcile_manifest(&self) -> Result<usize> {
        let materialized = manifest::materialize(&self.ctx.log.entries()?);
        let mut repaired = 0;
        for entry in materialized {
            let stale = match self.ctx.manifest.get(entry.message_id())? {
                Some(current) => {
                    current.status != entry.status
                        || current.replacement != entry.replacement
                        || current.restored != entry.restored
                }
                None => true,
            };
            if stale {
                self.ctx.manifest.upsert(&entry)?;
                repaired += 1;
            }
        }
        Ok(repaired)
    }
}
