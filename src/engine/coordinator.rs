//! Two-phase replace of a single message.
//!
//! The replacement is uploaded and verified before the original is touched.
//! Every side effect is bracketed by an `attempted` journal record before it
//! and a `succeeded`/`failed` record after it, so recovery can always tell
//! what may have happened.

use std::collections::BTreeSet;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::backup::BackupStore;
use crate::error::{Result, StripError};
use crate::journal::state::{StateMachine, TxnState, TxnSummary};
use crate::journal::{Outcome, Step, StepData, TransactionLog, Txn, TxnKind};
use crate::mailbox::MailboxClient;
use crate::manifest;
use crate::model::attachment::{AttachmentRecord, Digest};
use crate::model::manifest::ManifestEntry;
use crate::model::message::{MessageRef, SearchCriteria};
use crate::parser::{header, mime};

use super::extract::{AttachmentExtractor, Inspection};
use super::reconstruct::{self, MessageReconstructor};
use super::EngineContext;

/// What happened to one message.
#[derive(Debug, Clone)]
pub struct ProcessResult {
    /// The message's entry after the run. For dry runs this is the entry the
    /// run would have produced; nothing was persisted.
    pub entry: ManifestEntry,
    pub simulated: bool,
    /// Not attempted: the entry was not eligible (committed, reverted or
    /// encrypted earlier), or another copy with the same Message-ID was in
    /// flight.
    pub skipped: bool,
}

/// A replace transaction in flight.
pub(crate) struct Active {
    pub txn: Txn,
    pub sm: StateMachine,
    pub entry: ManifestEntry,
    /// Step of the last `attempted` record.
    pub step: Step,
    pub labels: BTreeSet<String>,
    pub records: Vec<AttachmentRecord>,
    pub replacement: Option<MessageRef>,
    /// Replacement bytes of a dry run, which never uploads them.
    pub replacement_bytes: Option<Vec<u8>>,
}

impl Active {
    /// Pick up a journaled transaction at `state`.
    pub(crate) fn resume(summary: &TxnSummary, entry: ManifestEntry, state: TxnState) -> Self {
        Self {
            txn: Txn {
                id: summary.txn_id.clone(),
                kind: TxnKind::Replace,
                message: summary.message.clone(),
                simulated: false,
            },
            sm: StateMachine::resume(summary.message.message_id.clone(), state),
            entry,
            step: summary.entries.last().map_or(Step::Scan, |e| e.step),
            labels: summary.labels(),
            records: summary.attachments(),
            replacement: summary.replacement(),
            replacement_bytes: None,
        }
    }

    fn into_result(self) -> ProcessResult {
        ProcessResult {
            entry: self.entry,
            simulated: self.txn.simulated,
            skipped: false,
        }
    }
}

/// Where the original message was found.
enum OriginalPlace {
    Active,
    Trashed,
    Unknown,
}

/// Drives replace transactions.
pub struct ReplaceCoordinator<'c> {
    ctx: &'c EngineContext,
}

impl<'c> ReplaceCoordinator<'c> {
    pub(crate) fn new(ctx: &'c EngineContext) -> Self {
        Self { ctx }
    }

    /// Strip one message.
    ///
    /// Per-message failures come back as `Ok` with a `Failed` or `RolledBack`
    /// entry. `Err` means the message was not attempted ([`StripError::Busy`])
    /// or the run must stop ([`StripError::LogWrite`]).
    pub fn process_one(&self, msg: &MessageRef, dry_run: bool) -> Result<ProcessResult> {
        let _guard = self.ctx.locks.acquire(&msg.message_id)?;

        let existing = self.ctx.manifest.get(&msg.message_id)?;
        if let Some(entry) = existing.as_ref() {
            if !entry.status.is_eligible_for_processing() {
                debug!(message_id = %msg.message_id, status = %entry.status, "Not eligible, skipping");
                return Ok(ProcessResult {
                    entry: entry.clone(),
                    simulated: dry_run,
                    skipped: true,
                });
            }
        }

        let mut active = Active {
            txn: self.ctx.log.begin(TxnKind::Replace, msg.clone(), dry_run),
            sm: StateMachine::new(msg.message_id.clone()),
            entry: existing.unwrap_or_else(|| ManifestEntry::scanned(msg.clone(), Utc::now())),
            step: Step::Scan,
            labels: BTreeSet::new(),
            records: Vec::new(),
            replacement: None,
            replacement_bytes: None,
        };

        if let Err(e) = self.run(&mut active) {
            self.fail(&mut active, e)?;
        }
        Ok(active.into_result())
    }

    fn run(&self, a: &mut Active) -> Result<()> {
        let simulated = a.txn.simulated;
        let msg = a.txn.message.clone();

        self.record(a, Step::Scan, Outcome::Attempted, StepData::default())?;
        let raw = self.call(&a.txn, Step::Scan, |c| c.fetch(&msg))?;
        let labels = self.call(&a.txn, Step::Scan, |c| c.labels(&msg))?;
        let headers = header::summarize(header::header_block(&raw));
        if headers.message_id.is_empty() {
            return Err(StripError::Mime(format!(
                "message {} has no Message-ID",
                msg.mailbox_id
            )));
        }
        if headers.message_id != msg.message_id {
            return Err(StripError::Mime(format!(
                "message {} carries Message-ID {} instead of {}",
                msg.mailbox_id, headers.message_id, msg.message_id
            )));
        }
        let tree = mime::parse_tree(&raw)?;
        a.labels = labels.clone();
        self.record(
            a,
            Step::Scan,
            Outcome::Succeeded,
            StepData {
                labels: Some(labels),
                subject: Some(headers.subject.clone()),
                original_size: Some(raw.len() as u64),
                ..StepData::default()
            },
        )?;

        let extractor = AttachmentExtractor {
            backups: self.ctx.backups.as_ref(),
            layout: self.ctx.settings.layout.as_ref(),
            inline_policy: self.ctx.settings.inline_policy.as_ref(),
            max_attachment_size: self.ctx.settings.max_attachment_size,
        };
        let classification = match extractor.classify(&tree) {
            Inspection::Encrypted => {
                self.record(a, Step::SkipEncrypted, Outcome::Succeeded, StepData::default())?;
                a.sm.advance(TxnState::SkippedEncrypted)?;
                info!(message_id = %msg.message_id, "Encrypted message left untouched");
                return self.ctx.persist(&a.entry, simulated);
            }
            Inspection::Plain(c) => c,
        };
        if classification.attachments().next().is_none() {
            debug!(message_id = %msg.message_id, "No attachments");
            return self.ctx.persist(&a.entry, simulated);
        }

        // Extract
        a.sm.advance(TxnState::Extracting)?;
        self.record(a, Step::Extract, Outcome::Attempted, StepData::default())?;
        self.ctx.persist(&a.entry, simulated)?;
        let records = extractor.extract(&classification, &headers, simulated)?;
        a.records = records.clone();
        self.record(
            a,
            Step::Extract,
            Outcome::Succeeded,
            StepData {
                attachments: records,
                ..StepData::default()
            },
        )?;
        a.sm.advance(TxnState::Extracted)?;

        // Reconstruct
        self.record(a, Step::Reconstruct, Outcome::Attempted, StepData::default())?;
        let rebuilt = MessageReconstructor::rebuild(&tree, &a.records, &a.txn.id)?;
        reconstruct::validate_headers(&raw, &rebuilt)?;
        self.record(
            a,
            Step::Reconstruct,
            Outcome::Succeeded,
            StepData {
                stripped_size: Some(rebuilt.len() as u64),
                replacement_digest: Some(Digest::of(&rebuilt)),
                ..StepData::default()
            },
        )?;
        a.sm.advance(TxnState::Reconstructed)?;

        // Upload
        a.sm.advance(TxnState::Uploading)?;
        self.record(a, Step::Upload, Outcome::Attempted, StepData::default())?;
        let replacement = if simulated {
            MessageRef::new("dry-run", msg.message_id.clone())
        } else {
            self.upload(a, &rebuilt)?
        };
        if simulated {
            a.replacement_bytes = Some(rebuilt);
        }
        a.replacement = Some(replacement.clone());
        self.record(a, Step::Upload, Outcome::Succeeded, StepData::with_ref(replacement))?;
        a.sm.advance(TxnState::Uploaded)?;

        self.finish(a)
    }

    /// Upload the replacement. A retried upload may have landed more than
    /// once, so copies carrying this transaction's marker are pruned.
    fn upload(&self, a: &Active, rebuilt: &[u8]) -> Result<MessageRef> {
        let log = &self.ctx.log;
        let txn = &a.txn;
        let folder = self.ctx.settings.active_folder.as_str();
        let mut retried = false;
        let uploaded = self.ctx.gateway.call(
            Step::Upload.as_str(),
            &mut |attempt, e: &StripError| {
                retried = true;
                journal_retry(log, txn, Step::Upload, attempt, e)
            },
            |c| c.upload(rebuilt, folder),
        )?;
        if retried {
            let pruned = self.remove_copies(txn, Step::Upload, Some(&uploaded))?;
            if pruned > 0 {
                warn!(message_id = %txn.message.message_id, pruned, "Removed duplicate uploads");
            }
        }
        Ok(uploaded)
    }

    /// Verify, label, trash and commit, starting wherever `a` stands.
    pub(crate) fn finish(&self, a: &mut Active) -> Result<()> {
        if a.sm.state() < TxnState::Verified {
            self.verify(a)?;
        }
        if a.sm.state() < TxnState::LabelsApplied {
            self.apply_labels(a)?;
        }
        if a.sm.state() < TxnState::OriginalTrashed {
            self.trash_original(a)?;
        }
        self.commit(a)
    }

    fn verify(&self, a: &mut Active) -> Result<()> {
        if a.sm.state() == TxnState::Uploaded {
            a.sm.advance(TxnState::Verifying)?;
        }
        self.record(a, Step::Verify, Outcome::Attempted, StepData::default())?;
        let replacement = a.replacement.clone().ok_or_else(|| {
            StripError::Remote(format!(
                "no replacement recorded for {}",
                a.txn.message.message_id
            ))
        })?;
        let fetched = match a.replacement_bytes.take() {
            Some(bytes) => bytes,
            None => self.call(&a.txn, Step::Verify, |c| c.fetch(&replacement))?,
        };
        let backups = if a.txn.simulated {
            None
        } else {
            Some(self.ctx.backups.as_ref())
        };
        verify_replacement(&fetched, &a.txn.message.message_id, &a.records, backups)?;
        self.record(a, Step::Verify, Outcome::Succeeded, StepData::default())?;
        a.sm.advance(TxnState::Verified)
    }

    fn apply_labels(&self, a: &mut Active) -> Result<()> {
        self.record(a, Step::ApplyLabels, Outcome::Attempted, StepData::default())?;
        if !a.txn.simulated && !a.labels.is_empty() {
            if let Some(replacement) = a.replacement.as_ref() {
                self.call(&a.txn, Step::ApplyLabels, |c| {
                    c.apply_labels(replacement, &a.labels)
                })?;
            }
        }
        self.record(a, Step::ApplyLabels, Outcome::Succeeded, StepData::default())?;
        a.sm.advance(TxnState::LabelsApplied)
    }

    fn trash_original(&self, a: &mut Active) -> Result<()> {
        self.record(a, Step::TrashOriginal, Outcome::Attempted, StepData::default())?;
        if !a.txn.simulated {
            self.call(&a.txn, Step::TrashOriginal, |c| c.trash(&a.txn.message))?;
        }
        self.record(a, Step::TrashOriginal, Outcome::Succeeded, StepData::default())?;
        a.sm.advance(TxnState::OriginalTrashed)
    }

    fn commit(&self, a: &mut Active) -> Result<()> {
        self.record(a, Step::Commit, Outcome::Succeeded, StepData::default())?;
        a.sm.advance(TxnState::Committed)?;
        self.ctx.persist(&a.entry, a.txn.simulated)?;
        info!(
            message_id = %a.txn.message.message_id,
            attachments = a.records.len(),
            simulated = a.txn.simulated,
            "Committed"
        );
        Ok(())
    }

    /// Record a failure at the current step and roll back if the
    /// replacement may exist. Journal failures are passed through.
    pub(crate) fn fail(&self, a: &mut Active, e: StripError) -> Result<()> {
        if e.is_fatal_to_run() {
            return Err(e);
        }
        let step = a.step;
        warn!(
            message_id = %a.txn.message.message_id,
            step = %step,
            error = %e,
            "Transaction failed"
        );
        if step == Step::TrashOriginal && !a.txn.simulated {
            match self.locate_original(&a.txn) {
                OriginalPlace::Active => {}
                OriginalPlace::Trashed => {
                    info!(
                        message_id = %a.txn.message.message_id,
                        "Original reached trash despite the error, committing"
                    );
                    self.record(a, Step::TrashOriginal, Outcome::Succeeded, StepData::default())?;
                    a.sm.advance(TxnState::OriginalTrashed)?;
                    return self.commit(a);
                }
                OriginalPlace::Unknown => {
                    warn!(
                        message_id = %a.txn.message.message_id,
                        "Original location unknown, leaving the transaction to recovery"
                    );
                    return Ok(());
                }
            }
        }
        self.record(a, step, Outcome::Failed, StepData::error(&e))?;
        let upload_started = a.sm.state().upload_started();
        a.sm.advance(TxnState::Failed)?;
        if upload_started {
            self.rollback(a)?;
        }
        self.ctx.persist(&a.entry, a.txn.simulated)
    }

    /// Where the original is after a trash call whose outcome is unknown.
    /// Lookups are read-only, so their retries are not journaled.
    fn locate_original(&self, txn: &Txn) -> OriginalPlace {
        let gateway = &self.ctx.gateway;
        let original = &txn.message;
        let criteria =
            SearchCriteria::by_message_id(&self.ctx.settings.active_folder, &original.message_id);
        let active = gateway.call("search", &mut |_, _| Ok(()), |c| {
            c.search(&criteria)?.collect::<Result<Vec<_>>>()
        });
        if let Ok(found) = &active {
            if found.contains(original) {
                return OriginalPlace::Active;
            }
        }
        let trashed = gateway.call("find_in_trash", &mut |_, _| Ok(()), |c| {
            c.find_in_trash(&original.message_id)
        });
        match (active, trashed) {
            (_, Ok(Some(found))) if &found == original => OriginalPlace::Trashed,
            (Ok(_), Ok(_)) => {
                warn!(message_id = %original.message_id, "Original is in neither folder");
                OriginalPlace::Unknown
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(message_id = %original.message_id, error = %e, "Could not locate original");
                OriginalPlace::Unknown
            }
        }
    }

    /// Delete the replacement so the original stands alone again.
    ///
    /// A failed rollback is journaled and left for the next recovery pass.
    pub(crate) fn rollback(&self, a: &mut Active) -> Result<()> {
        self.record(
            a,
            Step::Rollback,
            Outcome::Attempted,
            StepData {
                replacement: a.replacement.clone(),
                ..StepData::default()
            },
        )?;
        if !a.txn.simulated {
            if let Err(e) = self.remove_replacement(a) {
                if e.is_fatal_to_run() {
                    return Err(e);
                }
                warn!(
                    message_id = %a.txn.message.message_id,
                    error = %e,
                    "Rollback failed, leaving it to recovery"
                );
                return self.record(a, Step::Rollback, Outcome::Failed, StepData::error(&e));
            }
        }
        self.record(a, Step::Rollback, Outcome::Succeeded, StepData::default())?;
        a.sm.advance(TxnState::RolledBack)?;
        info!(message_id = %a.txn.message.message_id, "Rolled back");
        Ok(())
    }

    fn remove_replacement(&self, a: &Active) -> Result<()> {
        if let Some(replacement) = a.replacement.as_ref() {
            self.call(&a.txn, Step::Rollback, |c| c.delete(replacement))?;
        }
        self.remove_copies(&a.txn, Step::Rollback, None)?;
        Ok(())
    }

    /// Delete active-folder messages carrying this transaction's marker,
    /// except `keep`. The original never carries it.
    fn remove_copies(&self, txn: &Txn, step: Step, keep: Option<&MessageRef>) -> Result<usize> {
        let criteria =
            SearchCriteria::by_message_id(&self.ctx.settings.active_folder, &txn.message.message_id);
        let found: Vec<MessageRef> =
            self.call(txn, step, |c| c.search(&criteria)?.collect())?;

        let mut removed = 0;
        for candidate in found {
            if candidate == txn.message || Some(&candidate) == keep {
                continue;
            }
            let raw = self.call(txn, step, |c| c.fetch(&candidate))?;
            if reconstruct::marker_txn(&raw).as_deref() == Some(txn.id.as_str()) {
                self.call(txn, step, |c| c.delete(&candidate))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Journal a step record and fold it into the in-memory entry.
    fn record(&self, a: &mut Active, step: Step, outcome: Outcome, data: StepData) -> Result<()> {
        if outcome == Outcome::Attempted {
            a.step = step;
        }
        let logged = self.ctx.log.record(&a.txn, step, outcome, data)?;
        manifest::apply(&mut a.entry, &logged);
        Ok(())
    }

    /// A mailbox call whose retries are journaled as repeated intents.
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

pub(crate) fn journal_retry(
    log: &TransactionLog,
    txn: &Txn,
    step: Step,
    attempt: u32,
    e: &StripError,
) -> Result<()> {
    log.record(
        txn,
        step,
        Outcome::Attempted,
        StepData {
            attempt: Some(attempt),
            error: Some(e.to_string()),
            ..StepData::default()
        },
    )?;
    Ok(())
}

/// Check a fetched replacement against the attachment records.
///
/// The Message-ID must be the original's and every record must have a
/// placeholder with the same digest and size. With `backups`, each backup is
/// also read back and re-hashed.
pub fn verify_replacement(
    raw: &[u8],
    message_id: &str,
    records: &[AttachmentRecord],
    backups: Option<&dyn BackupStore>,
) -> Result<()> {
    let found = header::summarize(header::header_block(raw)).message_id;
    if found != message_id {
        return Err(StripError::Mime(format!(
            "replacement carries Message-ID '{found}', expected '{message_id}'"
        )));
    }
    let placeholders = reconstruct::parse_placeholders(raw)?;
    for record in records {
        if !placeholders
            .iter()
            .any(|p| p.digest == record.digest && p.size == record.size)
        {
            return Err(StripError::BackupIntegrity {
                path: record.backup_path.clone(),
                expected: record.digest.to_string(),
                actual: "no matching placeholder in replacement".to_string(),
            });
        }
        if let Some(store) = backups {
            let actual = Digest::of(&store.read(&record.backup_path)?);
            if actual != record.digest {
                return Err(StripError::BackupIntegrity {
                    path: record.backup_path.clone(),
                    expected: record.digest.to_string(),
                    actual: actual.to_string(),
                });
            }
        }
    }
    Ok(())
}
