//! End-to-end tests for replace, revert and recovery over in-memory collaborators.

mod common;

use mailstrip::backup::BackupStore;
use mailstrip::engine::reconstruct::{marker_txn, parse_placeholders};
use mailstrip::engine::{RevertStatus, RevertTarget};
use mailstrip::error::StripError;
use mailstrip::export::ExportFormat;
use mailstrip::journal::{Outcome, Step};
use mailstrip::mailbox::memory::{
    OP_APPLY_LABELS, OP_COPY_FROM_TRASH, OP_DELETE, OP_PERMANENTLY_DELETE, OP_SEARCH, OP_TRASH,
    OP_UPLOAD,
};
use mailstrip::model::attachment::Digest;
use mailstrip::model::manifest::ManifestStatus;
use mailstrip::model::message::SearchCriteria;

use common::*;

fn all() -> SearchCriteria {
    SearchCriteria::default()
}

// ─── Test 1: 5 MB PDF is stripped, committed and reverted ───────────

#[test]
fn test_large_pdf_commit_then_revert() {
    let h = Harness::new();
    let blocks = 1_747_627; // 5_242_881 bytes decoded
    let original = pdf_message("<abc@x>", blocks);
    h.mailbox.insert(ACTIVE, &original, &["INBOX", "Work"]);

    let results = h.engine.process(&all(), false).unwrap();
    assert_eq!(results.len(), 1);
    let entry = &results[0].entry;
    assert_eq!(entry.status, ManifestStatus::Committed);
    assert_eq!(entry.attachments.len(), 1);

    let record = &entry.attachments[0];
    assert_eq!(record.filename, "report.pdf");
    assert!(record.content_type.starts_with("application/pdf"));
    assert_eq!(record.size, 5_242_881);
    assert_eq!(record.digest, Digest::of(&pdf_payload(blocks)));

    // The backup holds exactly the decoded attachment.
    let backed_up = h.backups.read(&record.backup_path).unwrap();
    assert_eq!(Digest::of(&backed_up), record.digest);

    // Replacement in the active folder, original in trash.
    let active = h.mailbox.folder(ACTIVE);
    assert_eq!(active.len(), 1);
    let (_, replacement) = &active[0];
    assert_eq!(replacement.message_id, "<abc@x>");
    assert!(replacement.raw.len() < 10_000);
    assert!(marker_txn(&replacement.raw).is_some());
    assert!(replacement.labels.contains("INBOX"));
    assert!(replacement.labels.contains("Work"));
    let placeholders = parse_placeholders(&replacement.raw).unwrap();
    assert_eq!(placeholders.len(), 1);
    assert_eq!(placeholders[0].digest, record.digest);
    assert_eq!(h.raw_in(TRASH), vec![original.clone()]);

    let stored = h.engine.manifest_entries().unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].status, ManifestStatus::Committed);
    assert!(stored[0].stripped_size.unwrap() < stored[0].original_size);

    // Revert restores the original bytes and labels.
    let outcomes = h
        .engine
        .revert(&RevertTarget::One("<abc@x>".into()), false)
        .unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].status, RevertStatus::Reverted);
    assert!(outcomes[0].restored.is_some());

    let active = h.mailbox.folder(ACTIVE);
    assert_eq!(active.len(), 1);
    let (_, restored) = &active[0];
    assert_eq!(restored.raw, original);
    assert!(restored.labels.contains("Work"));
    assert_eq!(
        h.engine.manifest_entries().unwrap()[0].status,
        ManifestStatus::Reverted
    );
    assert_eq!(h.mailbox.calls(OP_PERMANENTLY_DELETE), 0);
}

#[test]
fn test_empty_attachment_digest_round_trip() {
    let h = Harness::new();
    h.mailbox.insert(ACTIVE, &pdf_message("<empty@x>", 0), &[]);

    let results = h.engine.process(&all(), false).unwrap();
    let entry = &results[0].entry;
    assert_eq!(entry.status, ManifestStatus::Committed);
    assert_eq!(entry.attachments.len(), 1);

    let record = &entry.attachments[0];
    assert_eq!(record.size, 0);
    assert_eq!(record.digest, Digest::of(b""));
    let backed_up = h.backups.read(&record.backup_path).unwrap();
    assert!(backed_up.is_empty());
    assert_eq!(Digest::of(&backed_up), record.digest);
}

// ─── Test 2: Encrypted messages are never touched ───────────────────

#[test]
fn test_encrypted_message_is_skipped() {
    let h = Harness::new();
    h.mailbox.insert(ACTIVE, &encrypted_message("<enc@x>"), &[]);

    let results = h.engine.process(&all(), false).unwrap();
    assert_eq!(results[0].entry.status, ManifestStatus::SkippedEncrypted);
    assert_eq!(h.mailbox.mutating_calls(), 0);
    assert!(h.backups.is_empty());

    // A second run leaves it alone as well.
    let again = h.engine.process(&all(), false).unwrap();
    assert!(again[0].skipped);
    assert_eq!(h.mailbox.mutating_calls(), 0);
}

// ─── Test 3: Messages without attachments stay scanned ──────────────

#[test]
fn test_message_without_attachments() {
    let h = Harness::new();
    h.mailbox.insert(ACTIVE, &plain_message("<plain@x>"), &[]);

    let results = h.engine.process(&all(), false).unwrap();
    assert_eq!(results[0].entry.status, ManifestStatus::Scanned);
    assert!(results[0].entry.replacement.is_none());
    assert_eq!(h.mailbox.mutating_calls(), 0);
}

// ─── Test 4: Dry run changes nothing ────────────────────────────────

#[test]
fn test_dry_run_has_no_side_effects() {
    let h = Harness::new();
    let original = pdf_message("<dry@x>", 100);
    h.mailbox.insert(ACTIVE, &original, &["INBOX"]);

    let results = h.engine.process(&all(), true).unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].simulated);
    assert_eq!(results[0].entry.status, ManifestStatus::Committed);
    assert_eq!(results[0].entry.attachments.len(), 1);

    assert_eq!(h.mailbox.mutating_calls(), 0);
    assert!(h.backups.is_empty());
    assert!(h.engine.manifest_entries().unwrap().is_empty());
    assert_eq!(h.raw_in(ACTIVE), vec![original]);

    let journal = h.journal.snapshot();
    assert!(!journal.is_empty());
    assert!(journal.iter().all(|e| e.simulated));
}

// ─── Test 5: Verification failure rolls back ────────────────────────

#[test]
fn test_verify_mismatch_rolls_back() {
    let h = Harness::new();
    let original = pdf_message("<bad@x>", 50);
    h.mailbox.insert(ACTIVE, &original, &["INBOX"]);

    // The mailbox mangles the placeholder digest on upload.
    let hex = Digest::of(&pdf_payload(50)).hex().to_string();
    let zeros = "0".repeat(hex.len());
    h.mailbox.set_upload_filter(move |raw| {
        String::from_utf8_lossy(&raw)
            .replace(&hex, &zeros)
            .into_bytes()
    });

    let results = h.engine.process(&all(), false).unwrap();
    let entry = &results[0].entry;
    assert_eq!(entry.status, ManifestStatus::RolledBack);
    assert!(entry.replacement.is_none());
    assert!(entry.error.is_some());

    assert_eq!(h.raw_in(ACTIVE), vec![original]);
    assert!(h.raw_in(TRASH).is_empty());
    assert_eq!(h.mailbox.calls(OP_TRASH), 0);
}

#[test]
fn test_rolled_back_message_can_be_processed_again() {
    let h = Harness::new();
    h.mailbox.insert(ACTIVE, &pdf_message("<again@x>", 50), &[]);
    h.mailbox.fail_next(OP_UPLOAD, 1, false);

    let first = h.engine.process(&all(), false).unwrap();
    assert_eq!(first[0].entry.status, ManifestStatus::RolledBack);

    let second = h.engine.process(&all(), false).unwrap();
    assert_eq!(second[0].entry.status, ManifestStatus::Committed);
    assert!(second[0].entry.error.is_none());
}

// ─── Test 6: Transient errors are retried and journaled ─────────────

#[test]
fn test_transient_upload_failures_are_retried() {
    let h = Harness::new();
    h.mailbox.insert(ACTIVE, &pdf_message("<retry@x>", 50), &[]);
    h.mailbox.fail_next(OP_UPLOAD, 2, true);

    let results = h.engine.process(&all(), false).unwrap();
    assert_eq!(results[0].entry.status, ManifestStatus::Committed);
    assert_eq!(h.mailbox.calls(OP_UPLOAD), 3);

    let upload_intents = h
        .journal
        .snapshot()
        .iter()
        .filter(|e| e.step == Step::Upload && e.outcome == Outcome::Attempted)
        .count();
    assert_eq!(upload_intents, 3);

    // Exactly one replacement survives.
    assert_eq!(h.mailbox.folder(ACTIVE).len(), 1);
}

// ─── Test 7: Crash after upload, recovery commits ───────────────────

#[test]
fn test_recovery_after_crash_post_upload() {
    let h = Harness::new();
    h.mailbox.insert(ACTIVE, &pdf_message("<crash@x>", 50), &["INBOX"]);

    // Eight records make it through the upload; the verify intent does not.
    h.journal.fail_after(8);
    let err = h.engine.process(&all(), false).unwrap_err();
    assert!(matches!(err, StripError::LogWrite(_)));
    assert_eq!(h.mailbox.folder(ACTIVE).len(), 2);
    assert_eq!(
        h.statuses(),
        vec![ManifestStatus::Processing]
    );

    let restarted = h.restart();
    let report = restarted.engine.recover().unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.committed, 1);

    let active = restarted.mailbox.folder(ACTIVE);
    assert_eq!(active.len(), 1);
    assert!(marker_txn(&active[0].1.raw).is_some());
    assert_eq!(restarted.raw_in(TRASH).len(), 1);
    assert_eq!(
        restarted.statuses(),
        vec![ManifestStatus::Committed]
    );

    // Running recovery again finds nothing to do.
    assert!(restarted.engine.recover().unwrap().is_clean());
    assert_eq!(restarted.raw_in(TRASH).len(), 1);
}

#[test]
fn test_recovery_abandons_crash_before_upload() {
    let h = Harness::new();
    let original = pdf_message("<early@x>", 50);
    h.mailbox.insert(ACTIVE, &original, &[]);

    // The upload intent is never written, so the upload never happens.
    h.journal.fail_after(6);
    assert!(h.engine.process(&all(), false).is_err());
    assert_eq!(h.mailbox.calls(OP_UPLOAD), 0);

    let restarted = h.restart();
    let report = restarted.engine.recover().unwrap();
    assert_eq!(report.abandoned, 1);
    assert_eq!(
        restarted.statuses(),
        vec![ManifestStatus::Failed]
    );
    assert_eq!(restarted.raw_in(ACTIVE), vec![original]);

    // The failed entry is eligible again.
    let results = restarted.engine.process(&all(), false).unwrap();
    assert_eq!(results[0].entry.status, ManifestStatus::Committed);
}

#[test]
fn test_recovery_reissues_interrupted_trash() {
    let h = Harness::new();
    h.mailbox.insert(ACTIVE, &pdf_message("<trash@x>", 50), &[]);

    // The trash intent lands and the call runs; its success record does not.
    h.journal.fail_after(13);
    assert!(h.engine.process(&all(), false).is_err());
    assert_eq!(h.mailbox.calls(OP_TRASH), 1);

    let restarted = h.restart();
    let report = restarted.engine.recover().unwrap();
    assert_eq!(report.committed, 1);
    assert_eq!(restarted.mailbox.calls(OP_TRASH), 2);
    assert_eq!(restarted.raw_in(TRASH).len(), 1);
    assert_eq!(restarted.mailbox.folder(ACTIVE).len(), 1);
}

#[test]
fn test_recovery_rolls_back_when_backup_is_corrupt() {
    let h = Harness::new();
    let original = pdf_message("<rot@x>", 50);
    h.mailbox.insert(ACTIVE, &original, &[]);

    h.journal.fail_after(8);
    assert!(h.engine.process(&all(), false).is_err());

    let backup_path = h
        .journal
        .snapshot()
        .iter()
        .find(|e| e.step == Step::Extract && e.outcome == Outcome::Succeeded)
        .map(|e| e.data.attachments[0].backup_path.clone())
        .unwrap();
    h.backups.corrupt_reads_of(backup_path);

    let restarted = h.restart();
    let report = restarted.engine.recover().unwrap();
    assert_eq!(report.rolled_back, 1);
    assert_eq!(
        restarted.statuses(),
        vec![ManifestStatus::RolledBack]
    );
    assert_eq!(restarted.raw_in(ACTIVE), vec![original]);
    assert!(restarted.raw_in(TRASH).is_empty());
}

#[test]
fn test_recovery_removes_upload_without_success_record() {
    let h = Harness::new();
    let original = pdf_message("<half@x>", 50);
    h.mailbox.insert(ACTIVE, &original, &["INBOX"]);

    // The upload intent lands and the upload runs; its success record does not.
    h.journal.fail_after(7);
    assert!(h.engine.process(&all(), false).is_err());
    assert_eq!(h.mailbox.calls(OP_UPLOAD), 1);
    assert_eq!(h.mailbox.folder(ACTIVE).len(), 2);

    let restarted = h.restart();
    let report = restarted.engine.recover().unwrap();
    assert_eq!(report.rolled_back, 1);
    assert_eq!(restarted.raw_in(ACTIVE), vec![original]);
    assert!(restarted.raw_in(TRASH).is_empty());
    assert_eq!(restarted.statuses(), vec![ManifestStatus::RolledBack]);
}

// ─── Test 8: Failures around labelling and trashing ─────────────────

#[test]
fn test_label_failure_rolls_back() {
    let h = Harness::new();
    let original = pdf_message("<label@x>", 50);
    h.mailbox.insert(ACTIVE, &original, &["INBOX"]);
    h.mailbox.fail_next(OP_APPLY_LABELS, 1, false);

    let results = h.engine.process(&all(), false).unwrap();
    assert_eq!(results[0].entry.status, ManifestStatus::RolledBack);
    assert_eq!(h.raw_in(ACTIVE), vec![original]);
    assert!(h.raw_in(TRASH).is_empty());
    assert_eq!(h.mailbox.calls(OP_TRASH), 0);
}

#[test]
fn test_trash_that_landed_without_reply_commits() {
    let h = Harness::new();
    let original = pdf_message("<landed@x>", 50);
    h.mailbox.insert(ACTIVE, &original, &["INBOX"]);
    // Every attempt moves the message, every reply is lost.
    h.mailbox.lose_replies(OP_TRASH, 3);

    let results = h.engine.process(&all(), false).unwrap();
    assert_eq!(results[0].entry.status, ManifestStatus::Committed);
    assert_eq!(h.raw_in(TRASH), vec![original.clone()]);
    let active = h.mailbox.folder(ACTIVE);
    assert_eq!(active.len(), 1);
    assert!(marker_txn(&active[0].1.raw).is_some());
    assert_eq!(h.mailbox.calls(OP_DELETE), 0);

    let outcomes = h
        .engine
        .revert(&RevertTarget::One("<landed@x>".into()), false)
        .unwrap();
    assert_eq!(outcomes[0].status, RevertStatus::Reverted);
    assert_eq!(h.raw_in(ACTIVE), vec![original]);
}

#[test]
fn test_trash_failure_with_original_still_active_rolls_back() {
    let h = Harness::new();
    let original = pdf_message("<stays@x>", 50);
    h.mailbox.insert(ACTIVE, &original, &["INBOX"]);
    h.mailbox.fail_next(OP_TRASH, 1, false);

    let results = h.engine.process(&all(), false).unwrap();
    assert_eq!(results[0].entry.status, ManifestStatus::RolledBack);
    assert_eq!(h.raw_in(ACTIVE), vec![original]);
    assert!(h.raw_in(TRASH).is_empty());
}

#[test]
fn test_trash_outcome_unknown_is_left_to_recovery() {
    let h = Harness::new();
    let original = pdf_message("<limbo@x>", 50);
    let msg = h.mailbox.insert(ACTIVE, &original, &["INBOX"]);
    h.mailbox.fail_next(OP_TRASH, 1, false);
    // The lookup of the active folder fails too, so nothing can be concluded.
    h.mailbox.fail_next(OP_SEARCH, 1, false);

    let result = h.engine.process_message(&msg, false).unwrap();
    assert_eq!(result.entry.status, ManifestStatus::Processing);
    assert_eq!(h.mailbox.folder(ACTIVE).len(), 2);
    assert_eq!(h.mailbox.calls(OP_DELETE), 0);

    let restarted = h.restart();
    let report = restarted.engine.recover().unwrap();
    assert_eq!(report.committed, 1);
    assert_eq!(restarted.raw_in(TRASH), vec![original]);
    assert_eq!(restarted.statuses(), vec![ManifestStatus::Committed]);
}

// ─── Test 9: Revert edge cases ──────────────────────────────────────

#[test]
fn test_revert_after_trash_purge_is_not_revertible() {
    let h = Harness::new();
    h.mailbox.insert(ACTIVE, &pdf_message("<gone@x>", 50), &[]);
    h.engine.process(&all(), false).unwrap();

    let (trashed_id, _) = h.mailbox.folder(TRASH).remove(0);
    h.mailbox.purge(&trashed_id);

    let err = h
        .engine
        .revert(&RevertTarget::One("<gone@x>".into()), false)
        .unwrap_err();
    assert!(matches!(err, StripError::NotRevertible(_)));
    assert_eq!(
        h.statuses(),
        vec![ManifestStatus::Committed]
    );
    assert_eq!(h.mailbox.calls(OP_COPY_FROM_TRASH), 0);
}

#[test]
fn test_revert_all_reports_each_message() {
    let h = Harness::new();
    h.mailbox.insert(ACTIVE, &pdf_message("<a@x>", 40), &[]);
    h.mailbox.insert(ACTIVE, &pdf_message("<b@x>", 41), &[]);
    h.engine.process(&all(), false).unwrap();

    let (purged, _) = h
        .mailbox
        .folder(TRASH)
        .into_iter()
        .find(|(_, m)| m.message_id == "<b@x>")
        .unwrap();
    h.mailbox.purge(&purged);

    let outcomes = h.engine.revert(&RevertTarget::All, false).unwrap();
    assert_eq!(outcomes.len(), 2);
    for outcome in &outcomes {
        match outcome.message_id.as_str() {
            "<a@x>" => assert_eq!(outcome.status, RevertStatus::Reverted),
            "<b@x>" => assert_eq!(outcome.status, RevertStatus::NotRevertible),
            other => panic!("unexpected outcome for {other}"),
        }
    }
}

#[test]
fn test_revert_dry_run_only_locates() {
    let h = Harness::new();
    h.mailbox.insert(ACTIVE, &pdf_message("<peek@x>", 50), &[]);
    h.engine.process(&all(), false).unwrap();
    let before = h.mailbox.mutating_calls();

    let outcomes = h
        .engine
        .revert(&RevertTarget::One("<peek@x>".into()), true)
        .unwrap();
    assert_eq!(outcomes[0].status, RevertStatus::WouldRevert);
    assert_eq!(h.mailbox.mutating_calls(), before);
    assert_eq!(
        h.statuses(),
        vec![ManifestStatus::Committed]
    );
}

#[test]
fn test_interrupted_revert_is_resumed_by_recovery() {
    let h = Harness::new();
    let original = pdf_message("<undo@x>", 50);
    h.mailbox.insert(ACTIVE, &original, &["INBOX", "Work"]);
    h.engine.process(&all(), false).unwrap();

    // The restore intent lands and the copy runs; its success record does not.
    h.journal.fail_after(3);
    let err = h
        .engine
        .revert(&RevertTarget::One("<undo@x>".into()), false)
        .unwrap_err();
    assert!(matches!(err, StripError::LogWrite(_)));
    assert_eq!(h.mailbox.calls(OP_COPY_FROM_TRASH), 1);

    let restarted = h.restart();
    let report = restarted.engine.recover().unwrap();
    assert_eq!(report.reverted, 1);
    assert_eq!(restarted.mailbox.calls(OP_COPY_FROM_TRASH), 1);

    let active = restarted.mailbox.folder(ACTIVE);
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].1.raw, original);
    assert!(active[0].1.labels.contains("INBOX"));
    assert!(active[0].1.labels.contains("Work"));
    assert_eq!(restarted.statuses(), vec![ManifestStatus::Reverted]);
}

#[test]
fn test_revert_requires_committed_entry() {
    let h = Harness::new();
    let err = h
        .engine
        .revert(&RevertTarget::One("<nobody@x>".into()), false)
        .unwrap_err();
    assert!(matches!(err, StripError::NotCommitted { .. }));
}

// ─── Test 10: Worker pool and cancellation ──────────────────────────

#[test]
fn test_parallel_workers_process_every_message_once() {
    let h = Harness::with_workers(4);
    for i in 0..8 {
        h.mailbox
            .insert(ACTIVE, &pdf_message(&format!("<p{i}@x>"), 30 + i), &[]);
    }

    let results = h.engine.process(&all(), false).unwrap();
    assert_eq!(results.len(), 8);
    assert!(results
        .iter()
        .all(|r| r.entry.status == ManifestStatus::Committed));
    assert_eq!(h.mailbox.calls(OP_TRASH), 8);
    assert_eq!(h.mailbox.calls(OP_UPLOAD), 8);
    assert_eq!(h.engine.status().unwrap()[&ManifestStatus::Committed], 8);
}

#[test]
fn test_cancelled_batch_starts_nothing() {
    let h = Harness::new();
    h.mailbox.insert(ACTIVE, &pdf_message("<stop@x>", 30), &[]);
    h.engine.cancel_token().cancel();

    let results = h.engine.process(&all(), false).unwrap();
    assert!(results.is_empty());
    assert_eq!(h.mailbox.mutating_calls(), 0);
}

// ─── Test 11: Manifest export, rebuild and compaction ───────────────

#[test]
fn test_export_manifest_formats() {
    let h = Harness::new();
    h.mailbox.insert(ACTIVE, &pdf_message("<exp@x>", 30), &["INBOX"]);
    h.engine.process(&all(), false).unwrap();

    let mut json = Vec::new();
    let count = h.engine.export_manifest(ExportFormat::Json, &mut json).unwrap();
    assert_eq!(count, 1);
    let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
    assert_eq!(value.as_array().map(Vec::len), Some(1));

    let mut csv = Vec::new();
    h.engine.export_manifest(ExportFormat::Csv, &mut csv).unwrap();
    let text = String::from_utf8(csv).unwrap();
    assert!(text.starts_with('\u{FEFF}'));
    assert!(text.contains("<exp@x>"));
    assert!(text.contains("report.pdf"));
}

#[test]
fn test_rebuild_manifest_from_journal() {
    let h = Harness::new();
    h.mailbox.insert(ACTIVE, &pdf_message("<rb@x>", 30), &[]);
    h.engine.process(&all(), false).unwrap();
    let before = h.engine.manifest_entries().unwrap();

    assert_eq!(h.engine.rebuild_manifest().unwrap(), 1);
    let after = h.engine.manifest_entries().unwrap();
    assert_eq!(after[0].status, before[0].status);
    assert_eq!(after[0].replacement, before[0].replacement);
    assert_eq!(after[0].attachments, before[0].attachments);
}

#[test]
fn test_compact_drops_simulated_history() {
    let h = Harness::new();
    h.mailbox.insert(ACTIVE, &pdf_message("<cmp@x>", 30), &[]);
    h.engine.process(&all(), true).unwrap();
    let simulated = h.journal.len();
    assert!(simulated > 0);

    let removed = h.engine.compact(0).unwrap();
    assert_eq!(removed, simulated);
    let left = h.journal.snapshot();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].step, Step::Compact);
}
