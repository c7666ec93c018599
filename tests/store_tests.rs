//! End-to-end tests over the filesystem-backed mailbox, backups, journal and manifest.

mod common;

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use assert_fs::prelude::*;
use assert_fs::TempDir;
use predicates::prelude::*;

use mailstrip::backup::DirBackupStore;
use mailstrip::engine::{Engine, EngineSettings, RevertStatus, RevertTarget};
use mailstrip::error::StripError;
use mailstrip::journal::FileJournal;
use mailstrip::mailbox::{DirMailbox, MailboxGateway};
use mailstrip::manifest::{FileManifest, ManifestStore};
use mailstrip::model::manifest::ManifestStatus;
use mailstrip::model::message::SearchCriteria;

use common::{pdf_message, ACTIVE, TRASH};

fn open_engine(root: &Path) -> Engine {
    let mailbox = DirMailbox::open(root.join("mailbox"), TRASH).unwrap();
    Engine::new(
        MailboxGateway::unthrottled(Arc::new(mailbox)),
        Arc::new(DirBackupStore::open(root.join("backups")).unwrap()),
        Arc::new(FileJournal::open(root.join("journal.jsonl")).unwrap()),
        Arc::new(FileManifest::open(root.join("manifest.bin")).unwrap()),
        EngineSettings::default(),
    )
    .unwrap()
}

fn import(root: &Path, raw: &[u8]) {
    let mailbox = DirMailbox::open(root.join("mailbox"), TRASH).unwrap();
    let labels: BTreeSet<String> = ["INBOX".to_string()].into();
    mailbox.import(ACTIVE, raw, &labels).unwrap();
}

fn eml_count(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().extension().is_some_and(|x| x == "eml"))
                .count()
        })
        .unwrap_or(0)
}

// ─── Test 1: Commit writes backups, journal and manifest to disk ────

#[test]
fn test_commit_persists_everything() {
    let temp = TempDir::new().unwrap();
    import(temp.path(), &pdf_message("<disk@x>", 200));

    let engine = open_engine(temp.path());
    let results = engine.process(&SearchCriteria::default(), false).unwrap();
    assert_eq!(results[0].entry.status, ManifestStatus::Committed);

    let record = &results[0].entry.attachments[0];
    temp.child("backups")
        .child(&record.backup_path)
        .assert(predicate::path::is_file());
    temp.child("backups")
        .child(&record.backup_path)
        .assert(predicate::str::starts_with("HelHel"));
    temp.child("journal.jsonl")
        .assert(predicate::str::contains("\"v\":1"));
    temp.child("manifest.bin").assert(predicate::path::is_file());

    assert_eq!(eml_count(&temp.path().join("mailbox").join(ACTIVE)), 1);
    assert_eq!(eml_count(&temp.path().join("mailbox").join(TRASH)), 1);

    // A new process sees the same state.
    drop(engine);
    let reopened = FileManifest::open(temp.path().join("manifest.bin")).unwrap();
    let entry = reopened.get("<disk@x>").unwrap().unwrap();
    assert_eq!(entry.status, ManifestStatus::Committed);
    assert!(entry.labels.contains("INBOX"));
}

// ─── Test 2: Revert after restart ───────────────────────────────────

#[test]
fn test_revert_after_restart() {
    let temp = TempDir::new().unwrap();
    let original = pdf_message("<later@x>", 100);
    import(temp.path(), &original);

    open_engine(temp.path())
        .process(&SearchCriteria::default(), false)
        .unwrap();

    let engine = open_engine(temp.path());
    let outcomes = engine
        .revert(&RevertTarget::One("<later@x>".into()), false)
        .unwrap();
    assert_eq!(outcomes[0].status, RevertStatus::Reverted);

    let active = temp.path().join("mailbox").join(ACTIVE);
    assert_eq!(eml_count(&active), 1);
    let restored = outcomes[0].restored.as_ref().unwrap();
    let restored_raw = std::fs::read(active.join(format!("{}.eml", restored.mailbox_id))).unwrap();
    assert_eq!(restored_raw, original);
    assert_eq!(engine.status().unwrap()[&ManifestStatus::Reverted], 1);
}

// ─── Test 3: Corrupt manifest is rebuilt from the journal ───────────

#[test]
fn test_corrupt_manifest_rebuilt_from_journal() {
    let temp = TempDir::new().unwrap();
    import(temp.path(), &pdf_message("<heal@x>", 100));
    open_engine(temp.path())
        .process(&SearchCriteria::default(), false)
        .unwrap();

    let manifest = temp.child("manifest.bin");
    let mut bytes = std::fs::read(manifest.path()).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    manifest.write_binary(&bytes).unwrap();

    let err = FileManifest::open(manifest.path()).unwrap_err();
    assert!(matches!(err, StripError::InvalidManifest { .. }));

    std::fs::remove_file(manifest.path()).unwrap();
    let engine = open_engine(temp.path());
    assert!(engine.manifest_entries().unwrap().is_empty());
    assert_eq!(engine.rebuild_manifest().unwrap(), 1);
    assert_eq!(engine.status().unwrap()[&ManifestStatus::Committed], 1);
    manifest.assert(predicate::path::is_file());
}

// ─── Test 4: Torn journal tail does not block the next run ──────────

#[test]
fn test_torn_journal_tail_is_tolerated() {
    let temp = TempDir::new().unwrap();
    import(temp.path(), &pdf_message("<torn@x>", 100));
    open_engine(temp.path())
        .process(&SearchCriteria::default(), false)
        .unwrap();

    let journal = temp.child("journal.jsonl");
    let mut text = std::fs::read_to_string(journal.path()).unwrap();
    text.push_str("{\"v\":1,\"seq\":99,\"txn_id\":\"cut");
    journal.write_str(&text).unwrap();

    let engine = open_engine(temp.path());
    assert!(engine.recover().unwrap().is_clean());
    assert_eq!(engine.status().unwrap()[&ManifestStatus::Committed], 1);
}
