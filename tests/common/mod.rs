//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use mailstrip::backup::MemoryBackupStore;
use mailstrip::engine::{Engine, EngineSettings};
use mailstrip::journal::MemoryJournal;
use mailstrip::mailbox::{MailboxGateway, MemoryMailbox};
use mailstrip::manifest::MemoryManifest;
use mailstrip::model::manifest::ManifestStatus;

pub const ACTIVE: &str = "All Mail";
pub const TRASH: &str = "Trash";

/// An engine over in-memory collaborators that the test can inspect.
pub struct Harness {
    pub mailbox: Arc<MemoryMailbox>,
    pub backups: Arc<MemoryBackupStore>,
    pub journal: Arc<MemoryJournal>,
    pub manifest: Arc<MemoryManifest>,
    pub engine: Engine,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_workers(1)
    }

    pub fn with_workers(workers: usize) -> Self {
        let settings = EngineSettings {
            workers,
            ..EngineSettings::default()
        };
        Self::build(
            Arc::new(MemoryMailbox::new(TRASH)),
            Arc::new(MemoryBackupStore::new()),
            Arc::new(MemoryJournal::new()),
            Arc::new(MemoryManifest::new()),
            settings,
        )
    }

    /// A fresh engine over the same mailbox, backups and manifest, with a
    /// journal holding what this one had durably written.
    pub fn restart(&self) -> Self {
        Self::build(
            Arc::clone(&self.mailbox),
            Arc::clone(&self.backups),
            Arc::new(MemoryJournal::with_entries(self.journal.snapshot())),
            Arc::clone(&self.manifest),
            EngineSettings::default(),
        )
    }

    fn build(
        mailbox: Arc<MemoryMailbox>,
        backups: Arc<MemoryBackupStore>,
        journal: Arc<MemoryJournal>,
        manifest: Arc<MemoryManifest>,
        settings: EngineSettings,
    ) -> Self {
        let engine = Engine::new(
            MailboxGateway::unthrottled(mailbox.clone()),
            backups.clone(),
            journal.clone(),
            manifest.clone(),
            settings,
        )
        .unwrap();
        Self {
            mailbox,
            backups,
            journal,
            manifest,
            engine,
        }
    }

    /// Status of every stored manifest entry, ordered by Message-ID.
    pub fn statuses(&self) -> Vec<ManifestStatus> {
        self.engine
            .manifest_entries()
            .unwrap()
            .into_iter()
            .map(|e| e.status)
            .collect()
    }

    /// Messages in `folder`, raw bytes only.
    pub fn raw_in(&self, folder: &str) -> Vec<Vec<u8>> {
        self.mailbox
            .folder(folder)
            .into_iter()
            .map(|(_, m)| m.raw)
            .collect()
    }
}

/// Decoded content of [`pdf_message`] with `blocks` blocks.
pub fn pdf_payload(blocks: usize) -> Vec<u8> {
    b"Hel".repeat(blocks)
}

/// A text body plus a base64 PDF attachment of `3 * blocks` bytes.
pub fn pdf_message(message_id: &str, blocks: usize) -> Vec<u8> {
    let mut raw = format!(
        "From: Alice <alice@example.com>\n\
To: bob@example.com\n\
Subject: Quarterly report\n\
Date: Mon, 2 Jan 2023 10:00:00 +0000\n\
Message-ID: {message_id}\n\
MIME-Version: 1.0\n\
Content-Type: multipart/mixed; boundary=\"XYZ\"\n\
\n\
--XYZ\n\
Content-Type: text/plain; charset=utf-8\n\
\n\
Report attached.\n\
--XYZ\n\
Content-Type: application/pdf; name=\"report.pdf\"\n\
Content-Disposition: attachment; filename=\"report.pdf\"\n\
Content-Transfer-Encoding: base64\n\
\n"
    )
    .into_bytes();
    // "SGVs" is base64 for "Hel"; 19 blocks make a 76 column line.
    let mut left = blocks;
    while left > 0 {
        let n = left.min(19);
        raw.extend_from_slice("SGVs".repeat(n).as_bytes());
        raw.push(b'\n');
        left -= n;
    }
    raw.extend_from_slice(b"--XYZ--\n");
    raw
}

pub fn plain_message(message_id: &str) -> Vec<u8> {
    format!(
        "From: alice@example.com\nSubject: Lunch\nMessage-ID: {message_id}\n\nSee you at noon.\n"
    )
    .into_bytes()
}

pub fn encrypted_message(message_id: &str) -> Vec<u8> {
    format!(
        "From: alice@example.com\n\
Subject: Secret\n\
Message-ID: {message_id}\n\
MIME-Version: 1.0\n\
Content-Type: application/pkcs7-mime; smime-type=enveloped-data; name=smime.p7m\n\
Content-Disposition: attachment; filename=smime.p7m\n\
Content-Transfer-Encoding: base64\n\
\n\
MIAGCSqGSIb3DQEHA6CAMIACAQAx\n"
    )
    .into_bytes()
}
