use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};

use mailstrip::backup::MemoryBackupStore;
use mailstrip::engine::{AttachmentExtractor, Engine, EngineSettings, MessageReconstructor};
use mailstrip::engine::extract::Inspection;
use mailstrip::journal::MemoryJournal;
use mailstrip::mailbox::{MailboxGateway, MemoryMailbox};
use mailstrip::manifest::MemoryManifest;
use mailstrip::model::message::SearchCriteria;
use mailstrip::parser::{header, mime};

/// A message with a text body and a base64 attachment of `3 * blocks` bytes.
fn message(message_id: &str, blocks: usize) -> Vec<u8> {
    let mut raw = format!(
        "From: a@example.com\nSubject: bench\nMessage-ID: {message_id}\n\
Content-Type: multipart/mixed; boundary=\"B\"\n\n\
--B\nContent-Type: text/plain\n\nbody\n\
--B\nContent-Type: application/octet-stream\n\
Content-Disposition: attachment; filename=\"data.bin\"\n\
Content-Transfer-Encoding: base64\n\n"
    )
    .into_bytes();
    for _ in 0..blocks / 19 {
        raw.extend_from_slice("SGVs".repeat(19).as_bytes());
        raw.push(b'\n');
    }
    raw.extend_from_slice(b"--B--\n");
    raw
}

fn bench_classify_and_rebuild(c: &mut Criterion) {
    let raw = message("<bench@x>", 19 * 5_000);
    let settings = EngineSettings::default();
    let backups = MemoryBackupStore::new();
    let extractor = AttachmentExtractor {
        backups: &backups,
        layout: settings.layout.as_ref(),
        inline_policy: settings.inline_policy.as_ref(),
        max_attachment_size: settings.max_attachment_size,
    };

    c.bench_function("classify_extract_rebuild_285k", |b| {
        b.iter(|| {
            let tree = mime::parse_tree(&raw).unwrap();
            let headers = header::summarize(header::header_block(&raw));
            let Inspection::Plain(classification) = extractor.classify(&tree) else {
                unreachable!("bench message is not encrypted");
            };
            let records = extractor.extract(&classification, &headers, true).unwrap();
            MessageReconstructor::rebuild(&tree, &records, "bench").unwrap()
        })
    });
}

fn bench_process_batch(c: &mut Criterion) {
    c.bench_function("process_batch_20_dry_run", |b| {
        b.iter(|| {
            let mailbox = Arc::new(MemoryMailbox::default());
            for i in 0..20 {
                mailbox.insert("All Mail", &message(&format!("<m{i}@x>"), 19 * 200), &[]);
            }
            let engine = Engine::new(
                MailboxGateway::unthrottled(mailbox),
                Arc::new(MemoryBackupStore::new()),
                Arc::new(MemoryJournal::new()),
                Arc::new(MemoryManifest::new()),
                EngineSettings::default(),
            )
            .unwrap();
            engine.process(&SearchCriteria::default(), true).unwrap().len()
        })
    });
}

criterion_group!(benches, bench_classify_and_rebuild, bench_process_batch);
criterion_main!(benches);
