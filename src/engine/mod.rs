//! The stripping engine: replace, recover, revert.
//!
//! [`Engine`] wires the capabilities together (mailbox, backup store,
//! journal, manifest) and runs batches on a bounded worker pool. Each
//! message is handled by exactly one worker at a time.

pub mod coordinator;
pub mod extract;
pub mod locks;
pub mod reconstruct;
pub mod recovery;
pub mod revert;

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{info, warn};

use crate::backup::layout::{DigestLayout, LayoutPolicy};
use crate::backup::BackupStore;
use crate::config::Config;
use crate::error::{Result, StripError};
use crate::export::{self, ExportFormat};
use crate::journal::{JournalStore, TransactionLog};
use crate::mailbox::{MailboxGateway, SearchResults};
use crate::manifest::{self, ManifestStore};
use crate::model::manifest::{ManifestEntry, ManifestStatus};
use crate::model::message::{MessageRef, SearchCriteria};
use crate::parser::mime::{CidReferencePolicy, InlinePolicy};

pub use coordinator::{ProcessResult, ReplaceCoordinator};
pub use extract::AttachmentExtractor;
pub use locks::{CancelToken, RefLocks};
pub use reconstruct::MessageReconstructor;
pub use recovery::{RecoveryManager, RecoveryReport};
pub use revert::{RevertEngine, RevertOutcome, RevertStatus, RevertTarget};

/// Engine tuning, usually derived from [`Config`].
#[derive(Clone)]
pub struct EngineSettings {
    pub active_folder: String,
    pub trash_folder: String,
    pub workers: usize,
    pub max_attachment_size: u64,
    pub layout: Arc<dyn LayoutPolicy>,
    pub inline_policy: Arc<dyn InlinePolicy>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            active_folder: "All Mail".to_string(),
            trash_folder: "Trash".to_string(),
            workers: 4,
            max_attachment_size: 100 * 1024 * 1024,
            layout: Arc::new(DigestLayout),
            inline_policy: Arc::new(CidReferencePolicy::default()),
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            active_folder: config.mailbox.active_folder.clone(),
            trash_folder: config.mailbox.trash_folder.clone(),
            workers: config.processing.workers.max(1),
            max_attachment_size: config.processing.max_attachment_size,
            layout: Arc::from(config.backup.layout.policy()),
            inline_policy: Arc::new(CidReferencePolicy {
                preserve_inline_images: config.processing.preserve_inline_images,
                max_inline_size: config.processing.inline_max_size,
            }),
        }
    }
}

/// Shared state every component works against.
pub struct EngineContext {
    pub(crate) gateway: MailboxGateway,
    pub(crate) backups: Arc<dyn BackupStore>,
    pub(crate) log: TransactionLog,
    pub(crate) manifest: Arc<dyn ManifestStore>,
    pub(crate) settings: EngineSettings,
    pub(crate) locks: RefLocks,
}

impl EngineContext {
    /// Persist a manifest entry unless it belongs to a simulation.
    pub(crate) fn persist(&self, entry: &ManifestEntry, simulated: bool) -> Result<()> {
        if simulated {
            return Ok(());
        }
        self.manifest.upsert(entry)
    }
}

/// Public face of the library.
pub struct Engine {
    ctx: EngineContext,
    cancel: CancelToken,
}

impl Engine {
    pub fn new(
        gateway: MailboxGateway,
        backups: Arc<dyn BackupStore>,
        journal: Arc<dyn JournalStore>,
        manifest: Arc<dyn ManifestStore>,
        settings: EngineSettings,
    ) -> Result<Self> {
        let log = TransactionLog::open(journal)?;
        Ok(Self {
            ctx: EngineContext {
                gateway,
                backups,
                log,
                manifest,
                settings,
                locks: RefLocks::new(),
            },
            cancel: CancelToken::new(),
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.ctx.settings
    }

    /// Token that stops a running batch at the next message boundary.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Candidate messages, lazily. Defaults to the active folder.
    pub fn scan(&self, criteria: &SearchCriteria) -> Result<SearchResults<'_>> {
        let criteria = self.with_default_folder(criteria);
        self.ctx.gateway.search(&criteria)
    }

    fn with_default_folder(&self, criteria: &SearchCriteria) -> SearchCriteria {
        let mut criteria = criteria.clone();
        if criteria.folder.is_none() {
            criteria.folder = Some(self.ctx.settings.active_folder.clone());
        }
        criteria
    }

    pub fn coordinator(&self) -> ReplaceCoordinator<'_> {
        ReplaceCoordinator::new(&self.ctx)
    }

    /// Strip every message matching `criteria`.
    pub fn process(&self, criteria: &SearchCriteria, dry_run: bool) -> Result<Vec<ProcessResult>> {
        self.process_with_progress(criteria, dry_run, &|_| {})
    }

    /// Like [`Engine::process`], calling `progress` after each message.
    ///
    /// Interrupted transactions are recovered first. A journal failure stops
    /// every worker and is returned; any other failure is confined to its
    /// message and shows up as a `Failed` or `RolledBack` entry.
    pub fn process_with_progress(
        &self,
        criteria: &SearchCriteria,
        dry_run: bool,
        progress: &(dyn Fn(&ProcessResult) + Sync),
    ) -> Result<Vec<ProcessResult>> {
        self.recover()?;

        let criteria = self.with_default_folder(criteria);
        let candidates = Mutex::new(self.ctx.gateway.search(&criteria)?);
        let results: Mutex<Vec<ProcessResult>> = Mutex::new(Vec::new());
        let abort: Mutex<Option<StripError>> = Mutex::new(None);
        let stop = AtomicBool::new(false);
        let coordinator = self.coordinator();
        let workers = self.ctx.settings.workers.max(1);

        info!(workers, dry_run, "Processing started");

        std::thread::scope(|scope| {
            for worker in 0..workers {
                let (candidates, results, abort, stop, coordinator) =
                    (&candidates, &results, &abort, &stop, &coordinator);
                scope.spawn(move || loop {
                    if stop.load(Ordering::SeqCst) || self.cancel.is_cancelled() {
                        break;
                    }
                    let next = candidates
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .next();
                    let msg = match next {
                        None => break,
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => {
                            stop.store(true, Ordering::SeqCst);
                            set_abort(abort, e);
                            break;
                        }
                    };

                    match coordinator.process_one(&msg, dry_run) {
                        Ok(result) => {
                            progress(&result);
                            results
                                .lock()
                                .unwrap_or_else(|poisoned| poisoned.into_inner())
                                .push(result);
                        }
                        Err(StripError::Busy(id)) => {
                            warn!(
                                worker,
                                message_id = %id,
                                mailbox_id = %msg.mailbox_id,
                                "Another copy with this Message-ID is in flight, skipping"
                            );
                            let result = ProcessResult {
                                entry: ManifestEntry::scanned(msg.clone(), Utc::now()),
                                simulated: dry_run,
                                skipped: true,
                            };
                            progress(&result);
                            results
                                .lock()
                                .unwrap_or_else(|poisoned| poisoned.into_inner())
                                .push(result);
                        }
                        Err(e) if e.is_fatal_to_run() => {
                            stop.store(true, Ordering::SeqCst);
                            set_abort(abort, e);
                            break;
                        }
                        Err(e) => {
                            warn!(worker, message_id = %msg.message_id, error = %e, "Message failed");
                        }
                    }
                });
            }
        });

        if let Some(e) = abort
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
        {
            return Err(e);
        }
        if self.cancel.is_cancelled() {
            info!("Processing cancelled between messages");
        }
        let results = results
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        info!(processed = results.len(), dry_run, "Processing finished");
        Ok(results)
    }

    /// Strip one message.
    pub fn process_message(&self, msg: &MessageRef, dry_run: bool) -> Result<ProcessResult> {
        self.coordinator().process_one(msg, dry_run)
    }

    /// Restore originals from trash.
    pub fn revert(&self, target: &RevertTarget, dry_run: bool) -> Result<Vec<RevertOutcome>> {
        self.recover()?;
        RevertEngine::new(&self.ctx).revert(target, dry_run)
    }

    /// Finish or roll back whatever the journal shows as interrupted.
    pub fn recover(&self) -> Result<RecoveryReport> {
        RecoveryManager::new(&self.ctx).run()
    }

    /// Entry counts for every status.
    pub fn status(&self) -> Result<BTreeMap<ManifestStatus, usize>> {
        Ok(manifest::status_counts(&self.ctx.manifest.all()?))
    }

    pub fn manifest_entries(&self) -> Result<Vec<ManifestEntry>> {
        self.ctx.manifest.all()
    }

    pub fn export_manifest(&self, format: ExportFormat, out: &mut dyn Write) -> Result<usize> {
        let entries = self.ctx.manifest.all()?;
        export::write_manifest(&entries, format, out)?;
        Ok(entries.len())
    }

    /// Drop superseded journal history older than `retention_days`.
    pub fn compact(&self, retention_days: u32) -> Result<usize> {
        self.ctx.log.compact(
            chrono::Duration::days(i64::from(retention_days)),
            chrono::Utc::now(),
        )
    }

    /// Replace the manifest with one materialized from the journal.
    pub fn rebuild_manifest(&self) -> Result<usize> {
        let entries = manifest::materialize(&self.ctx.log.entries()?);
        let count = entries.len();
        self.ctx.manifest.replace_all(entries)?;
        info!(entries = count, "Manifest rebuilt from journal");
        Ok(count)
    }
}

fn set_abort(slot: &Mutex<Option<StripError>>, e: StripError) {
    let mut slot = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if slot.is_none() {
        *slot = Some(e);
    }
}
