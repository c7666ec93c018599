//! In-memory mailbox with call counters and fault injection.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use crate::error::{Result, StripError};
use crate::model::message::{MessageRef, SearchCriteria};
use crate::parser::header;

use super::{MailboxClient, SearchResults};

pub const OP_SEARCH: &str = "search";
pub const OP_FETCH: &str = "fetch";
pub const OP_LABELS: &str = "labels";
pub const OP_UPLOAD: &str = "upload";
pub const OP_APPLY_LABELS: &str = "apply_labels";
pub const OP_TRASH: &str = "trash";
pub const OP_FIND_IN_TRASH: &str = "find_in_trash";
pub const OP_COPY_FROM_TRASH: &str = "copy_from_trash";
pub const OP_DELETE: &str = "delete";
pub const OP_PERMANENTLY_DELETE: &str = "permanently_delete";

/// Operations that change mailbox state.
pub const MUTATING_OPS: &[&str] = &[
    OP_UPLOAD,
    OP_APPLY_LABELS,
    OP_TRASH,
    OP_COPY_FROM_TRASH,
    OP_DELETE,
    OP_PERMANENTLY_DELETE,
];

/// A stored message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub message_id: String,
    pub folder: String,
    pub raw: Vec<u8>,
    pub labels: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy)]
struct Fault {
    remaining: usize,
    transient: bool,
}

type UploadFilter = Box<dyn Fn(Vec<u8>) -> Vec<u8> + Send + Sync>;

#[derive(Default)]
struct State {
    next_id: u64,
    messages: BTreeMap<String, StoredMessage>,
    calls: HashMap<&'static str, usize>,
    faults: HashMap<&'static str, Fault>,
    lost_replies: HashMap<&'static str, usize>,
}

/// Mailbox held in memory.
///
/// Mailbox ids are sequential (`m1`, `m2`, ...). Every call is counted per
/// operation, and any operation can be told to fail its next N calls.
pub struct MemoryMailbox {
    trash_folder: String,
    state: Mutex<State>,
    upload_filter: Mutex<Option<UploadFilter>>,
}

impl std::fmt::Debug for MemoryMailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryMailbox")
            .field("trash_folder", &self.trash_folder)
            .finish_non_exhaustive()
    }
}

impl Default for MemoryMailbox {
    fn default() -> Self {
        Self::new("Trash")
    }
}

impl MemoryMailbox {
    pub fn new(trash_folder: impl Into<String>) -> Self {
        Self {
            trash_folder: trash_folder.into(),
            state: Mutex::new(State::default()),
            upload_filter: Mutex::new(None),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seed a message directly, bypassing counters.
    pub fn insert(&self, folder: &str, raw: &[u8], labels: &[&str]) -> MessageRef {
        let mut state = self.state();
        Self::store(
            &mut state,
            folder,
            raw.to_vec(),
            labels.iter().map(|l| l.to_string()).collect(),
        )
    }

    fn store(
        state: &mut State,
        folder: &str,
        raw: Vec<u8>,
        labels: BTreeSet<String>,
    ) -> MessageRef {
        state.next_id += 1;
        let mailbox_id = format!("m{}", state.next_id);
        let message_id = message_id_of(&raw);
        state.messages.insert(
            mailbox_id.clone(),
            StoredMessage {
                message_id: message_id.clone(),
                folder: folder.to_string(),
                raw,
                labels,
            },
        );
        MessageRef::new(mailbox_id, message_id)
    }

    /// Make the next `times` calls of `op` fail.
    pub fn fail_next(&self, op: &'static str, times: usize, transient: bool) {
        self.state().faults.insert(
            op,
            Fault {
                remaining: times,
                transient,
            },
        );
    }

    /// Let the next `times` calls of `op` take effect, then fail them with a
    /// transient error, as when the reply is lost on the way back.
    pub fn lose_replies(&self, op: &'static str, times: usize) {
        self.state().lost_replies.insert(op, times);
    }

    /// Transform every uploaded message before it is stored.
    pub fn set_upload_filter(&self, filter: impl Fn(Vec<u8>) -> Vec<u8> + Send + Sync + 'static) {
        *self
            .upload_filter
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Box::new(filter));
    }

    /// Number of calls made to `op`.
    pub fn calls(&self, op: &str) -> usize {
        self.state().calls.get(op).copied().unwrap_or(0)
    }

    /// Total calls to state-changing operations.
    pub fn mutating_calls(&self) -> usize {
        MUTATING_OPS.iter().map(|op| self.calls(op)).sum()
    }

    /// Snapshot of a message, if it still exists.
    pub fn get(&self, mailbox_id: &str) -> Option<StoredMessage> {
        self.state().messages.get(mailbox_id).cloned()
    }

    /// Every message currently in `folder`, by mailbox id.
    pub fn folder(&self, folder: &str) -> Vec<(String, StoredMessage)> {
        self.state()
            .messages
            .iter()
            .filter(|(_, m)| m.folder == folder)
            .map(|(id, m)| (id.clone(), m.clone()))
            .collect()
    }

    /// Remove a message without counting it, as a remote retention purge would.
    pub fn purge(&self, mailbox_id: &str) {
        self.state().messages.remove(mailbox_id);
    }

    /// Count the call and apply any pending fault.
    fn enter(&self, op: &'static str) -> Result<std::sync::MutexGuard<'_, State>> {
        let mut state = self.state();
        *state.calls.entry(op).or_insert(0) += 1;
        if let Some(fault) = state.faults.get_mut(op) {
            if fault.remaining > 0 {
                fault.remaining -= 1;
                let msg = format!("injected {op} failure");
                return Err(if fault.transient {
                    StripError::TransientRemote(msg)
                } else {
                    StripError::Remote(msg)
                });
            }
        }
        Ok(state)
    }
}

/// Fail a call that already took effect if its reply is due to be lost.
fn reply(state: &mut State, op: &'static str) -> Result<()> {
    match state.lost_replies.get_mut(op) {
        Some(left) if *left > 0 => {
            *left -= 1;
            Err(StripError::TransientRemote(format!("{op} reply lost")))
        }
        _ => Ok(()),
    }
}

fn message_id_of(raw: &[u8]) -> String {
    header::summarize(header::header_block(raw)).message_id
}

fn not_found(msg: &MessageRef) -> StripError {
    StripError::Remote(format!("message {} not found", msg.mailbox_id))
}

impl MailboxClient for MemoryMailbox {
    fn search(&self, criteria: &SearchCriteria) -> Result<SearchResults<'_>> {
        let state = self.enter(OP_SEARCH)?;
        let mut refs: Vec<MessageRef> = state
            .messages
            .iter()
            .filter(|(_, m)| match criteria.folder.as_deref() {
                Some(folder) => m.folder == folder,
                None => m.folder != self.trash_folder,
            })
            .filter(|(_, m)| {
                criteria
                    .message_id
                    .as_deref()
                    .map_or(true, |id| m.message_id == id)
            })
            .filter(|(_, m)| criteria.min_size.map_or(true, |min| m.raw.len() as u64 >= min))
            .map(|(id, m)| MessageRef::new(id.clone(), m.message_id.clone()))
            .collect();
        if let Some(limit) = criteria.limit {
            refs.truncate(limit);
        }
        Ok(Box::new(refs.into_iter().map(Ok)))
    }

    fn fetch(&self, msg: &MessageRef) -> Result<Vec<u8>> {
        let state = self.enter(OP_FETCH)?;
        state
            .messages
            .get(&msg.mailbox_id)
            .map(|m| m.raw.clone())
            .ok_or_else(|| not_found(msg))
    }

    fn labels(&self, msg: &MessageRef) -> Result<BTreeSet<String>> {
        let state = self.enter(OP_LABELS)?;
        state
            .messages
            .get(&msg.mailbox_id)
            .map(|m| m.labels.clone())
            .ok_or_else(|| not_found(msg))
    }

    fn upload(&self, raw: &[u8], folder: &str) -> Result<MessageRef> {
        let mut state = self.enter(OP_UPLOAD)?;
        let raw = match self
            .upload_filter
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
        {
            Some(filter) => filter(raw.to_vec()),
            None => raw.to_vec(),
        };
        Ok(Self::store(&mut state, folder, raw, BTreeSet::new()))
    }

    fn apply_labels(&self, msg: &MessageRef, labels: &BTreeSet<String>) -> Result<()> {
        let mut state = self.enter(OP_APPLY_LABELS)?;
        let stored = state
            .messages
            .get_mut(&msg.mailbox_id)
            .ok_or_else(|| not_found(msg))?;
        stored.labels.extend(labels.iter().cloned());
        Ok(())
    }

    fn trash(&self, msg: &MessageRef) -> Result<()> {
        let mut state = self.enter(OP_TRASH)?;
        let stored = state
            .messages
            .get_mut(&msg.mailbox_id)
            .ok_or_else(|| not_found(msg))?;
        stored.folder = self.trash_folder.clone();
        reply(&mut state, OP_TRASH)
    }

    fn find_in_trash(&self, message_id: &str) -> Result<Option<MessageRef>> {
        let state = self.enter(OP_FIND_IN_TRASH)?;
        Ok(state
            .messages
            .iter()
            .find(|(_, m)| m.folder == self.trash_folder && m.message_id == message_id)
            .map(|(id, m)| MessageRef::new(id.clone(), m.message_id.clone())))
    }

    fn copy_from_trash(&self, msg: &MessageRef, folder: &str) -> Result<MessageRef> {
        let mut state = self.enter(OP_COPY_FROM_TRASH)?;
        let raw = state
            .messages
            .get(&msg.mailbox_id)
            .filter(|m| m.folder == self.trash_folder)
            .map(|m| m.raw.clone())
            .ok_or_else(|| not_found(msg))?;
        Ok(Self::store(&mut state, folder, raw, BTreeSet::new()))
    }

    fn delete(&self, msg: &MessageRef) -> Result<()> {
        let mut state = self.enter(OP_DELETE)?;
        state.messages.remove(&msg.mailbox_id);
        Ok(())
    }

    fn permanently_delete(&self, msg: &MessageRef) -> Result<()> {
        let mut state = self.enter(OP_PERMANENTLY_DELETE)?;
        state.messages.remove(&msg.mailbox_id);
        Ok(())
    }
}
