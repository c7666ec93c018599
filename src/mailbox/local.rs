//! Directory-backed mailbox: a local mirror the CLI can work against.
//!
//! ```text
//! <root>/<folder>/<id>.eml    raw message
//! <root>/<folder>/<id>.json   {"message_id": "...", "labels": [...]}
//! ```

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, StripError};
use crate::model::message::{MessageRef, SearchCriteria};
use crate::parser::header;

use super::{MailboxClient, SearchResults};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Meta {
    message_id: String,
    #[serde(default)]
    labels: BTreeSet<String>,
}

/// Mailbox stored as one directory per folder.
#[derive(Debug, Clone)]
pub struct DirMailbox {
    root: PathBuf,
    trash_folder: String,
}

impl DirMailbox {
    pub fn open(root: impl Into<PathBuf>, trash_folder: impl Into<String>) -> Result<Self> {
        let root = root.into();
        let trash_folder = trash_folder.into();
        validate_folder(&trash_folder)?;
        fs::create_dir_all(root.join(&trash_folder))
            .map_err(|e| StripError::io(root.join(&trash_folder), e))?;
        Ok(Self { root, trash_folder })
    }

    /// Import a raw message file into `folder`, returning its reference.
    pub fn import(&self, folder: &str, raw: &[u8], labels: &BTreeSet<String>) -> Result<MessageRef> {
        self.store(folder, raw, labels)
    }

    fn folder_dir(&self, folder: &str) -> Result<PathBuf> {
        validate_folder(folder)?;
        Ok(self.root.join(folder))
    }

    /// Folder currently holding `mailbox_id`.
    fn locate(&self, mailbox_id: &str) -> Result<Option<PathBuf>> {
        if mailbox_id.contains(['/', '\\']) || mailbox_id.starts_with('.') {
            return Ok(None);
        }
        for dir in self.folders()? {
            if dir.join(format!("{mailbox_id}.eml")).is_file() {
                return Ok(Some(dir));
            }
        }
        Ok(None)
    }

    fn folders(&self) -> Result<Vec<PathBuf>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut dirs = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(|e| StripError::io(&self.root, e))? {
            let entry = entry.map_err(|e| StripError::io(&self.root, e))?;
            if entry.path().is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    fn require(&self, msg: &MessageRef) -> Result<PathBuf> {
        self.locate(&msg.mailbox_id)?
            .ok_or_else(|| StripError::Remote(format!("message {} not found", msg.mailbox_id)))
    }

    fn read_meta(dir: &Path, mailbox_id: &str) -> Result<Meta> {
        let path = dir.join(format!("{mailbox_id}.json"));
        if !path.exists() {
            let raw_path = dir.join(format!("{mailbox_id}.eml"));
            let raw = fs::read(&raw_path).map_err(|e| StripError::io(&raw_path, e))?;
            return Ok(Meta {
                message_id: message_id_of(&raw),
                labels: BTreeSet::new(),
            });
        }
        let text = fs::read_to_string(&path).map_err(|e| StripError::io(&path, e))?;
        serde_json::from_str(&text).map_err(|e| {
            StripError::io(&path, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })
    }

    fn write_meta(dir: &Path, mailbox_id: &str, meta: &Meta) -> Result<()> {
        let path = dir.join(format!("{mailbox_id}.json"));
        let text = serde_json::to_string_pretty(meta).map_err(|e| {
            StripError::io(&path, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        fs::write(&path, text).map_err(|e| StripError::io(&path, e))
    }

    fn store(&self, folder: &str, raw: &[u8], labels: &BTreeSet<String>) -> Result<MessageRef> {
        let dir = self.folder_dir(folder)?;
        fs::create_dir_all(&dir).map_err(|e| StripError::io(&dir, e))?;
        let mailbox_id = uuid::Uuid::new_v4().simple().to_string();
        let eml = dir.join(format!("{mailbox_id}.eml"));
        fs::write(&eml, raw).map_err(|e| StripError::io(&eml, e))?;
        let meta = Meta {
            message_id: message_id_of(raw),
            labels: labels.clone(),
        };
        Self::write_meta(&dir, &mailbox_id, &meta)?;
        debug!(folder, mailbox_id = %mailbox_id, "Stored message");
        Ok(MessageRef::new(mailbox_id, meta.message_id))
    }

    fn remove(&self, msg: &MessageRef) -> Result<()> {
        let Some(dir) = self.locate(&msg.mailbox_id)? else {
            return Ok(());
        };
        for ext in ["eml", "json"] {
            let path = dir.join(format!("{}.{ext}", msg.mailbox_id));
            if path.exists() {
                fs::remove_file(&path).map_err(|e| StripError::io(&path, e))?;
            }
        }
        Ok(())
    }

    fn list(&self, dir: &Path) -> Result<Vec<(String, PathBuf)>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(dir).map_err(|e| StripError::io(dir, e))? {
            let path = entry.map_err(|e| StripError::io(dir, e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("eml") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                out.push((stem.to_string(), path.clone()));
            }
        }
        out.sort();
        Ok(out)
    }
}

fn validate_folder(folder: &str) -> Result<()> {
    if folder.is_empty() || folder.contains(['/', '\\']) || folder.starts_with('.') {
        return Err(StripError::Remote(format!("invalid folder name '{folder}'")));
    }
    Ok(())
}

fn message_id_of(raw: &[u8]) -> String {
    header::summarize(header::header_block(raw)).message_id
}

impl MailboxClient for DirMailbox {
    fn search(&self, criteria: &SearchCriteria) -> Result<SearchResults<'_>> {
        let dirs = match criteria.folder.as_deref() {
            Some(folder) => vec![self.folder_dir(folder)?],
            None => self
                .folders()?
                .into_iter()
                .filter(|d| d.file_name().and_then(|n| n.to_str()) != Some(self.trash_folder.as_str()))
                .collect(),
        };
        let mut candidates = Vec::new();
        for dir in dirs {
            for (id, path) in self.list(&dir)? {
                candidates.push((dir.clone(), id, path));
            }
        }

        let criteria = criteria.clone();
        let limit = criteria.limit.unwrap_or(usize::MAX);
        let iter = candidates
            .into_iter()
            .filter_map(move |(dir, id, path)| {
                if let Some(min) = criteria.min_size {
                    match fs::metadata(&path) {
                        Ok(m) if m.len() < min => return None,
                        Ok(_) => {}
                        Err(e) => return Some(Err(StripError::io(&path, e))),
                    }
                }
                let meta = match Self::read_meta(&dir, &id) {
                    Ok(m) => m,
                    Err(e) => return Some(Err(e)),
                };
                if let Some(wanted) = criteria.message_id.as_deref() {
                    if meta.message_id != wanted {
                        return None;
                    }
                }
                Some(Ok(MessageRef::new(id, meta.message_id)))
            })
            .take(limit);
        Ok(Box::new(iter))
    }

    fn fetch(&self, msg: &MessageRef) -> Result<Vec<u8>> {
        let dir = self.require(msg)?;
        let path = dir.join(format!("{}.eml", msg.mailbox_id));
        fs::read(&path).map_err(|e| StripError::io(&path, e))
    }

    fn labels(&self, msg: &MessageRef) -> Result<BTreeSet<String>> {
        let dir = self.require(msg)?;
        Ok(Self::read_meta(&dir, &msg.mailbox_id)?.labels)
    }

    fn upload(&self, raw: &[u8], folder: &str) -> Result<MessageRef> {
        self.store(folder, raw, &BTreeSet::new())
    }

    fn apply_labels(&self, msg: &MessageRef, labels: &BTreeSet<String>) -> Result<()> {
        let dir = self.require(msg)?;
        let mut meta = Self::read_meta(&dir, &msg.mailbox_id)?;
        meta.labels.extend(labels.iter().cloned());
        Self::write_meta(&dir, &msg.mailbox_id, &meta)
    }

    fn trash(&self, msg: &MessageRef) -> Result<()> {
        let dir = self.require(msg)?;
        let trash = self.folder_dir(&self.trash_folder)?;
        if dir == trash {
            return Ok(());
        }
        fs::create_dir_all(&trash).map_err(|e| StripError::io(&trash, e))?;
        for ext in ["eml", "json"] {
            let from = dir.join(format!("{}.{ext}", msg.mailbox_id));
            if from.exists() {
                let to = trash.join(format!("{}.{ext}", msg.mailbox_id));
                fs::rename(&from, &to).map_err(|e| StripError::io(&from, e))?;
            }
        }
        Ok(())
    }

    fn find_in_trash(&self, message_id: &str) -> Result<Option<MessageRef>> {
        let trash = self.folder_dir(&self.trash_folder)?;
        for (id, _) in self.list(&trash)? {
            let meta = Self::read_meta(&trash, &id)?;
            if meta.message_id == message_id {
                return Ok(Some(MessageRef::new(id, meta.message_id)));
            }
        }
        Ok(None)
    }

    fn copy_from_trash(&self, msg: &MessageRef, folder: &str) -> Result<MessageRef> {
        let trash = self.folder_dir(&self.trash_folder)?;
        let path = trash.join(format!("{}.eml", msg.mailbox_id));
        if !path.is_file() {
            return Err(StripError::Remote(format!(
                "message {} is not in trash",
                msg.mailbox_id
            )));
        }
        let raw = fs::read(&path).map_err(|e| StripError::io(&path, e))?;
        self.store(folder, &raw, &BTreeSet::new())
    }

    fn delete(&self, msg: &MessageRef) -> Result<()> {
        self.remove(msg)
    }

    fn permanently_delete(&self, msg: &MessageRef) -> Result<()> {
        self.remove(msg)
    }
}
