//! Journal storage backends.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{error, warn};

use crate::error::{Result, StripError};

use super::{LogEntry, ENTRY_VERSION};

/// Durable append-only storage for [`LogEntry`] records.
pub trait JournalStore: Send + Sync {
    /// Append one entry. Must not return before the entry is durable.
    fn append(&self, entry: &LogEntry) -> Result<()>;

    /// Every stored entry, in append order.
    fn read_all(&self) -> Result<Vec<LogEntry>>;

    /// Atomically replace the whole journal. Only compaction calls this.
    fn replace_all(&self, entries: &[LogEntry]) -> Result<()>;
}

/// JSON Lines journal file, one entry per line, fsynced per append.
#[derive(Debug)]
pub struct FileJournal {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileJournal {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| StripError::io(parent, e))?;
            }
        }
        seal_tail(&path)?;
        let file = open_append(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Make the file end on a line break before anything is appended to it.
///
/// A crash mid-append leaves a partial last line. If it still parses it only
/// lost its newline, which is restored; otherwise it is cut off.
fn seal_tail(path: &Path) -> Result<()> {
    let data = match fs::read(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(StripError::io(path, e)),
    };
    if data.is_empty() || data.ends_with(b"\n") {
        return Ok(());
    }
    let keep = data.iter().rposition(|&b| b == b'\n').map_or(0, |p| p + 1);
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| StripError::io(path, e))?;
    if serde_json::from_slice::<LogEntry>(&data[keep..]).is_ok() {
        file.seek(SeekFrom::End(0))
            .and_then(|_| file.write_all(b"\n"))
            .map_err(|e| StripError::io(path, e))?;
        file.sync_data().map_err(|e| StripError::io(path, e))?;
    } else {
        warn!(
            path = %path.display(),
            dropped = data.len() - keep,
            "Truncating torn trailing journal line"
        );
        file.set_len(keep as u64)
            .and_then(|()| file.sync_data())
            .map_err(|e| StripError::io(path, e))?;
    }
    Ok(())
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)
        .map_err(|e| StripError::io(path, e))
}

fn encode(entry: &LogEntry) -> Result<String> {
    serde_json::to_string(entry)
        .map(|mut line| {
            line.push('\n');
            line
        })
        .map_err(|e| StripError::LogWrite(format!("entry serialization failed: {e}")))
}

impl JournalStore for FileJournal {
    fn append(&self, entry: &LogEntry) -> Result<()> {
        let line = encode(entry)?;
        let mut file = self
            .file
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        file.write_all(line.as_bytes())
            .and_then(|()| file.sync_data())
            .map_err(|e| StripError::LogWrite(format!("{}: {e}", self.path.display())))
    }

    fn read_all(&self) -> Result<Vec<LogEntry>> {
        let _file = self
            .file
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let data = match fs::read(&self.path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StripError::io(&self.path, e)),
        };
        let text = String::from_utf8_lossy(&data);
        let lines: Vec<&str> = text.lines().collect();
        let mut entries = Vec::with_capacity(lines.len());

        for (idx, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogEntry>(line) {
                Ok(entry) if entry.v > ENTRY_VERSION => {
                    return Err(StripError::LogWrite(format!(
                        "{}: entry version {} is newer than supported version {ENTRY_VERSION}",
                        self.path.display(),
                        entry.v
                    )));
                }
                Ok(entry) => entries.push(entry),
                Err(e) if idx + 1 == lines.len() => {
                    warn!(path = %self.path.display(), error = %e, "Skipping torn trailing journal line");
                }
                Err(e) => {
                    error!(path = %self.path.display(), line = idx + 1, error = %e, "Corrupt journal line");
                    return Err(StripError::LogWrite(format!(
                        "{}: line {} is corrupt: {e}",
                        self.path.display(),
                        idx + 1
                    )));
                }
            }
        }
        Ok(entries)
    }

    fn replace_all(&self, entries: &[LogEntry]) -> Result<()> {
        let mut file = self
            .file
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let mut out = File::create(&tmp).map_err(|e| StripError::io(&tmp, e))?;
            for entry in entries {
                out.write_all(encode(entry)?.as_bytes())
                    .map_err(|e| StripError::io(&tmp, e))?;
            }
            out.sync_all().map_err(|e| StripError::io(&tmp, e))?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| StripError::io(&self.path, e))?;
        *file = open_append(&self.path)?;
        Ok(())
    }
}

/// In-memory journal.
///
/// `fail_after(n)` lets the next `n` appends succeed and fails every one
/// after that with [`StripError::LogWrite`], which is how crashes are
/// simulated in tests.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    entries: Mutex<Vec<LogEntry>>,
    budget: Mutex<Option<usize>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// A journal holding `entries`, as found after a restart.
    pub fn with_entries(entries: Vec<LogEntry>) -> Self {
        Self {
            entries: Mutex::new(entries),
            budget: Mutex::new(None),
        }
    }

    pub fn fail_after(&self, appends: usize) {
        *self
            .budget
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(appends);
    }

    /// Copy of the stored entries.
    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl JournalStore for MemoryJournal {
    fn append(&self, entry: &LogEntry) -> Result<()> {
        let mut budget = self
            .budget
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(left) = budget.as_mut() {
            if *left == 0 {
                return Err(StripError::LogWrite("journal unavailable".into()));
            }
            *left -= 1;
        }
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(entry.clone());
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<LogEntry>> {
        Ok(self.snapshot())
    }

    fn replace_all(&self, entries: &[LogEntry]) -> Result<()> {
        *self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = entries.to_vec();
        Ok(())
    }
}
