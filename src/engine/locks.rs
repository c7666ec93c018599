//! Per-message exclusion and batch cancellation.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Result, StripError};

/// Message-IDs with a transaction in flight.
///
/// At most one worker holds a given Message-ID; a second claim fails with
/// [`StripError::Busy`] instead of waiting.
#[derive(Debug, Default)]
pub struct RefLocks {
    held: Mutex<HashSet<String>>,
}

impl RefLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, message_id: &str) -> Result<RefGuard<'_>> {
        let mut held = self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !held.insert(message_id.to_string()) {
            return Err(StripError::Busy(message_id.to_string()));
        }
        Ok(RefGuard {
            locks: self,
            message_id: message_id.to_string(),
        })
    }

    #[cfg(test)]
    pub fn is_held(&self, message_id: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(message_id)
    }
}

/// Releases its Message-ID when dropped.
#[derive(Debug)]
pub struct RefGuard<'a> {
    locks: &'a RefLocks,
    message_id: String,
}

impl Drop for RefGuard<'_> {
    fn drop(&mut self) {
        self.locks
            .held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.message_id);
    }
}

/// Cooperative cancellation, checked between messages only.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
