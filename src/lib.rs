//! `mailstrip` strips large attachments from mailbox messages.
//!
//! Every attachment is backed up and verified before the message is replaced
//! by a stripped copy. Each step is journaled ahead of its side effect so an
//! interrupted run can be finished or rolled back, and any committed message
//! can be reverted while its original is still in trash.

pub mod backup;
pub mod config;
pub mod engine;
pub mod error;
pub mod export;
pub mod journal;
pub mod mailbox;
pub mod manifest;
pub mod model;
pub mod parser;
