//! Mailbox capability and its implementations.
//!
//! The engine talks to the mailbox service only through [`MailboxClient`].
//! Calls go through a [`gateway::MailboxGateway`], which adds the global rate
//! limit and the retry policy.

pub mod gateway;
pub mod local;
pub mod memory;
pub mod rate_limit;
pub mod retry;

use std::collections::BTreeSet;

use crate::error::Result;
use crate::model::message::{MessageRef, SearchCriteria};

pub use gateway::MailboxGateway;
pub use local::DirMailbox;
pub use memory::MemoryMailbox;

/// Lazy sequence of search results.
pub type SearchResults<'a> = Box<dyn Iterator<Item = Result<MessageRef>> + Send + 'a>;

/// Operations the engine needs from a mailbox service.
///
/// Calls block. Together with backup-store I/O they are the only places a
/// worker waits.
pub trait MailboxClient: Send + Sync {
    /// Messages matching `criteria`.
    fn search(&self, criteria: &SearchCriteria) -> Result<SearchResults<'_>>;

    /// Raw RFC 5322 bytes of a message.
    fn fetch(&self, msg: &MessageRef) -> Result<Vec<u8>>;

    /// Labels currently carried by a message.
    fn labels(&self, msg: &MessageRef) -> Result<BTreeSet<String>>;

    /// Store a new message in `folder`.
    fn upload(&self, raw: &[u8], folder: &str) -> Result<MessageRef>;

    /// Add `labels` to a message. Applying labels it already has is a no-op.
    fn apply_labels(&self, msg: &MessageRef, labels: &BTreeSet<String>) -> Result<()>;

    /// Move a message to trash. Trashing a trashed message is a no-op.
    fn trash(&self, msg: &MessageRef) -> Result<()>;

    /// Find a trashed message by `Message-ID`.
    fn find_in_trash(&self, message_id: &str) -> Result<Option<MessageRef>>;

    /// Copy a trashed message back into `folder`.
    fn copy_from_trash(&self, msg: &MessageRef, folder: &str) -> Result<MessageRef>;

    /// Remove a message the engine uploaded itself (a replacement).
    ///
    /// Deleting a message that no longer exists is a no-op.
    fn delete(&self, msg: &MessageRef) -> Result<()>;

    /// Irreversibly remove a message. Never called by the engine; exposed for
    /// separately invoked retention tooling.
    fn permanently_delete(&self, msg: &MessageRef) -> Result<()>;
}
