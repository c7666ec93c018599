//! Attachment extraction: classify, decode, digest, back up.

use tracing::{debug, info};

use crate::backup::layout::{BackupTarget, LayoutPolicy};
use crate::backup::BackupStore;
use crate::error::{Result, StripError};
use crate::model::attachment::{AttachmentRecord, Digest};
use crate::parser::header::HeaderSummary;
use crate::parser::mime::{self, Classification, InlinePolicy, MimeTree};

/// Separates attachments from kept content and writes them to the backup store.
pub struct AttachmentExtractor<'a> {
    pub backups: &'a dyn BackupStore,
    pub layout: &'a dyn LayoutPolicy,
    pub inline_policy: &'a dyn InlinePolicy,
    pub max_attachment_size: u64,
}

/// Classification outcome for a whole message.
#[derive(Debug)]
pub enum Inspection<'t, 'a> {
    /// Encrypted payload somewhere in the message. Nothing may be touched.
    Encrypted,
    /// Parts classified; `attachments()` may be empty.
    Plain(Classification<'t, 'a>),
}

impl<'a> AttachmentExtractor<'a> {
    /// Classify every part. Runs before any destructive step.
    pub fn classify<'t, 'm>(&self, tree: &'t MimeTree<'m>) -> Inspection<'t, 'm> {
        let classification = mime::classify_tree(tree, self.inline_policy);
        if classification.encrypted {
            Inspection::Encrypted
        } else {
            Inspection::Plain(classification)
        }
    }

    /// Decode every attachment, compute its digest and store it.
    ///
    /// With `dry_run` the backup store is not touched; records still carry
    /// the digest and the path the layout would use.
    pub fn extract(
        &self,
        classification: &Classification<'_, '_>,
        headers: &HeaderSummary,
        dry_run: bool,
    ) -> Result<Vec<AttachmentRecord>> {
        let mut records = Vec::new();

        for part in classification.attachments() {
            let decoded = mime::decode_part(part)?;
            let filename = decoded
                .filename
                .or_else(|| part.raw_filename.clone())
                .filter(|f| !f.trim().is_empty())
                .unwrap_or_else(|| format!("attachment-{}", part.path));
            let size = decoded.bytes.len() as u64;

            if size > self.max_attachment_size {
                return Err(StripError::AttachmentTooLarge {
                    filename,
                    size,
                    max: self.max_attachment_size,
                });
            }

            let digest = Digest::of(&decoded.bytes);
            let backup_path = self.layout.path_for(&BackupTarget {
                message_id: &headers.message_id,
                subject: &headers.subject,
                date: headers.date,
                filename: &filename,
                digest: &digest,
            });

            if !dry_run {
                let receipt = self.backups.write(&backup_path, &decoded.bytes)?;
                if receipt.digest != digest || receipt.size != size {
                    return Err(StripError::BackupIntegrity {
                        path: backup_path,
                        expected: digest.to_string(),
                        actual: receipt.digest.to_string(),
                    });
                }
                debug!(
                    message_id = %headers.message_id,
                    path = %backup_path.display(),
                    size,
                    "Attachment backed up"
                );
            }

            records.push(AttachmentRecord {
                filename,
                content_type: part.content_type.clone(),
                size,
                digest,
                backup_path,
                part_path: part.path.clone(),
            });
        }

        info!(
            message_id = %headers.message_id,
            attachments = records.len(),
            dry_run,
            "Attachments extracted"
        );
        Ok(records)
    }
}
