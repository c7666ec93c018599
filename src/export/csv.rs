//! Export the manifest to CSV.
//!
//! Output is UTF-8 with BOM for Excel compatibility.

use std::io::Write;

use crate::error::Result;
use crate::model::manifest::ManifestEntry;

use super::export_error;

const HEADER: &str = "Message_ID,Status,Subject,Original_Size,Stripped_Size,Attachments,\
Attachment_Bytes,Filenames,Digests,Backup_Paths,Labels,Replacement_ID,Restored_ID,Updated,Error";

/// Write one row per manifest entry.
///
/// Multi-valued columns (filenames, digests, backup paths, labels) are
/// joined with `"; "`.
pub fn write_csv(entries: &[ManifestEntry], out: &mut dyn Write) -> Result<()> {
    // UTF-8 BOM for Excel
    out.write_all(&[0xEF, 0xBB, 0xBF]).map_err(export_error)?;
    writeln!(out, "{HEADER}").map_err(export_error)?;

    for entry in entries {
        let join = |items: Vec<String>| items.join("; ");
        let filenames = join(entry.attachments.iter().map(|a| a.filename.clone()).collect());
        let digests = join(entry.attachments.iter().map(|a| a.digest.to_string()).collect());
        let paths = join(
            entry
                .attachments
                .iter()
                .map(|a| a.backup_path.to_string_lossy().into_owned())
                .collect(),
        );
        let labels = join(entry.labels.iter().cloned().collect());
        let updated = entry
            .transitions
            .last()
            .map(|t| t.at.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();

        let row = format!(
            "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
            csv_escape(entry.message_id()),
            entry.status,
            csv_escape(&entry.subject),
            entry.original_size,
            entry.stripped_size.map(|s| s.to_string()).unwrap_or_default(),
            entry.attachments.len(),
            entry.stripped_bytes(),
            csv_escape(&filenames),
            csv_escape(&digests),
            csv_escape(&paths),
            csv_escape(&labels),
            csv_escape(entry.replacement.as_ref().map_or("", |r| r.mailbox_id.as_str())),
            csv_escape(entry.restored.as_ref().map_or("", |r| r.mailbox_id.as_str())),
            updated,
            csv_escape(entry.error.as_deref().unwrap_or("")),
        );
        writeln!(out, "{row}").map_err(export_error)?;
    }

    out.flush().map_err(export_error)
}

/// Escape a value for CSV (RFC 4180).
///
/// Wraps in double quotes if the value contains commas, quotes, or newlines.
fn csv_escape(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') || value.contains('\r') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use chrono::Utc;

    use super::*;
    use crate::model::attachment::{AttachmentRecord, Digest};
    use crate::model::message::MessageRef;

    #[test]
    fn test_csv_escape_simple() {
        assert_eq!(csv_escape("hello"), "hello");
    }

    #[test]
    fn test_csv_escape_comma() {
        assert_eq!(csv_escape("hello, world"), "\"hello, world\"");
    }

    #[test]
    fn test_csv_escape_quotes() {
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_write_csv_rows() {
        let mut entry = ManifestEntry::scanned(MessageRef::new("m1", "<a@x>"), Utc::now());
        entry.subject = "Q3, final".into();
        entry.labels.insert("Work".into());
        entry.attachments.push(AttachmentRecord {
            filename: "r.pdf".into(),
            content_type: "application/pdf".into(),
            size: 5,
            digest: Digest::of(b"hello"),
            backup_path: PathBuf::from("by-digest/2c/x-r.pdf"),
            part_path: "2".into(),
        });

        let mut out = Vec::new();
        write_csv(&[entry], &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with('\u{feff}'));

        let lines: Vec<&str> = text.trim_start_matches('\u{feff}').lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], HEADER);
        assert!(lines[1].starts_with("<a@x>,scanned,\"Q3, final\",0,,1,5,r.pdf,sha256:"));
        assert!(lines[1].contains(",Work,"));
    }
}
