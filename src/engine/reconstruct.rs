//! Replacement message construction.
//!
//! Each stripped part is swapped for a `text/plain` placeholder part in the
//! same position; every other byte of the original is copied verbatim, so
//! threading headers (`Message-ID`, `References`, `In-Reply-To`, ...) are
//! unchanged. One marker header is added to the top-level header block.

use std::collections::HashMap;
use std::path::PathBuf;

use humansize::{format_size, DECIMAL};

use crate::error::{Result, StripError};
use crate::model::attachment::{AttachmentRecord, Digest};
use crate::parser::header::{self, THREADING_HEADERS};
use crate::parser::mime::{self, MimePart, MimeTree};

/// Header identifying a replacement and the transaction that built it.
pub const MARKER_HEADER: &str = "X-Mailstrip-Replacement";

const BEGIN: &str = "[Attachment Removed]";
const END: &str = "[End Attachment]";

/// Headers describing a part's content, replaced when the root itself is stripped.
const CONTENT_HEADERS: &[&str] = &[
    "content-type",
    "content-transfer-encoding",
    "content-disposition",
    "content-id",
    "content-description",
];

/// One placeholder as read back from a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    pub digest: Digest,
    pub backup_location: PathBuf,
}

/// Builds replacement messages.
pub struct MessageReconstructor;

impl MessageReconstructor {
    /// Rebuild `tree` with every part named in `records` replaced by its placeholder.
    pub fn rebuild(tree: &MimeTree<'_>, records: &[AttachmentRecord], txn_id: &str) -> Result<Vec<u8>> {
        let nl = tree.newline;
        let by_path: HashMap<&str, &AttachmentRecord> =
            records.iter().map(|r| (r.part_path.as_str(), r)).collect();
        let marker = format!(
            "{MARKER_HEADER}: txn={txn_id}; stripped={}{nl}",
            records.len()
        );

        let root = &tree.root;
        if let Some(record) = by_path.get(root.path.as_str()).filter(|_| !root.is_multipart()) {
            return Ok(rebuild_single_part(root, record, &marker, nl));
        }

        for record in records {
            if tree.find(&record.part_path).is_none() {
                return Err(StripError::Mime(format!(
                    "no MIME part {} to replace",
                    record.part_path
                )));
            }
        }

        let body = root.rebuild(&|part: &MimePart<'_>| {
            if part.is_multipart() {
                return None;
            }
            by_path
                .get(part.path.as_str())
                .map(|record| placeholder_part(record, nl))
        });

        let mut out = Vec::with_capacity(body.len() + marker.len());
        out.extend_from_slice(&body[..root.header_len]);
        out.extend_from_slice(marker.as_bytes());
        out.extend_from_slice(&body[root.header_len..]);
        Ok(out)
    }
}

/// A single-part message whose only body is the attachment.
fn rebuild_single_part(root: &MimePart<'_>, record: &AttachmentRecord, marker: &str, nl: &str) -> Vec<u8> {
    let mut out = Vec::new();
    let headers = root.header_bytes();
    let mut skipping = false;
    for line in headers.split_inclusive(|&b| b == b'\n') {
        let continuation = matches!(line.first(), Some(b' ') | Some(b'\t'));
        if !continuation {
            skipping = line
                .iter()
                .position(|&b| b == b':')
                .map(|pos| {
                    let name = String::from_utf8_lossy(&line[..pos]).trim().to_ascii_lowercase();
                    CONTENT_HEADERS.contains(&name.as_str())
                })
                .unwrap_or(false);
        }
        if !skipping {
            out.extend_from_slice(line);
        }
    }
    if !out.is_empty() && !out.ends_with(b"\n") {
        out.extend_from_slice(nl.as_bytes());
    }
    out.extend_from_slice(marker.as_bytes());
    out.extend_from_slice(placeholder_part(record, nl).as_slice());
    out.extend_from_slice(nl.as_bytes());
    out
}

/// Placeholder body text for one record.
pub fn placeholder_text(record: &AttachmentRecord, nl: &str) -> String {
    let lines = [
        BEGIN.to_string(),
        format!("Filename: {}", single_line(&record.filename)),
        format!("Content-Type: {}", single_line(&record.content_type)),
        format!(
            "Original-Size: {} bytes ({})",
            record.size,
            format_size(record.size, DECIMAL)
        ),
        format!("Digest: {}", record.digest),
        format!(
            "Backup-Location: {}",
            single_line(&record.backup_path.to_string_lossy())
        ),
        END.to_string(),
    ];
    lines.join(nl)
}

/// Complete MIME part (headers and body) replacing one attachment.
pub fn placeholder_part(record: &AttachmentRecord, nl: &str) -> Vec<u8> {
    format!(
        "Content-Type: text/plain; charset=utf-8{nl}\
         Content-Transfer-Encoding: 8bit{nl}\
         Content-Disposition: inline{nl}\
         {nl}\
         {}",
        placeholder_text(record, nl)
    )
    .into_bytes()
}

fn single_line(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect()
}

/// Read every placeholder back out of a message.
///
/// Text parts are transfer-decoded first, so a mailbox that re-encodes the
/// upload does not hide the placeholders.
pub fn parse_placeholders(raw: &[u8]) -> Result<Vec<Placeholder>> {
    let tree = mime::parse_tree(raw)?;
    let mut found = Vec::new();
    for part in tree.leaves() {
        if part.content_type != "text/plain" {
            continue;
        }
        let decoded = mime::decode_part(part)?;
        found.extend(parse_placeholder_text(&String::from_utf8_lossy(&decoded.bytes)));
    }
    Ok(found)
}

fn parse_placeholder_text(text: &str) -> Vec<Placeholder> {
    let mut out = Vec::new();
    let mut fields: Option<HashMap<String, String>> = None;

    for line in text.lines().map(str::trim_end) {
        if line == BEGIN {
            fields = Some(HashMap::new());
            continue;
        }
        if line == END {
            if let Some(f) = fields.take() {
                if let Some(p) = placeholder_from_fields(&f) {
                    out.push(p);
                }
            }
            continue;
        }
        if let (Some(f), Some((key, value))) = (fields.as_mut(), line.split_once(": ")) {
            f.insert(key.to_string(), value.to_string());
        }
    }
    out
}

fn placeholder_from_fields(f: &HashMap<String, String>) -> Option<Placeholder> {
    let size = f
        .get("Original-Size")?
        .split_whitespace()
        .next()?
        .parse()
        .ok()?;
    Some(Placeholder {
        filename: f.get("Filename")?.clone(),
        content_type: f.get("Content-Type")?.clone(),
        size,
        digest: Digest::parse(f.get("Digest")?)?,
        backup_location: PathBuf::from(f.get("Backup-Location")?),
    })
}

/// Check that every threading-critical header survived byte-for-byte.
pub fn validate_headers(original: &[u8], rebuilt: &[u8]) -> Result<()> {
    let before = header::header_block(original);
    let after = header::header_block(rebuilt);
    for name in THREADING_HEADERS {
        if header::raw_header_lines(before, name) != header::raw_header_lines(after, name) {
            return Err(StripError::Mime(format!(
                "critical header '{name}' changed during reconstruction"
            )));
        }
    }
    Ok(())
}

/// Transaction id carried by a replacement's marker header.
pub fn marker_txn(raw: &[u8]) -> Option<String> {
    let headers = header::parse_header_block(header::header_block(raw));
    let value = header::get_header(&headers, &MARKER_HEADER.to_ascii_lowercase())?;
    value
        .split(';')
        .find_map(|p| p.trim().strip_prefix("txn="))
        .map(|t| t.trim().to_string())
}
