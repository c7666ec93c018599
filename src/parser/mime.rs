//! Raw MIME tree, part classification, and part decoding.
//!
//! The tree keeps byte spans into the original message so that parts we do
//! not touch are re-emitted verbatim. Decoding of individual parts
//! (base64, quoted-printable, RFC 2047 filenames) is delegated to
//! `mail-parser`.

use std::collections::HashSet;

use mail_parser::{MessageParser, MimeHeaders};

use crate::error::{Result, StripError};
use crate::parser::header::{self, get_header, header_param, main_value};

/// Maximum depth for recursive multipart parsing (to prevent stack overflow on adversarial input).
const MAX_DEPTH: usize = 10;

/// Content types that mark a message as encrypted.
pub const ENCRYPTED_TYPES: &[&str] = &[
    "application/pkcs7-mime",
    "application/x-pkcs7-mime",
    "application/pgp-encrypted",
    "multipart/encrypted",
];

/// Detached signatures. Stripping them would break verification, so they stay.
const SIGNATURE_TYPES: &[&str] = &[
    "application/pkcs7-signature",
    "application/x-pkcs7-signature",
    "application/pgp-signature",
];

/// A node of the MIME tree, borrowing from the raw message.
#[derive(Debug, Clone)]
pub struct MimePart<'a> {
    /// IMAP-style part path (`"1"`, `"2.1"`). Empty for a multipart root.
    pub path: String,
    /// Full bytes of the part, headers included.
    pub raw: &'a [u8],
    /// Length of the header block, including its last line break.
    pub header_len: usize,
    /// Offset of the body within `raw`.
    pub body_offset: usize,
    /// Unfolded `(lowercase_name, value)` headers.
    pub headers: Vec<(String, String)>,
    /// Lowercased `type/subtype`.
    pub content_type: String,
    /// Lowercased disposition (`attachment`, `inline`), if any.
    pub disposition: Option<String>,
    /// Filename parameter as written in the headers (possibly still encoded).
    pub raw_filename: Option<String>,
    /// Content-ID without angle brackets.
    pub content_id: Option<String>,
    /// Sub-parts of a multipart node.
    pub children: Vec<MimePart<'a>>,
    /// `(start, end)` of each child within `raw`.
    child_spans: Vec<(usize, usize)>,
}

impl<'a> MimePart<'a> {
    /// The header block bytes.
    pub fn header_bytes(&self) -> &'a [u8] {
        &self.raw[..self.header_len]
    }

    /// The undecoded body bytes.
    pub fn body(&self) -> &'a [u8] {
        &self.raw[self.body_offset..]
    }

    pub fn is_multipart(&self) -> bool {
        !self.children.is_empty()
    }

    /// Whether the part declares a filename.
    pub fn has_filename(&self) -> bool {
        self.raw_filename
            .as_deref()
            .map(|f| !f.trim().is_empty())
            .unwrap_or(false)
    }

    /// Re-emit this part, substituting the parts named in `replace`.
    ///
    /// Untouched parts come out byte-for-byte identical.
    pub fn rebuild(&self, replace: &dyn Fn(&MimePart<'a>) -> Option<Vec<u8>>) -> Vec<u8> {
        if let Some(bytes) = replace(self) {
            return bytes;
        }
        if self.children.is_empty() {
            return self.raw.to_vec();
        }
        let mut out = Vec::with_capacity(self.raw.len());
        let mut cursor = 0;
        for (child, &(start, end)) in self.children.iter().zip(&self.child_spans) {
            out.extend_from_slice(&self.raw[cursor..start]);
            out.extend_from_slice(&child.rebuild(replace));
            cursor = end;
        }
        out.extend_from_slice(&self.raw[cursor..]);
        out
    }

    fn collect_leaves<'s>(&'s self, out: &mut Vec<&'s MimePart<'a>>) {
        if self.children.is_empty() {
            out.push(self);
        } else {
            for child in &self.children {
                child.collect_leaves(out);
            }
        }
    }
}

/// A parsed message.
#[derive(Debug, Clone)]
pub struct MimeTree<'a> {
    pub root: MimePart<'a>,
    /// Line break style of the top-level header block.
    pub newline: &'static str,
}

impl<'a> MimeTree<'a> {
    /// All leaf parts, depth-first.
    pub fn leaves(&self) -> Vec<&MimePart<'a>> {
        let mut out = Vec::new();
        self.root.collect_leaves(&mut out);
        out
    }

    /// Find a part by path.
    pub fn find(&self, path: &str) -> Option<&MimePart<'a>> {
        fn walk<'s, 'a>(p: &'s MimePart<'a>, path: &str) -> Option<&'s MimePart<'a>> {
            if p.path == path {
                return Some(p);
            }
            p.children.iter().find_map(|c| walk(c, path))
        }
        walk(&self.root, path)
    }
}

/// Parse a raw message into a [`MimeTree`].
pub fn parse_tree(raw_message: &[u8]) -> Result<MimeTree<'_>> {
    let message_bytes = skip_from_line(raw_message);
    if message_bytes.is_empty() {
        return Err(StripError::Mime("empty message".into()));
    }
    let (header_len, _) = split_header_body(message_bytes);
    let newline = if message_bytes[..header_len].windows(2).any(|w| w == b"\r\n") {
        "\r\n"
    } else {
        "\n"
    };
    let root = parse_part(message_bytes, String::new(), 0);
    Ok(MimeTree { root, newline })
}

fn parse_part(raw: &[u8], path: String, depth: usize) -> MimePart<'_> {
    let (header_len, body_offset) = split_header_body(raw);
    let headers = header::parse_header_block(&raw[..header_len]);

    let content_type_raw = get_header(&headers, "content-type").unwrap_or_default();
    let content_type = if content_type_raw.is_empty() {
        "text/plain".to_string()
    } else {
        main_value(&content_type_raw)
    };
    let disposition_raw = get_header(&headers, "content-disposition");
    let disposition = disposition_raw.as_deref().map(main_value);
    let raw_filename = disposition_raw
        .as_deref()
        .and_then(|d| header_param(d, "filename"))
        .or_else(|| header_param(&content_type_raw, "name"));
    let content_id = get_header(&headers, "content-id").map(|c| {
        header::extract_angle_bracket(&c)
            .trim_start_matches('<')
            .trim_end_matches('>')
            .to_string()
    });

    let mut part = MimePart {
        path: path.clone(),
        raw,
        header_len,
        body_offset,
        headers,
        content_type,
        disposition,
        raw_filename,
        content_id,
        children: Vec::new(),
        child_spans: Vec::new(),
    };

    if !part.content_type.starts_with("multipart/") || depth >= MAX_DEPTH {
        if path.is_empty() {
            part.path = "1".to_string();
        }
        return part;
    }
    let Some(boundary) = header_param(&content_type_raw, "boundary") else {
        if path.is_empty() {
            part.path = "1".to_string();
        }
        return part;
    };

    let spans = split_multipart(&raw[body_offset..], &boundary);
    for (i, (start, end)) in spans.into_iter().enumerate() {
        let child_path = if path.is_empty() {
            format!("{}", i + 1)
        } else {
            format!("{path}.{}", i + 1)
        };
        let (abs_start, abs_end) = (body_offset + start, body_offset + end);
        part.children
            .push(parse_part(&raw[abs_start..abs_end], child_path, depth + 1));
        part.child_spans.push((abs_start, abs_end));
    }
    if part.children.is_empty() && path.is_empty() {
        part.path = "1".to_string();
    }
    part
}

/// Locate the header/body split.
///
/// Returns `(header_len, body_offset)`; the header block keeps its final
/// line break and the blank line is skipped.
fn split_header_body(data: &[u8]) -> (usize, usize) {
    if data.starts_with(b"\r\n") {
        return (0, 2);
    }
    if data.starts_with(b"\n") {
        return (0, 1);
    }
    for i in 0..data.len().saturating_sub(1) {
        if data[i] == b'\n' && data[i + 1] == b'\n' {
            return (i + 1, i + 2);
        }
        if i + 3 < data.len()
            && data[i] == b'\r'
            && data[i + 1] == b'\n'
            && data[i + 2] == b'\r'
            && data[i + 3] == b'\n'
        {
            return (i + 2, i + 4);
        }
    }
    (data.len(), data.len())
}

/// Byte spans of each body part between boundary delimiters.
///
/// The line break before a delimiter belongs to the delimiter (RFC 2046 §5.1.1).
fn split_multipart(body: &[u8], boundary: &str) -> Vec<(usize, usize)> {
    let delimiter = format!("--{boundary}");
    let delimiter = delimiter.as_bytes();

    // (line start, line end incl. newline, is_close)
    let mut delimiters: Vec<(usize, usize, bool)> = Vec::new();
    let mut line_start = 0;
    while line_start < body.len() {
        let line_end = body[line_start..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|p| line_start + p + 1)
            .unwrap_or(body.len());
        let line = &body[line_start..line_end];
        if line.starts_with(delimiter) {
            let rest = &line[delimiter.len()..];
            if rest.starts_with(b"--") {
                delimiters.push((line_start, line_end, true));
                break;
            }
            if rest.iter().all(|b| b.is_ascii_whitespace()) {
                delimiters.push((line_start, line_end, false));
            }
        }
        line_start = line_end;
    }

    let mut spans = Vec::new();
    for (idx, &(_, open_end, is_close)) in delimiters.iter().enumerate() {
        if is_close {
            break;
        }
        let end = match delimiters.get(idx + 1) {
            Some(&(next_start, _, _)) => strip_trailing_newline(body, open_end, next_start),
            None => body.len(),
        };
        spans.push((open_end, end.max(open_end)));
    }
    spans
}

fn strip_trailing_newline(body: &[u8], start: usize, end: usize) -> usize {
    if end >= start + 2 && &body[end - 2..end] == b"\r\n" {
        end - 2
    } else if end > start && body[end - 1] == b'\n' {
        end - 1
    } else {
        end
    }
}

/// Closed set of part classifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartClass {
    /// Body text or structural content. Kept.
    BodyText,
    /// Inline image referenced from the body and accepted by the inline policy. Kept.
    InlineImage,
    /// Stripped and backed up.
    Attachment,
    /// Encrypted payload; the whole message is skipped.
    Encrypted,
}

/// Decides which CID-referenced parts count as inline content worth keeping.
///
/// The boundary between "inline image" and "attachment" is a per-deployment
/// policy, so it is injected rather than hard-coded.
pub trait InlinePolicy: Send + Sync {
    fn keep_inline(&self, part: &MimePart<'_>) -> bool;
}

/// Keeps CID-referenced images whose encoded body is at most `max_inline_size` bytes.
#[derive(Debug, Clone)]
pub struct CidReferencePolicy {
    pub preserve_inline_images: bool,
    pub max_inline_size: u64,
}

impl Default for CidReferencePolicy {
    fn default() -> Self {
        Self {
            preserve_inline_images: true,
            max_inline_size: 512 * 1024,
        }
    }
}

impl InlinePolicy for CidReferencePolicy {
    fn keep_inline(&self, part: &MimePart<'_>) -> bool {
        self.preserve_inline_images
            && part.content_type.starts_with("image/")
            && part.body().len() as u64 <= self.max_inline_size
    }
}

/// Classify one leaf part.
pub fn classify(
    part: &MimePart<'_>,
    referenced_cids: &HashSet<String>,
    policy: &dyn InlinePolicy,
) -> PartClass {
    let ct = part.content_type.as_str();
    if ENCRYPTED_TYPES.contains(&ct) {
        return PartClass::Encrypted;
    }
    if SIGNATURE_TYPES.contains(&ct) || part.is_multipart() {
        return PartClass::BodyText;
    }
    if part.disposition.as_deref() == Some("attachment") {
        return PartClass::Attachment;
    }

    let referenced = part
        .content_id
        .as_ref()
        .map(|cid| referenced_cids.contains(&cid.to_ascii_lowercase()))
        .unwrap_or(false);

    if referenced && policy.keep_inline(part) {
        return PartClass::InlineImage;
    }
    if part.has_filename() || referenced {
        return PartClass::Attachment;
    }
    PartClass::BodyText
}

/// A leaf together with its classification.
#[derive(Debug, Clone)]
pub struct ClassifiedPart<'t, 'a> {
    pub part: &'t MimePart<'a>,
    pub class: PartClass,
}

/// Result of classifying a whole message.
#[derive(Debug, Clone)]
pub struct Classification<'t, 'a> {
    /// True if any part (or the root) is encrypted.
    pub encrypted: bool,
    /// Every leaf, depth-first.
    pub parts: Vec<ClassifiedPart<'t, 'a>>,
}

impl<'t, 'a> Classification<'t, 'a> {
    pub fn attachments(&self) -> impl Iterator<Item = &'t MimePart<'a>> + '_ {
        self.parts
            .iter()
            .filter(|p| p.class == PartClass::Attachment)
            .map(|p| p.part)
    }

    /// Paths of the parts that stay in the replacement.
    #[cfg(test)]
    pub fn kept_paths(&self) -> Vec<String> {
        self.parts
            .iter()
            .filter(|p| matches!(p.class, PartClass::BodyText | PartClass::InlineImage))
            .map(|p| p.part.path.clone())
            .collect()
    }
}

/// Classify every leaf of `tree`.
pub fn classify_tree<'t, 'a>(
    tree: &'t MimeTree<'a>,
    policy: &dyn InlinePolicy,
) -> Classification<'t, 'a> {
    let root_encrypted = ENCRYPTED_TYPES.contains(&tree.root.content_type.as_str());
    let leaves = tree.leaves();
    let referenced = referenced_content_ids(&leaves);

    let parts: Vec<ClassifiedPart<'t, 'a>> = leaves
        .into_iter()
        .map(|part| ClassifiedPart {
            part,
            class: classify(part, &referenced, policy),
        })
        .collect();

    let encrypted = root_encrypted || parts.iter().any(|p| p.class == PartClass::Encrypted);
    Classification { encrypted, parts }
}

/// Collect the lowercased Content-IDs referenced as `cid:` from text bodies.
fn referenced_content_ids(leaves: &[&MimePart<'_>]) -> HashSet<String> {
    let mut cids = HashSet::new();
    for part in leaves {
        if part.content_type != "text/html" && part.content_type != "text/plain" {
            continue;
        }
        if part.disposition.as_deref() == Some("attachment") {
            continue;
        }
        let text = match decode_part(part) {
            Ok(decoded) => String::from_utf8_lossy(&decoded.bytes).into_owned(),
            Err(_) => String::from_utf8_lossy(part.body()).into_owned(),
        };
        collect_cids(&text, &mut cids);
    }
    cids
}

fn collect_cids(text: &str, out: &mut HashSet<String>) {
    let lower = text.to_ascii_lowercase();
    let mut search_from = 0;
    while let Some(pos) = lower[search_from..].find("cid:") {
        let start = search_from + pos + 4;
        let end = lower[start..]
            .find(|c: char| c == '"' || c == '\'' || c == ')' || c == '>' || c == ']' || c.is_whitespace())
            .map(|e| start + e)
            .unwrap_or(lower.len());
        if end > start {
            out.insert(lower[start..end].to_string());
        }
        search_from = end.max(start);
    }
}

/// A decoded leaf.
#[derive(Debug, Clone)]
pub struct DecodedPart {
    /// Transfer-decoded content.
    pub bytes: Vec<u8>,
    /// Decoded filename, if the part carries one.
    pub filename: Option<String>,
}

/// Decode the content of one leaf part.
pub fn decode_part(part: &MimePart<'_>) -> Result<DecodedPart> {
    if part.header_len == 0 {
        // No headers: 7bit text/plain by definition.
        return Ok(DecodedPart {
            bytes: part.body().to_vec(),
            filename: None,
        });
    }
    let parser = MessageParser::default();
    let parsed = parser.parse(part.raw).ok_or_else(|| {
        StripError::Mime(format!("Failed to parse MIME part {}", part.path))
    })?;
    let body = parsed
        .parts
        .first()
        .ok_or_else(|| StripError::Mime(format!("MIME part {} has no body", part.path)))?;

    Ok(DecodedPart {
        bytes: body.contents().to_vec(),
        filename: body.attachment_name().map(String::from),
    })
}

/// Skip the `From ` separator line at the start of MBOX-exported messages.
fn skip_from_line(data: &[u8]) -> &[u8] {
    let data = data.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(data);

    if data.starts_with(b"From ") {
        if let Some(pos) = data.iter().position(|&b| b == b'\n') {
            return &data[pos + 1..];
        }
    }
    data
}
