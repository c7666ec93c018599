//! RFC 5322 header handling: byte decoding, unfolding, parameters, and dates.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use tracing::warn;

/// Headers the reconstructed message must carry byte-for-byte.
pub const THREADING_HEADERS: &[&str] = &[
    "message-id",
    "date",
    "from",
    "to",
    "cc",
    "subject",
    "in-reply-to",
    "references",
];

/// The fields of a message header block the engine cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderSummary {
    /// `Message-ID`, angle brackets included. Empty if missing.
    pub message_id: String,
    /// Raw (undecoded) subject.
    pub subject: String,
    /// Parsed `Date:` header.
    pub date: Option<DateTime<Utc>>,
}

/// Summarize a raw header block (everything before the first blank line).
pub fn summarize(raw_headers: &[u8]) -> HeaderSummary {
    let headers = parse_header_block(raw_headers);

    HeaderSummary {
        message_id: get_header(&headers, "message-id")
            .map(|s| extract_angle_bracket(&s))
            .unwrap_or_default(),
        subject: get_header(&headers, "subject").unwrap_or_default(),
        date: get_header(&headers, "date").and_then(|d| parse_date(&d)),
    }
}

/// The header block of a raw message: everything before the first blank line.
pub fn header_block(raw_message: &[u8]) -> &[u8] {
    let lf = raw_message.windows(2).position(|w| w == b"\n\n");
    let crlf = raw_message.windows(4).position(|w| w == b"\r\n\r\n");
    let end = match (lf, crlf) {
        (Some(a), Some(b)) => (a + 1).min(b + 2),
        (Some(a), None) => a + 1,
        (None, Some(b)) => b + 2,
        (None, None) => raw_message.len(),
    };
    &raw_message[..end.min(raw_message.len())]
}

/// Decode and unfold a raw header block into `(lowercase_name, value)` pairs.
pub fn parse_header_block(raw_headers: &[u8]) -> Vec<(String, String)> {
    unfold_headers(&decode_header_bytes(raw_headers))
}

/// Decode raw header bytes to a string.
///
/// Tries UTF-8 first, then falls back to Windows-1252 (which accepts every byte).
fn decode_header_bytes(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);

    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            decoded.into_owned()
        }
    }
}

/// Unfold headers: join continuation lines (starting with space or tab) with the previous header.
pub fn unfold_headers(text: &str) -> Vec<(String, String)> {
    let mut result: Vec<(String, String)> = Vec::new();

    for line in text.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(last) = result.last_mut() {
                last.1.push(' ');
                last.1.push_str(line.trim());
            }
        } else if let Some(colon_pos) = line.find(':') {
            let name = line[..colon_pos].trim().to_lowercase();
            let value = line[colon_pos + 1..].trim().to_string();
            result.push((name, value));
        }
    }

    result
}

/// Get the first value for a header name (case-insensitive, pass lowercase).
pub fn get_header(headers: &[(String, String)], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.clone())
}

/// The raw, still-folded lines of every occurrence of `name`, in order.
///
/// Used to compare threading headers byte-for-byte between the original
/// and the rebuilt message.
pub fn raw_header_lines(raw_headers: &[u8], name: &str) -> Vec<Vec<u8>> {
    let mut result: Vec<Vec<u8>> = Vec::new();
    let mut current: Option<Vec<u8>> = None;

    for line in raw_headers.split_inclusive(|&b| b == b'\n') {
        let is_continuation = matches!(line.first(), Some(b' ') | Some(b'\t'));
        if is_continuation {
            if let Some(buf) = current.as_mut() {
                buf.extend_from_slice(line);
            }
            continue;
        }
        if let Some(done) = current.take() {
            result.push(done);
        }
        let matches_name = line
            .iter()
            .position(|&b| b == b':')
            .map(|pos| line[..pos].trim_ascii().eq_ignore_ascii_case(name.as_bytes()))
            .unwrap_or(false);
        if matches_name {
            current = Some(line.to_vec());
        }
    }
    if let Some(done) = current {
        result.push(done);
    }

    result
}

/// The main value of a structured header, lowercased (`"multipart/mixed"`).
pub fn main_value(value: &str) -> String {
    value
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

/// Extract a parameter (`boundary`, `name`, `filename`) from a structured header value.
///
/// Handles quoted values and the simple RFC 2231 form `name*=charset''value`.
pub fn header_param(value: &str, name: &str) -> Option<String> {
    let (_, rest) = value.split_once(';')?;

    for raw_param in split_params(rest) {
        let Some((key, val)) = raw_param.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let val = val.trim();

        if key == name {
            return Some(unquote(val));
        }
        if key == format!("{name}*") {
            let unquoted = unquote(val);
            let encoded = unquoted.splitn(3, '\'').nth(2).unwrap_or(&unquoted);
            return Some(percent_decode(encoded));
        }
    }
    None
}

/// Split `a=1; b="x;y"` on semicolons that are not inside quotes.
fn split_params(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, ch) in s.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ';' if !in_quotes => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        s[1..s.len() - 1].replace("\\\"", "\"")
    } else {
        s.to_string()
    }
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex_pair = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or("");
            if let Ok(b) = u8::from_str_radix(hex_pair, 16) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Extract content between `<` and `>` (for Message-ID, In-Reply-To).
pub fn extract_angle_bracket(s: &str) -> String {
    let trimmed = s.trim();
    if let Some(start) = trimmed.find('<') {
        if let Some(end) = trimmed[start..].find('>') {
            return trimmed[start..start + end + 1].to_string();
        }
    }
    trimmed.to_string()
}

/// Parse an email date string.
///
/// RFC 2822 and RFC 3339 first, a few common broken variants next, and
/// `mail-parser` as last resort.
pub fn parse_date(date_str: &str) -> Option<DateTime<Utc>> {
    let trimmed = date_str.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc2822(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }

    let formats = [
        "%d %b %Y %H:%M:%S %z",
        "%d %b %Y %H:%M:%S",
        "%Y-%m-%d %H:%M:%S %z",
        "%Y-%m-%d %H:%M:%S",
    ];
    let no_dow = trimmed
        .split_once(", ")
        .filter(|(dow, _)| dow.len() == 3)
        .map(|(_, rest)| rest)
        .unwrap_or(trimmed);
    for fmt in &formats {
        if let Ok(dt) = DateTime::parse_from_str(no_dow, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
        if let Ok(ndt) = NaiveDateTime::parse_from_str(no_dow, fmt) {
            return Some(Utc.from_utc_datetime(&ndt));
        }
    }

    if let Some(dt) = mail_parser_date(trimmed) {
        return Some(dt);
    }

    warn!(date = trimmed, "Could not parse date");
    None
}

/// Attempt to parse a date using `mail-parser`'s built-in parser.
fn mail_parser_date(input: &str) -> Option<DateTime<Utc>> {
    use mail_parser::MessageParser;

    let fake_msg = format!("Date: {input}\n\n");
    let parser = MessageParser::default();
    let parsed = parser.parse(fake_msg.as_bytes())?;
    let dt = parsed.date()?.to_rfc3339();
    DateTime::parse_from_rfc3339(&dt)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}
