//! Message parsing: header decoding and the raw MIME tree.

pub mod header;
pub mod mime;
