//! Export the manifest to JSON.

use std::io::Write;

use crate::error::Result;
use crate::model::manifest::ManifestEntry;

use super::export_error;

/// Pretty-printed JSON array of manifest entries.
pub fn write_json(entries: &[ManifestEntry], out: &mut dyn Write) -> Result<()> {
    serde_json::to_writer_pretty(&mut *out, entries).map_err(export_error)?;
    writeln!(out).map_err(export_error)?;
    out.flush().map_err(export_error)
}
