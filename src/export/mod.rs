//! Manifest export: CSV and JSON.

pub mod csv;
pub mod json;

use std::fmt;
use std::io::Write;
use std::str::FromStr;

use crate::error::{Result, StripError};
use crate::model::manifest::ManifestEntry;

/// Supported export formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Json,
}

impl FromStr for ExportFormat {
    type Err = StripError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "json" => Ok(Self::Json),
            other => Err(StripError::Export(format!("unknown export format '{other}'"))),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Csv => "csv",
            Self::Json => "json",
        })
    }
}

/// Write `entries` to `out` in `format`.
pub fn write_manifest(entries: &[ManifestEntry], format: ExportFormat, out: &mut dyn Write) -> Result<()> {
    match format {
        ExportFormat::Csv => csv::write_csv(entries, out),
        ExportFormat::Json => json::write_json(entries, out),
    }
}

fn export_error(e: impl fmt::Display) -> StripError {
    StripError::Export(e.to_string())
}
