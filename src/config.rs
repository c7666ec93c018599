//! Application configuration.
//!
//! Configuration is loaded from a TOML file at:
//! 1. `$MAILSTRIP_CONFIG` (environment variable)
//! 2. `~/.config/mailstrip/config.toml` (Linux/macOS)
//!    `%APPDATA%\mailstrip\config.toml` (Windows)
//! 3. Built-in defaults

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backup::layout::LayoutKind;
use crate::mailbox::retry::RetryPolicy;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General behavior settings.
    pub general: GeneralConfig,
    /// Mailbox location and folder names.
    pub mailbox: MailboxConfig,
    /// Where and how attachment backups are written.
    pub backup: BackupConfig,
    /// Stripping behavior.
    pub processing: ProcessingConfig,
    /// Retry schedule for transient mailbox errors.
    pub retry: RetryConfig,
    /// Global request rate against the mailbox.
    pub rate_limit: RateLimitConfig,
    /// Retention of journal history.
    pub safety: SafetyConfig,
}

/// General behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Override the data directory holding the journal, manifest and log.
    pub data_dir: Option<PathBuf>,
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub log_level: String,
}

/// Mailbox location and folder names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailboxConfig {
    /// Root of the directory-backed mailbox.
    pub root: Option<PathBuf>,
    /// Folder holding live messages.
    pub active_folder: String,
    /// Folder holding trashed messages.
    pub trash_folder: String,
}

/// Backup settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Backup root. Defaults to `<data_dir>/backups`.
    pub directory: Option<PathBuf>,
    /// Layout policy: "digest" or "message".
    pub layout: LayoutKind,
}

/// Stripping behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Simulate by default; `--execute` is required to touch the mailbox.
    pub dry_run: bool,
    /// Number of worker threads.
    pub workers: usize,
    /// Largest attachment accepted for backup, in bytes.
    pub max_attachment_size: u64,
    /// Referenced inline images up to this encoded size are kept.
    pub inline_max_size: u64,
    /// Keep CID-referenced images at all.
    pub preserve_inline_images: bool,
}

/// Retry schedule for transient mailbox errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

/// Global token bucket shared by all workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Sustained requests per second (0 disables limiting).
    pub requests_per_second: f64,
    /// Bucket capacity.
    pub burst: u32,
}

/// Journal retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Superseded journal history older than this is compacted.
    pub log_retention_days: u32,
}

// ── Default implementations ─────────────────────────────────────

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            log_level: "warn".to_string(),
        }
    }
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            root: None,
            active_folder: "All Mail".to_string(),
            trash_folder: "Trash".to_string(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            directory: None,
            layout: LayoutKind::Digest,
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            dry_run: true,
            workers: 4,
            max_attachment_size: 100 * 1024 * 1024, // 100 MB
            inline_max_size: 512 * 1024,            // 512 KB
            preserve_inline_images: true,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10.0,
            burst: 20,
        }
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            log_retention_days: 30,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            multiplier: self.multiplier,
        }
    }
}

// ── Load / save ─────────────────────────────────────────────────

/// Load configuration, searching standard locations.
///
/// Returns the default configuration if no file is found or on parse error.
pub fn load_config() -> Config {
    match config_file_path() {
        Some(path) if path.exists() => load_config_from(&path),
        _ => Config::default(),
    }
}

/// Load configuration from an explicit path, falling back to defaults.
pub fn load_config_from(path: &Path) -> Config {
    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str::<Config>(&contents) {
            Ok(cfg) => {
                tracing::info!(path = %path.display(), "Loaded config");
                cfg
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to parse config, using defaults"
                );
                Config::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Failed to read config file, using defaults"
            );
            Config::default()
        }
    }
}

/// Determine the config file path (checking env var first, then standard dirs).
pub fn config_file_path() -> Option<PathBuf> {
    // 1. Environment variable override
    if let Ok(env_path) = std::env::var("MAILSTRIP_CONFIG") {
        return Some(PathBuf::from(env_path));
    }

    // 2. Standard config directory
    dirs::config_dir().map(|d| d.join("mailstrip").join("config.toml"))
}

/// Return the data directory for the journal, manifest and logs.
pub fn data_dir(config: &Config) -> PathBuf {
    if let Some(ref dir) = config.general.data_dir {
        return dir.clone();
    }
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mailstrip")
}

/// Return the backup root.
pub fn backup_dir(config: &Config) -> PathBuf {
    config
        .backup
        .directory
        .clone()
        .unwrap_or_else(|| data_dir(config).join("backups"))
}

/// Return the directory-backed mailbox root.
pub fn mailbox_root(config: &Config) -> PathBuf {
    config
        .mailbox
        .root
        .clone()
        .unwrap_or_else(|| data_dir(config).join("mailbox"))
}

/// Return the transaction journal path.
pub fn journal_path(config: &Config) -> PathBuf {
    data_dir(config).join("journal.jsonl")
}

/// Return the manifest path.
pub fn manifest_path(config: &Config) -> PathBuf {
    data_dir(config).join("manifest.bin")
}

/// Return the log file path.
pub fn log_file_path(config: &Config) -> PathBuf {
    data_dir(config).join("mailstrip.log")
}
