//! CLI entry point for `mailstrip`.

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use clap::{CommandFactory, Parser, Subcommand};
use humansize::{format_size, BINARY};
use indicatif::{ProgressBar, ProgressStyle};

use mailstrip::backup::DirBackupStore;
use mailstrip::config::{self, Config};
use mailstrip::engine::{Engine, EngineSettings, ProcessResult, RevertStatus, RevertTarget};
use mailstrip::error::StripError;
use mailstrip::export::ExportFormat;
use mailstrip::journal::FileJournal;
use mailstrip::mailbox::rate_limit::RateLimiter;
use mailstrip::mailbox::{DirMailbox, MailboxGateway};
use mailstrip::manifest::FileManifest;
use mailstrip::model::manifest::ManifestStatus;
use mailstrip::model::message::SearchCriteria;

#[derive(Parser)]
#[command(
    name = "mailstrip",
    version,
    about = "Strip large attachments from mailbox messages, keeping verified backups"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (overrides $MAILSTRIP_CONFIG)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// List candidate messages in the active folder
    Scan {
        /// Only messages at least this many bytes
        #[arg(long, value_name = "BYTES")]
        min_size: Option<u64>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Strip attachments from candidate messages
    Process {
        /// Simulate without touching the mailbox or backups
        #[arg(long, conflicts_with = "execute")]
        dry_run: bool,
        /// Really modify the mailbox
        #[arg(long)]
        execute: bool,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long, value_name = "BYTES")]
        min_size: Option<u64>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Restore originals from trash
    Revert {
        #[arg(
            value_name = "MESSAGE-ID",
            required_unless_present = "all",
            conflicts_with = "all"
        )]
        message_id: Option<String>,
        /// Revert every committed message
        #[arg(long)]
        all: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Show manifest counts by status
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Finish or roll back interrupted transactions
    Recover,
    /// Export the manifest
    ExportManifest {
        #[arg(short, long, default_value = "csv")]
        format: String,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Drop superseded journal history
    Compact {
        #[arg(long, value_name = "DAYS")]
        retention_days: Option<u32>,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate a man page
    Manpage,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => config::load_config_from(path),
        None => config::load_config(),
    };

    let log_level = match cli.verbose {
        0 => config.general.log_level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    setup_logging(log_level, &config);

    match cli.command {
        Commands::Scan {
            min_size,
            limit,
            json,
        } => cmd_scan(&config, min_size, limit, json),
        Commands::Process {
            dry_run,
            execute,
            workers,
            min_size,
            limit,
        } => {
            let dry_run = if execute {
                false
            } else {
                dry_run || config.processing.dry_run
            };
            cmd_process(&config, dry_run, workers, min_size, limit)
        }
        Commands::Revert {
            message_id,
            all,
            dry_run,
        } => {
            let target = match (message_id, all) {
                (_, true) => RevertTarget::All,
                (Some(id), false) => RevertTarget::One(id),
                (None, false) => anyhow::bail!("Give a Message-ID or --all"),
            };
            cmd_revert(&config, &target, dry_run)
        }
        Commands::Status { json } => cmd_status(&config, json),
        Commands::Recover => cmd_recover(&config),
        Commands::ExportManifest { format, output } => cmd_export(&config, &format, &output),
        Commands::Compact { retention_days } => cmd_compact(
            &config,
            retention_days.unwrap_or(config.safety.log_retention_days),
        ),
        Commands::Completions { shell } => cmd_completions(shell),
        Commands::Manpage => cmd_manpage(),
    }
}

/// Set up tracing with stderr output and optional file logging.
fn setup_logging(level: &str, config: &Config) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let log_path = config::log_file_path(config);
    let log_dir = log_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config::data_dir(config));
    let log_name = log_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "mailstrip.log".into());

    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_appender = tracing_appender::rolling::never(&log_dir, log_name);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
    }
}

/// Wire the directory-backed collaborators into an engine.
fn open_engine(config: &Config, workers: Option<usize>) -> anyhow::Result<Engine> {
    let mailbox = DirMailbox::open(config::mailbox_root(config), &config.mailbox.trash_folder)?;
    let limiter = RateLimiter::new(
        config.rate_limit.requests_per_second,
        config.rate_limit.burst,
    );
    let gateway = MailboxGateway::new(
        Arc::new(mailbox),
        config.retry.policy(),
        Arc::new(limiter),
    );
    let backups = DirBackupStore::open(config::backup_dir(config))?;
    let journal = FileJournal::open(config::journal_path(config))?;
    let (manifest, rebuild) = open_manifest(&config::manifest_path(config))?;

    let mut settings = EngineSettings::from_config(config);
    if let Some(n) = workers {
        settings.workers = n.max(1);
    }

    let engine = Engine::new(
        gateway,
        Arc::new(backups),
        Arc::new(journal),
        Arc::new(manifest),
        settings,
    )?;
    if rebuild {
        let count = engine.rebuild_manifest()?;
        eprintln!("  Manifest rebuilt from journal ({count} entries)");
    }
    Ok(engine)
}

/// Open the manifest, moving an unreadable one aside so it can be rebuilt.
fn open_manifest(path: &Path) -> anyhow::Result<(FileManifest, bool)> {
    match FileManifest::open(path) {
        Ok(manifest) => Ok((manifest, false)),
        Err(StripError::InvalidManifest { reason, .. }) => {
            let aside = path.with_extension("bin.corrupt");
            tracing::warn!(
                path = %path.display(),
                aside = %aside.display(),
                reason = %reason,
                "Manifest unreadable, rebuilding from journal"
            );
            std::fs::rename(path, &aside).map_err(|e| StripError::io(path, e))?;
            Ok((FileManifest::open(path)?, true))
        }
        Err(e) => Err(e.into()),
    }
}

fn criteria(min_size: Option<u64>, limit: Option<usize>) -> SearchCriteria {
    SearchCriteria {
        min_size,
        limit,
        ..SearchCriteria::default()
    }
}

/// List candidate messages.
fn cmd_scan(
    config: &Config,
    min_size: Option<u64>,
    limit: Option<usize>,
    json: bool,
) -> anyhow::Result<()> {
    let engine = open_engine(config, None)?;
    let mut refs = Vec::new();
    for msg in engine.scan(&criteria(min_size, limit))? {
        refs.push(msg?);
    }

    if json {
        let items: Vec<serde_json::Value> = refs
            .iter()
            .map(|r| {
                serde_json::json!({
                    "mailbox_id": r.mailbox_id,
                    "message_id": r.message_id,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    println!();
    for r in &refs {
        println!("  {:<40} {}", r.mailbox_id, r.message_id);
    }
    println!();
    println!("  {} candidate message(s)", refs.len());
    Ok(())
}

/// Strip attachments, reporting progress per message.
fn cmd_process(
    config: &Config,
    dry_run: bool,
    workers: Option<usize>,
    min_size: Option<u64>,
    limit: Option<usize>,
) -> anyhow::Result<()> {
    let engine = open_engine(config, workers)?;

    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template(if dry_run {
        "{spinner:.green} Simulating {pos} message(s) {msg}"
    } else {
        "{spinner:.green} Processing {pos} message(s) {msg}"
    })?);

    let start = Instant::now();
    let results = engine.process_with_progress(&criteria(min_size, limit), dry_run, &|r| {
        pb.inc(1);
        pb.set_message(r.entry.message_id().to_string());
    })?;
    pb.finish_and_clear();

    print_process_summary(&results, dry_run, start.elapsed().as_secs_f64());
    Ok(())
}

fn print_process_summary(results: &[ProcessResult], dry_run: bool, secs: f64) {
    let mut counts = std::collections::BTreeMap::new();
    let mut freed = 0u64;
    let mut skipped = 0usize;
    for r in results {
        if r.skipped {
            skipped += 1;
            continue;
        }
        *counts.entry(r.entry.status).or_insert(0usize) += 1;
        if r.entry.status == ManifestStatus::Committed {
            freed += r.entry.stripped_bytes();
        }
        if let Some(ref err) = r.entry.error {
            println!("  {:<40} {}", r.entry.message_id(), err);
        }
    }

    println!();
    println!("  {:<20} {}", "Messages:", results.len());
    for (status, n) in &counts {
        println!("  {:<20} {}", format!("{status}:"), n);
    }
    if skipped > 0 {
        println!("  {:<20} {}", "Already handled:", skipped);
    }
    let label = if dry_run { "Would free:" } else { "Freed:" };
    println!("  {:<20} {}", label, format_size(freed, BINARY));
    println!("  {:<20} {:.2}s", "Time:", secs);
    if dry_run {
        println!();
        println!("  Dry run: nothing was changed. Use --execute to strip.");
    }
    println!();
}

/// Restore originals from trash.
fn cmd_revert(config: &Config, target: &RevertTarget, dry_run: bool) -> anyhow::Result<()> {
    let engine = open_engine(config, None)?;
    let outcomes = engine.revert(target, dry_run)?;

    println!();
    for o in &outcomes {
        let status = match o.status {
            RevertStatus::Reverted => "reverted".to_string(),
            RevertStatus::WouldRevert => "would revert".to_string(),
            RevertStatus::NotRevertible => "not revertible (original gone from trash)".to_string(),
            RevertStatus::Failed(ref e) => format!("failed: {e}"),
        };
        println!("  {:<40} {}", o.message_id, status);
    }
    if outcomes.is_empty() {
        println!("  Nothing to revert");
    }
    println!();
    Ok(())
}

/// Show manifest counts by status.
fn cmd_status(config: &Config, json: bool) -> anyhow::Result<()> {
    let engine = open_engine(config, None)?;
    let counts = engine.status()?;
    let freed: u64 = engine
        .manifest_entries()?
        .iter()
        .filter(|e| e.status == ManifestStatus::Committed)
        .map(|e| e.stripped_bytes())
        .sum();

    if json {
        let mut statuses = serde_json::Map::new();
        for status in ManifestStatus::ALL {
            let n = counts.get(&status).copied().unwrap_or(0);
            statuses.insert(status.as_str().to_string(), serde_json::json!(n));
        }
        let out = serde_json::json!({
            "statuses": statuses,
            "bytes_freed": freed,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    for status in ManifestStatus::ALL {
        let n = counts.get(&status).copied().unwrap_or(0);
        println!("  {:<20} {}", format!("{status}:"), n);
    }
    println!("  {:<20} {}", "Freed:", format_size(freed, BINARY));
    println!();
    Ok(())
}

/// Finish or roll back interrupted transactions.
fn cmd_recover(config: &Config) -> anyhow::Result<()> {
    let engine = open_engine(config, None)?;
    let report = engine.recover()?;

    println!();
    if report.is_clean() {
        println!("  Nothing to recover");
    } else {
        println!("  {:<20} {}", "Examined:", report.examined);
        println!("  {:<20} {}", "Committed:", report.committed);
        println!("  {:<20} {}", "Rolled back:", report.rolled_back);
        println!("  {:<20} {}", "Abandoned:", report.abandoned);
        println!("  {:<20} {}", "Reverted:", report.reverted);
        println!("  {:<20} {}", "Still pending:", report.pending);
        println!("  {:<20} {}", "Manifest repaired:", report.manifest_repaired);
    }
    println!();
    Ok(())
}

/// Export the manifest as CSV or JSON.
fn cmd_export(config: &Config, format: &str, output: &Path) -> anyhow::Result<()> {
    let format: ExportFormat = format.parse()?;
    let engine = open_engine(config, None)?;

    let file = std::fs::File::create(output).map_err(|e| StripError::io(output, e))?;
    let mut writer = BufWriter::new(file);
    let count = engine.export_manifest(format, &mut writer)?;
    writer.flush().map_err(|e| StripError::io(output, e))?;

    println!(
        "  Exported {} entr{} as {} to {}",
        count,
        if count == 1 { "y" } else { "ies" },
        format,
        output.display()
    );
    Ok(())
}

/// Drop superseded journal history.
fn cmd_compact(config: &Config, retention_days: u32) -> anyhow::Result<()> {
    let engine = open_engine(config, None)?;
    let removed = engine.compact(retention_days)?;
    println!("  Removed {removed} journal entr{}", if removed == 1 { "y" } else { "ies" });
    Ok(())
}

/// Generate shell completions and print to stdout.
fn cmd_completions(shell: clap_complete::Shell) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "mailstrip", &mut std::io::stdout());
    Ok(())
}

/// Generate a man page and print to stdout.
fn cmd_manpage() -> anyhow::Result<()> {
    let cmd = Cli::command();
    let man = clap_mangen::Man::new(cmd);
    let mut buf = Vec::new();
    man.render(&mut buf)?;
    std::io::Write::write_all(&mut std::io::stdout(), &buf)?;
    Ok(())
}
