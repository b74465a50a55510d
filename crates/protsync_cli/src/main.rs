//! Batch driver for registry synchronization.
//!
//! # Responsibility
//! - Load `SyncConfig`, open the record store and snapshot collaborators.
//! - Run updates or retirements and write the audit trail as JSON lines.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use protsync_core::db::migrations::latest_version;
use protsync_core::service::write_json_lines;
use protsync_core::{
    core_version, init_logging, open_db, SnapshotArchive, SnapshotRegistry, SqliteRecordRepository,
    SyncConfig, UpdateService,
};
use serde_json::json;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "protsync", version, about = "Synchronize curated protein records with a registry")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "protsync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Update records for the given accessions, or every tracked accession.
    Update {
        accessions: Vec<String>,
    },
    /// Retire one record as if its accession had been withdrawn.
    Retire {
        record_id: Uuid,
    },
    /// Print core and schema versions.
    Schema,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Schema => {
            println!(
                "{}",
                json!({ "core_version": core_version(), "schema_version": latest_version() })
            );
            Ok(())
        }
        Command::Update { accessions } => run_update(&cli.config, accessions),
        Command::Retire { record_id } => run_retire(&cli.config, record_id),
    }
}

fn load_config(path: &Path) -> Result<SyncConfig> {
    let config = SyncConfig::load(path)
        .with_context(|| format!("loading config from {}", path.display()))?;
    init_logging(&config.logging.level, config.logging.dir.as_deref())
        .context("initializing logging")?;
    Ok(config)
}

fn run_update(config_path: &Path, accessions: Vec<String>) -> Result<()> {
    let config = load_config(config_path)?;
    let conn = open_db(&config.database_path)
        .with_context(|| format!("opening database {}", config.database_path.display()))?;
    let repo = SqliteRecordRepository::try_new(&conn).context("preparing record repository")?;
    let registry = SnapshotRegistry::load(&config.registry_snapshot).with_context(|| {
        format!(
            "loading registry snapshot {}",
            config.registry_snapshot.display()
        )
    })?;
    let archive = match &config.archive_snapshot {
        Some(path) => SnapshotArchive::load(path)
            .with_context(|| format!("loading archive snapshot {}", path.display()))?,
        None => SnapshotArchive::new(),
    };

    let service = UpdateService::new(&repo, &registry, &archive, &config.engine);
    let accessions = if accessions.is_empty() {
        service
            .tracked_accessions()
            .context("listing tracked accessions")?
    } else {
        accessions
    };
    info!(
        "event=update_run module=cli status=start accessions={} registry_entries={}",
        accessions.len(),
        registry.len()
    );

    let report = service.run_batch(&accessions);
    let mut writer = open_report(config.report_path.as_deref())?;
    write_json_lines(&mut writer, &report.outcomes).context("writing report")?;

    let summary = report.summary();
    eprintln!(
        "processed={} updated={} unchanged={} dead={} skipped={} failed={}",
        summary.processed,
        summary.updated,
        summary.unchanged,
        summary.dead,
        summary.skipped,
        summary.failed
    );
    Ok(())
}

fn run_retire(config_path: &Path, record_id: Uuid) -> Result<()> {
    let config = load_config(config_path)?;
    let conn = open_db(&config.database_path)
        .with_context(|| format!("opening database {}", config.database_path.display()))?;
    let repo = SqliteRecordRepository::try_new(&conn).context("preparing record repository")?;
    let registry = SnapshotRegistry::default();
    let archive = SnapshotArchive::new();

    let service = UpdateService::new(&repo, &registry, &archive, &config.engine);
    let retirement = service
        .retire_record(record_id)
        .with_context(|| format!("retiring record {record_id}"))?;

    let mut writer = open_report(config.report_path.as_deref())?;
    write_json_lines(&mut writer, &[retirement]).context("writing report")?;
    Ok(())
}

fn open_report(path: Option<&Path>) -> Result<Box<dyn Write>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("creating report file {}", path.display()))?;
            Ok(Box::new(BufWriter::new(file)))
        }
        None => Ok(Box::new(BufWriter::new(io::stdout().lock()))),
    }
}
