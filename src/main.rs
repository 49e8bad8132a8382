// ABOUTME: Entry point for the rollbook binary.
// ABOUTME: Parses CLI arguments, initializes tracing, opens the data directory, and prints JSON results.

mod cli;

use anyhow::{Context, bail};
use clap::Parser;
use rollbook_store::{RollbookConfig, StorageManager};
use serde::Serialize;
use serde_json::json;

use crate::cli::{Cli, Commands};

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("rollbook=info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = RollbookConfig::from_env()?;
    if let Some(dir) = cli.data_dir {
        config = config.with_data_dir(dir);
    }
    let manager = StorageManager::open(&config)
        .with_context(|| format!("opening data directory {}", config.data_dir.display()))?;

    run(&manager, cli.command)
}

fn run(manager: &StorageManager, command: Commands) -> anyhow::Result<()> {
    let store = manager.store();
    match command {
        Commands::List => {
            let summaries: Vec<_> = store
                .list()?
                .into_iter()
                .map(|e| {
                    json!({
                        "id": e.id,
                        "name": e.name,
                        "class": e.class_name,
                        "grades": e.grades.len(),
                        "last_updated": e.last_updated,
                    })
                })
                .collect();
            print_json(&summaries)
        }
        Commands::Show { id } => {
            let Some(loaded) = store.load(&id)? else {
                bail!("student not found: {}", id);
            };
            if loaded.is_partial() {
                tracing::warn!(
                    "{} sub-records of {} could not be read and are not shown",
                    loaded.skipped.total(),
                    id
                );
            }
            print_json(&loaded.entity)
        }
        Commands::History {
            id,
            op,
            limit,
            full,
        } => {
            let entries = store.changelog().indexed_history(&id, op, limit);
            if full {
                let rows: Vec<_> = entries
                    .into_iter()
                    .map(|(index, entry)| json!({ "index": index, "entry": entry }))
                    .collect();
                return print_json(&rows);
            }
            let rows: Vec<_> = entries
                .into_iter()
                .map(|(index, entry)| {
                    json!({
                        "index": index,
                        "timestamp": entry.timestamp,
                        "operation": entry.operation,
                        "changes": entry.diffs.iter().map(|d| d.describe()).collect::<Vec<_>>(),
                    })
                })
                .collect();
            print_json(&rows)
        }
        Commands::Restore { id, index } => {
            let restored = manager.recovery().restore_from_changelog(&id, index)?;
            if !restored.changelog_persisted {
                tracing::warn!("restore of {} is not in the changelog file yet", id);
            }
            print_json(&restored)
        }
        Commands::Backup { id, description } => {
            let Some(loaded) = store.load(&id)? else {
                bail!("student not found: {}", id);
            };
            let record = manager
                .backups()
                .create(&id, &loaded.entity, description.as_deref())?;
            print_json(&record)
        }
        Commands::Backups { entity } => print_json(&manager.backups().list(entity.as_deref())),
        Commands::RestoreBackup { backup_id } => {
            let restored = manager.recovery().restore_from_backup(&backup_id)?;
            print_json(&restored)
        }
        Commands::DeleteBackup { backup_id } => {
            manager.backups().delete(&backup_id)?;
            print_json(&json!({ "deleted": backup_id }))
        }
        Commands::Check => {
            let report = manager.recovery().check_consistency()?;
            print_json(&report)?;
            if !report.ok {
                bail!("consistency check found {} issues", report.issues.len());
            }
            Ok(())
        }
        Commands::Status => print_json(&manager.status()?),
        Commands::Export { path, format } => {
            let count = manager.export(&path, format)?;
            print_json(&json!({
                "path": path,
                "format": format.to_string(),
                "entities": count,
            }))
        }
        Commands::ExportBatch { dir, format } => {
            let count = manager.export_batch(&dir, format)?;
            print_json(&json!({
                "dir": dir,
                "format": format.to_string(),
                "entities": count,
            }))
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
