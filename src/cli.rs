// ABOUTME: Command-line surface for the rollbook binary, defined with clap derive.
// ABOUTME: Each subcommand maps onto one store, changelog, backup, or recovery operation.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use rollbook_core::Operation;
use rollbook_core::export::ExportFormat;

/// Top-level CLI parser for the `rollbook` binary.
#[derive(Debug, Parser)]
#[command(
    name = "rollbook",
    version,
    about = "Versioned student records with history, backups, and recovery"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Data directory (overrides ROLLBOOK_DATA_DIR)
    #[arg(short, long, global = true)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Clone, Debug, Subcommand)]
pub enum Commands {
    /// List stored students.
    List,
    /// Show one student record.
    Show { id: String },
    /// Show the change history of a student.
    History {
        id: String,
        /// Only entries of this kind: create, update, restore
        #[arg(long)]
        op: Option<Operation>,
        /// Only the most recent N entries
        #[arg(long)]
        limit: Option<usize>,
        /// Print whole entries including snapshots
        #[arg(long)]
        full: bool,
    },
    /// Restore a student to the state recorded by a history entry.
    Restore { id: String, index: usize },
    /// Back up a student's current record.
    Backup {
        id: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// List backups.
    Backups {
        #[arg(long)]
        entity: Option<String>,
    },
    /// Restore a student from a backup.
    RestoreBackup { backup_id: String },
    /// Delete a backup.
    DeleteBackup { backup_id: String },
    /// Check entity files, the changelog, and backups for problems.
    Check,
    /// Summarize the data directory.
    Status,
    /// Export every student to a file.
    Export {
        path: PathBuf,
        /// json, yaml, or csv
        #[arg(long, default_value = "json")]
        format: ExportFormat,
    },
    /// Export each student to its own file in a directory.
    ExportBatch {
        dir: PathBuf,
        #[arg(long, default_value = "json")]
        format: ExportFormat,
    },
}
