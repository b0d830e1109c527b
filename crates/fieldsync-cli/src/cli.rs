use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use fieldsync_core::ConflictStrategy;

#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(about = "Offline-first record store and sync engine")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Engine config file (JSON)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create or update a record
    Put {
        /// Record type, e.g. visit
        item_type: String,
        /// JSON payload (read from stdin when omitted)
        payload: Option<String>,
        /// Update this record instead of creating one
        #[arg(long)]
        id: Option<String>,
        /// Queue priority (higher uploads first)
        #[arg(long, default_value = "0")]
        priority: i64,
    },
    /// Show one record
    Get {
        /// Record ID
        id: String,
        /// Include tombstoned records
        #[arg(long)]
        deleted: bool,
    },
    /// List records of a type
    List {
        /// Record type
        item_type: String,
        /// Only records in this sync state (local, synced, error, conflict)
        #[arg(long)]
        status: Option<String>,
        /// Number of records to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a record
    Delete {
        /// Record ID
        id: String,
    },
    /// Attach a file to a record
    Attach {
        /// Record ID
        id: String,
        /// File to attach
        file: PathBuf,
        /// MIME type of the file
        #[arg(long, default_value = "application/octet-stream")]
        mime: String,
    },
    /// Synchronize with the server
    Sync {
        /// Re-upload records that are already synced
        #[arg(long)]
        force: bool,
        /// Only these record types
        #[arg(long = "type", value_name = "TYPE")]
        types: Vec<String>,
        /// Conflict strategy for this run
        #[arg(long, value_parser = parse_strategy)]
        strategy: Option<ConflictStrategy>,
        /// Upload only these records, without a full run
        #[arg(long, value_name = "ID", num_args = 1..)]
        quick: Vec<String>,
        /// Keep syncing on the configured interval until interrupted
        #[arg(long, conflicts_with = "quick")]
        watch: bool,
    },
    /// Show storage and queue statistics
    Stats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List sync conflicts
    Conflicts {
        /// Include resolved conflicts
        #[arg(long)]
        all: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resolve one open conflict
    Resolve {
        /// Conflict ID
        conflict_id: i64,
        /// Which side to keep
        #[arg(value_enum)]
        choice: ResolveChoice,
        /// Merged JSON payload (required for `merge`)
        #[arg(long, value_name = "JSON")]
        payload: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum ResolveChoice {
    Local,
    Server,
    Merge,
    Skip,
}

fn parse_strategy(value: &str) -> Result<ConflictStrategy, String> {
    value.parse().map_err(|error: fieldsync_core::Error| error.to_string())
}
