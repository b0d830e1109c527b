//! FieldSync CLI - operator tool over the local store and sync engine

mod cli;
mod commands;
mod error;

use clap::Parser;

use crate::cli::{Cli, Commands};
use crate::commands::attach::run_attach;
use crate::commands::common::{build_engine, load_config, open_store};
use crate::commands::conflicts::{run_conflicts, run_resolve};
use crate::commands::delete::run_delete;
use crate::commands::get::run_get;
use crate::commands::list::run_list;
use crate::commands::put::run_put;
use crate::commands::stats::run_stats;
use crate::commands::sync::{run_quick_sync, run_sync, run_watch, sync_options};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("fieldsync=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref(), cli.db_path)?;
    let store = open_store(&config).await?;

    match cli.command {
        Commands::Put {
            item_type,
            payload,
            id,
            priority,
        } => {
            run_put(&store, &item_type, payload.as_deref(), id.as_deref(), priority).await?;
        }
        Commands::Get { id, deleted } => run_get(&store, &id, deleted).await?,
        Commands::List {
            item_type,
            status,
            limit,
            json,
        } => run_list(&store, &item_type, status.as_deref(), limit, json).await?,
        Commands::Delete { id } => run_delete(&store, &id).await?,
        Commands::Attach { id, file, mime } => run_attach(&store, &id, &file, &mime).await?,
        Commands::Sync {
            force,
            types,
            strategy,
            quick,
            watch,
        } => {
            let engine = build_engine(&config, store)?;
            if watch {
                run_watch(&engine, config.auto_sync_interval_secs).await?;
            } else if quick.is_empty() {
                run_sync(&engine, sync_options(force, &types, strategy)).await?;
            } else {
                run_quick_sync(&engine, &quick).await?;
            }
        }
        Commands::Stats { json } => run_stats(&store, json).await?,
        Commands::Conflicts { all, json } => run_conflicts(&store, all, json).await?,
        Commands::Resolve {
            conflict_id,
            choice,
            payload,
        } => {
            let engine = build_engine(&config, store)?;
            run_resolve(&engine, conflict_id, choice, payload.as_deref()).await?;
        }
    }

    Ok(())
}
