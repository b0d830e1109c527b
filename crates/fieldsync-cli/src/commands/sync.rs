use std::time::Duration;

use fieldsync_core::{ConflictStrategy, SyncEngine, SyncOptions, SyncResult};

use crate::commands::common::normalize_record_id;
use crate::error::CliError;

const CONNECTIVITY_POLL: Duration = Duration::from_secs(15);
const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(300);

pub fn sync_options(
    force: bool,
    types: &[String],
    strategy: Option<ConflictStrategy>,
) -> SyncOptions {
    let mut options = SyncOptions::default().with_types(types.iter().map(|t| t.trim()));
    options.force_sync = force;
    options.conflict_resolution = strategy;
    options
}

pub async fn run_sync(engine: &SyncEngine, options: SyncOptions) -> Result<(), CliError> {
    let _progress = engine.subscribe_progress(|progress| {
        tracing::debug!("{:>3}% {}", progress.percent, progress.message);
    });
    let result = engine.run_full_sync(options).await?;
    print_result(&result);
    Ok(())
}

pub async fn run_quick_sync(engine: &SyncEngine, ids: &[String]) -> Result<(), CliError> {
    let ids = ids
        .iter()
        .map(|id| normalize_record_id(id))
        .collect::<Result<Vec<_>, _>>()?;
    let result = engine.run_quick_sync(&ids).await?;
    print_result(&result);
    Ok(())
}

/// Auto-sync until Ctrl-C.
pub async fn run_watch(engine: &SyncEngine, interval_secs: Option<u64>) -> Result<(), CliError> {
    let interval = interval_secs
        .filter(|secs| *secs > 0)
        .map_or(DEFAULT_WATCH_INTERVAL, Duration::from_secs);
    println!("Syncing every {}s; press Ctrl-C to stop", interval.as_secs());

    let handle = engine.spawn_auto_sync(interval, CONNECTIVITY_POLL);
    tokio::signal::ctrl_c().await?;
    engine.cancel_sync();
    handle.stop().await;
    println!("Stopped");
    Ok(())
}

fn print_result(result: &SyncResult) {
    println!("{}", result.summary());
    if result.pending_conflicts > 0 {
        println!(
            "{} conflict(s) waiting; see `fieldsync conflicts`",
            result.pending_conflicts
        );
    }
    for error in &result.errors {
        println!("  {error}");
    }
}
