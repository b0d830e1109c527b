use fieldsync_core::models::DequeueFilter;
use fieldsync_core::LocalStore;
use serde::Serialize;

use crate::commands::common::format_sync_timestamp;
use crate::error::CliError;

#[derive(Debug, Serialize)]
struct StatsReport {
    #[serde(flatten)]
    storage: fieldsync_core::StorageStats,
    pending_uploads: u64,
    open_conflicts: u64,
}

pub async fn run_stats(store: &LocalStore, as_json: bool) -> Result<(), CliError> {
    let report = StatsReport {
        storage: store.storage_stats().await?,
        pending_uploads: store.pending_count(&DequeueFilter::default()).await?,
        open_conflicts: store.open_conflict_count().await?,
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let storage = &report.storage;
    println!("Records:          {}", storage.total_items);
    println!("  local:          {}", storage.local_items);
    println!("  synced:         {}", storage.synced_items);
    println!("  error:          {}", storage.error_items);
    println!("  conflict:       {}", storage.conflict_items);
    println!("Pending uploads:  {}", report.pending_uploads);
    println!("Open conflicts:   {}", report.open_conflicts);
    println!("Storage size:     {} bytes", storage.storage_size);
    println!(
        "Last sync:        {}",
        storage
            .last_sync
            .map_or_else(|| "never".to_string(), format_sync_timestamp)
    );
    Ok(())
}
