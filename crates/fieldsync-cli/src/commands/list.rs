use fieldsync_core::db::RecordQuery;
use fieldsync_core::{LocalStore, SyncStatus};

use crate::commands::common::{format_record_lines, record_to_list_item, RecordListItem};
use crate::error::CliError;

pub async fn run_list(
    store: &LocalStore,
    item_type: &str,
    status: Option<&str>,
    limit: usize,
    as_json: bool,
) -> Result<(), CliError> {
    let sync_status = status.map(str::parse::<SyncStatus>).transpose()?;
    let query = RecordQuery {
        sync_status,
        limit,
        ..RecordQuery::default()
    };
    let records = store.query(item_type.trim(), &query).await?;

    if as_json {
        let json_items = records
            .iter()
            .map(record_to_list_item)
            .collect::<Vec<RecordListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
    } else if records.is_empty() {
        println!("No '{item_type}' records.");
    } else {
        for line in format_record_lines(&records) {
            println!("{line}");
        }
    }

    Ok(())
}
