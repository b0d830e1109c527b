use fieldsync_core::LocalStore;

use crate::commands::common::{normalize_record_id, record_to_list_item};
use crate::error::CliError;

pub async fn run_get(store: &LocalStore, id: &str, include_deleted: bool) -> Result<(), CliError> {
    let id = normalize_record_id(id)?;
    let record = if include_deleted {
        store.get_including_deleted(&id).await?
    } else {
        store.get(&id).await?
    };
    let Some(record) = record else {
        return Err(CliError::RecordNotFound(id.to_string()));
    };

    println!("{}", serde_json::to_string_pretty(&record_to_list_item(&record))?);
    Ok(())
}
