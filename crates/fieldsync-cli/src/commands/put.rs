use fieldsync_core::LocalStore;

use crate::commands::common::{normalize_record_id, resolve_payload};
use crate::error::CliError;

pub async fn run_put(
    store: &LocalStore,
    item_type: &str,
    payload: Option<&str>,
    id: Option<&str>,
    priority: i64,
) -> Result<(), CliError> {
    let payload = resolve_payload(payload)?;
    let id = id.map(normalize_record_id).transpose()?;

    let id = store
        .put_with_priority(item_type.trim(), payload, id.as_ref(), priority)
        .await?;
    println!("{id}");
    Ok(())
}
