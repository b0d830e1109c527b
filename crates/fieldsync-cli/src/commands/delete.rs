use fieldsync_core::LocalStore;

use crate::commands::common::normalize_record_id;
use crate::error::CliError;

pub async fn run_delete(store: &LocalStore, id: &str) -> Result<(), CliError> {
    let id = normalize_record_id(id)?;
    if !store.delete(&id).await? {
        return Err(CliError::RecordNotFound(id.to_string()));
    }

    println!("{id}");
    Ok(())
}
