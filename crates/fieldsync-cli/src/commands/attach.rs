use std::path::Path;

use fieldsync_core::LocalStore;

use crate::commands::common::normalize_record_id;
use crate::error::CliError;

pub async fn run_attach(
    store: &LocalStore,
    id: &str,
    file: &Path,
    mime_type: &str,
) -> Result<(), CliError> {
    let id = normalize_record_id(id)?;
    let attachment_id = store
        .store_attachment_from_path(&id, file, None, mime_type)
        .await?;

    println!("{attachment_id}");
    Ok(())
}
