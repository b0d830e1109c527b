use fieldsync_core::{LocalStore, Resolution, SyncEngine};

use crate::cli::ResolveChoice;
use crate::commands::common::{
    conflict_to_item, format_conflict_lines, parse_payload, ConflictItem,
};
use crate::error::CliError;

const CONFLICT_LIST_LIMIT: usize = 200;

pub async fn run_conflicts(
    store: &LocalStore,
    include_resolved: bool,
    as_json: bool,
) -> Result<(), CliError> {
    let conflicts = store
        .list_conflicts(include_resolved, CONFLICT_LIST_LIMIT)
        .await?;

    if as_json {
        let json_items = conflicts
            .iter()
            .map(conflict_to_item)
            .collect::<Vec<ConflictItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No sync conflicts.");
        return Ok(());
    }

    for line in format_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

pub fn resolution_for(choice: ResolveChoice, payload: Option<&str>) -> Result<Resolution, CliError> {
    Ok(match choice {
        ResolveChoice::Local => Resolution::UseLocal,
        ResolveChoice::Server => Resolution::UseServer,
        ResolveChoice::Skip => Resolution::Skip,
        ResolveChoice::Merge => {
            let Some(raw) = payload else {
                return Err(CliError::EmptyPayload);
            };
            Resolution::Merge(parse_payload(raw)?)
        }
    })
}

pub async fn run_resolve(
    engine: &SyncEngine,
    conflict_id: i64,
    choice: ResolveChoice,
    payload: Option<&str>,
) -> Result<(), CliError> {
    let resolution = resolution_for(choice, payload)?;
    let outcome = engine.resolve_conflict(conflict_id, resolution).await?;
    println!("Conflict {conflict_id}: {outcome:?}");
    Ok(())
}
