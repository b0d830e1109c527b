use std::env;
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use fieldsync_core::sync::{HttpRemoteApi, TracingNotifier};
use fieldsync_core::{
    Conflict, EngineConfig, LocalStore, Record, RecordId, SyncEngine, SyncStatus,
};
use serde::Serialize;
use serde_json::Value;

use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct RecordListItem {
    pub id: String,
    pub item_type: String,
    pub status: SyncStatus,
    pub version: i64,
    pub server_version: Option<i64>,
    pub preview: String,
    pub payload: Value,
    pub updated_at: i64,
    pub relative_time: String,
}

#[derive(Debug, Serialize)]
pub struct ConflictItem {
    pub id: i64,
    pub item_id: String,
    pub conflict_type: String,
    pub server_version: Option<i64>,
    pub detected_at: i64,
    pub detected_at_iso: String,
    pub resolved: bool,
    pub resolution: Option<String>,
}

/// Engine config from `--config`, `FIELDSYNC_CONFIG`, or defaults, with
/// `FIELDSYNC_*` overrides and resolved local paths.
pub fn load_config(
    config_path: Option<&Path>,
    cli_db_path: Option<PathBuf>,
) -> Result<EngineConfig, CliError> {
    let config_path = config_path
        .map(Path::to_path_buf)
        .or_else(|| env::var_os("FIELDSYNC_CONFIG").map(PathBuf::from));
    let mut config = match config_path {
        Some(path) => EngineConfig::load(&path)?,
        None => EngineConfig::default(),
    };
    config.apply_env(|name| env::var(name).ok())?;

    if let Some(path) = cli_db_path {
        config.database_path = Some(path);
    }
    if config.database_path.is_none() {
        config.database_path = Some(default_db_path()?);
    }
    if config.attachments_dir.is_none() {
        config.attachments_dir = config
            .database_path
            .as_deref()
            .map(default_attachments_dir);
    }
    Ok(config)
}

pub fn default_db_path() -> Result<PathBuf, CliError> {
    dirs::data_dir()
        .map(|dir| dir.join("fieldsync").join("fieldsync.db"))
        .ok_or_else(|| CliError::Config("Failed to resolve CLI data directory".to_string()))
}

pub fn default_attachments_dir(db_path: &Path) -> PathBuf {
    db_path
        .parent()
        .map_or_else(|| PathBuf::from("attachments"), |dir| dir.join("attachments"))
}

pub async fn open_store(config: &EngineConfig) -> Result<LocalStore, CliError> {
    let db_path = config
        .database_path
        .clone()
        .ok_or_else(|| CliError::Config("database path is not set".to_string()))?;
    let attachments_dir = config
        .attachments_dir
        .clone()
        .unwrap_or_else(|| default_attachments_dir(&db_path));

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(LocalStore::open_path(db_path, attachments_dir).await?)
}

/// Sync engine over the HTTP API; the bearer token comes from
/// `FIELDSYNC_API_TOKEN`.
pub fn build_engine(config: &EngineConfig, store: LocalStore) -> Result<SyncEngine, CliError> {
    let Some(base_url) = config.api_base_url.as_deref() else {
        return Err(CliError::SyncNotConfigured);
    };
    if config.endpoints.is_empty() {
        return Err(CliError::SyncNotConfigured);
    }

    let sync_config = config.sync_config();
    let token = env::var("FIELDSYNC_API_TOKEN")
        .ok()
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty());
    let api = Arc::new(HttpRemoteApi::new(
        base_url,
        token,
        sync_config.request_timeout,
    )?);

    Ok(SyncEngine::new(
        store,
        sync_config,
        api.clone(),
        api,
        Arc::new(config.endpoints.clone()),
        Arc::new(TracingNotifier),
    ))
}

pub fn normalize_record_id(id: &str) -> Result<RecordId, CliError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        Err(CliError::EmptyRecordId)
    } else {
        Ok(RecordId::from(trimmed))
    }
}

/// Payload from the argument, or piped stdin when it is omitted.
pub fn resolve_payload(argument: Option<&str>) -> Result<Value, CliError> {
    if let Some(raw) = argument.and_then(normalize_content) {
        return parse_payload(&raw);
    }
    if let Some(raw) = read_piped_stdin()? {
        return parse_payload(&raw);
    }
    Err(CliError::EmptyPayload)
}

pub fn parse_payload(raw: &str) -> Result<Value, CliError> {
    serde_json::from_str(raw).map_err(|error| CliError::InvalidPayload(error.to_string()))
}

pub fn normalize_content(content: &str) -> Option<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn read_piped_stdin() -> Result<Option<String>, CliError> {
    let stdin = io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }

    let mut buffer = String::new();
    stdin.lock().read_to_string(&mut buffer)?;
    Ok(normalize_content(&buffer))
}

pub fn payload_preview(payload: &Value, max_chars: usize) -> String {
    let compact = payload.to_string();
    if compact.chars().count() <= max_chars {
        compact
    } else {
        let take_len = max_chars.saturating_sub(3);
        let mut truncated = compact.chars().take(take_len).collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

pub fn format_record_lines(records: &[Record]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    records
        .iter()
        .map(|record| {
            let preview = payload_preview(&record.payload, 40);
            let relative_time = format_relative_time(record.updated_at, now_ms);
            format!(
                "{:<40}  {:<8}  v{:<4}  {preview:<40}  {relative_time}",
                record.id.as_str(),
                record.sync_status.as_str(),
                record.version
            )
        })
        .collect()
}

pub fn record_to_list_item(record: &Record) -> RecordListItem {
    let now_ms = Utc::now().timestamp_millis();
    RecordListItem {
        id: record.id.to_string(),
        item_type: record.item_type.clone(),
        status: record.sync_status,
        version: record.version,
        server_version: record.server_version,
        preview: payload_preview(&record.payload, 80),
        payload: record.payload.clone(),
        updated_at: record.updated_at,
        relative_time: format_relative_time(record.updated_at, now_ms),
    }
}

pub fn conflict_to_item(conflict: &Conflict) -> ConflictItem {
    ConflictItem {
        id: conflict.id,
        item_id: conflict.item_id.to_string(),
        conflict_type: conflict.conflict_type.as_str().to_string(),
        server_version: conflict.server_version(),
        detected_at: conflict.timestamp,
        detected_at_iso: format_sync_timestamp(conflict.timestamp),
        resolved: conflict.resolved,
        resolution: conflict.resolution.clone(),
    }
}

pub fn format_conflict_lines(conflicts: &[Conflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            let server = conflict
                .server_version()
                .map_or_else(|| "deleted".to_string(), |version| format!("v{version}"));
            let state = conflict.resolution.as_deref().unwrap_or("OPEN");
            format!(
                "#{:<5}  {}  {:<6}  item={}  server={server}  {state}",
                conflict.id,
                format_sync_timestamp(conflict.timestamp),
                conflict.conflict_type.as_str(),
                conflict.item_id
            )
        })
        .collect()
}

pub fn format_sync_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else {
        format!("{}w ago", diff / week)
    }
}
