//! Database migrations

use crate::error::Result;
use libsql::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        apply(conn, 1, &V1_STATEMENTS).await?;
    }
    if version < 2 {
        apply(conn, 2, &V2_STATEMENTS).await?;
    }

    Ok(())
}

/// Get the current schema version
async fn get_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

/// Version 1: records, sync queue, conflicts, metadata
const V1_STATEMENTS: [&str; 12] = [
    "CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER PRIMARY KEY
    )",
    "CREATE TABLE IF NOT EXISTS records (
        id TEXT PRIMARY KEY,
        item_type TEXT NOT NULL,
        payload TEXT NOT NULL,
        version INTEGER NOT NULL,
        server_version INTEGER,
        checksum TEXT NOT NULL,
        sync_status TEXT NOT NULL DEFAULT 'LOCAL',
        is_deleted INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        last_synced_at INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_records_type_status ON records(item_type, sync_status)",
    "CREATE INDEX IF NOT EXISTS idx_records_updated ON records(updated_at DESC)",
    "CREATE TABLE IF NOT EXISTS sync_queue (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        item_id TEXT NOT NULL,
        operation TEXT NOT NULL,
        priority INTEGER NOT NULL DEFAULT 0,
        retry_count INTEGER NOT NULL DEFAULT 0,
        last_attempt INTEGER,
        error_message TEXT,
        created_at INTEGER NOT NULL,
        UNIQUE(item_id, operation)
    )",
    "CREATE INDEX IF NOT EXISTS idx_sync_queue_order ON sync_queue(priority DESC, created_at ASC)",
    "CREATE TABLE IF NOT EXISTS conflicts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        item_id TEXT NOT NULL,
        local_data TEXT NOT NULL,
        server_data TEXT,
        conflict_type TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        resolved INTEGER NOT NULL DEFAULT 0,
        resolution TEXT,
        resolution_data TEXT,
        resolved_at INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_conflicts_item ON conflicts(item_id)",
    "CREATE INDEX IF NOT EXISTS idx_conflicts_open ON conflicts(resolved, created_at)",
    "CREATE TABLE IF NOT EXISTS metadata (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_sync_queue_item ON sync_queue(item_id)",
    "INSERT INTO schema_version (version) VALUES (1)",
];

/// Version 2: attachment metadata
const V2_STATEMENTS: [&str; 4] = [
    "CREATE TABLE IF NOT EXISTS attachments (
        id TEXT PRIMARY KEY,
        item_id TEXT NOT NULL REFERENCES records(id) ON DELETE CASCADE,
        file_name TEXT NOT NULL,
        mime_type TEXT NOT NULL,
        size_bytes INTEGER NOT NULL,
        local_path TEXT NOT NULL,
        checksum TEXT NOT NULL,
        uploaded INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_attachments_item ON attachments(item_id)",
    "CREATE INDEX IF NOT EXISTS idx_attachments_pending ON attachments(uploaded)",
    "INSERT INTO schema_version (version) VALUES (2)",
];

/// Apply one migration inside a transaction
async fn apply(conn: &Connection, version: i32, statements: &[&str]) -> Result<()> {
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    tracing::info!("Migrated database to version {version} (latest {CURRENT_VERSION})");
    Ok(())
}
