//! Conflict repository

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use libsql::{params, Connection};
use serde_json::Value;

use super::values::opt_text;
use crate::error::Result;
use crate::models::{Conflict, ConflictType, RecordId, RemoteRecord};
use crate::util::now_millis;

const CONFLICT_COLUMNS: &str = "id, item_id, local_data, server_data, conflict_type, created_at, \
     resolved, resolution, resolution_data";

/// Trait for conflict storage (async)
#[allow(async_fn_in_trait)]
pub trait ConflictRepository {
    /// Record a new open conflict and return its id.
    async fn insert(
        &self,
        item_id: &RecordId,
        local_data: &Value,
        server_data: Option<&RemoteRecord>,
        conflict_type: ConflictType,
    ) -> Result<i64>;

    /// Fetch a conflict by id.
    async fn get(&self, conflict_id: i64) -> Result<Option<Conflict>>;

    /// The unresolved conflict for an item, if any.
    async fn open_for_item(&self, item_id: &RecordId) -> Result<Option<Conflict>>;

    /// Conflicts, newest first.
    async fn list(&self, include_resolved: bool, limit: usize) -> Result<Vec<Conflict>>;

    /// Number of unresolved conflicts.
    async fn open_count(&self) -> Result<u64>;

    /// Replace the local side of an open conflict after a new local write.
    async fn update_local_data(&self, conflict_id: i64, local_data: &Value) -> Result<()>;

    /// Replace the server side of an open conflict with a fresher copy.
    async fn update_server_data(
        &self,
        conflict_id: i64,
        server_data: Option<&RemoteRecord>,
    ) -> Result<()>;

    /// Close a conflict with the applied resolution.
    async fn mark_resolved(
        &self,
        conflict_id: i64,
        resolution: &str,
        resolution_data: Option<&Value>,
    ) -> Result<()>;
}

/// libSQL-backed store of detected conflicts
pub struct LibSqlConflictRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlConflictRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_conflict(row: &libsql::Row) -> Result<Conflict> {
        let item_id: String = row.get(1)?;
        let local_data: String = row.get(2)?;
        let server_data: Option<String> = row.get(3)?;
        let conflict_type: String = row.get(4)?;
        let resolution_data: Option<String> = row.get(8)?;

        Ok(Conflict {
            id: row.get(0)?,
            item_id: RecordId::from(item_id),
            local_data: serde_json::from_str(&local_data)?,
            server_data: server_data
                .map(|raw| serde_json::from_str::<RemoteRecord>(&raw))
                .transpose()?,
            conflict_type: conflict_type.parse()?,
            timestamp: row.get(5)?,
            resolved: row.get::<i32>(6)? != 0,
            resolution: row.get::<Option<String>>(7)?,
            resolution_data: resolution_data
                .map(|raw| serde_json::from_str::<Value>(&raw))
                .transpose()?,
        })
    }

    async fn collect(&self, sql: &str, params: impl libsql::params::IntoParams) -> Result<Vec<Conflict>> {
        let mut rows = self.conn.query(sql, params).await?;
        let mut conflicts = Vec::new();
        while let Some(row) = rows.next().await? {
            conflicts.push(Self::parse_conflict(&row)?);
        }
        Ok(conflicts)
    }
}

impl ConflictRepository for LibSqlConflictRepository<'_> {
    async fn insert(
        &self,
        item_id: &RecordId,
        local_data: &Value,
        server_data: Option<&RemoteRecord>,
        conflict_type: ConflictType,
    ) -> Result<i64> {
        let server_json = server_data.map(serde_json::to_string).transpose()?;
        self.conn
            .execute(
                "INSERT INTO conflicts (item_id, local_data, server_data, conflict_type, created_at)
                 VALUES (?, ?, ?, ?, ?)",
                params![
                    item_id.as_str(),
                    serde_json::to_string(local_data)?,
                    opt_text(server_json.as_deref()),
                    conflict_type.as_str(),
                    now_millis()
                ],
            )
            .await?;
        Ok(self.conn.last_insert_rowid())
    }

    async fn get(&self, conflict_id: i64) -> Result<Option<Conflict>> {
        let sql = format!("SELECT {CONFLICT_COLUMNS} FROM conflicts WHERE id = ?");
        Ok(self.collect(&sql, params![conflict_id]).await?.pop())
    }

    async fn open_for_item(&self, item_id: &RecordId) -> Result<Option<Conflict>> {
        let sql = format!(
            "SELECT {CONFLICT_COLUMNS} FROM conflicts
             WHERE item_id = ? AND resolved = 0
             ORDER BY created_at DESC, id DESC LIMIT 1"
        );
        Ok(self.collect(&sql, params![item_id.as_str()]).await?.pop())
    }

    async fn list(&self, include_resolved: bool, limit: usize) -> Result<Vec<Conflict>> {
        let sql = if include_resolved {
            format!("SELECT {CONFLICT_COLUMNS} FROM conflicts ORDER BY created_at DESC, id DESC LIMIT ?")
        } else {
            format!(
                "SELECT {CONFLICT_COLUMNS} FROM conflicts WHERE resolved = 0
                 ORDER BY created_at DESC, id DESC LIMIT ?"
            )
        };
        self.collect(&sql, params![limit as i64]).await
    }

    async fn open_count(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM conflicts WHERE resolved = 0", ())
            .await?;
        let count = match rows.next().await? {
            Some(row) => row.get::<i64>(0)?,
            None => 0,
        };
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn update_local_data(&self, conflict_id: i64, local_data: &Value) -> Result<()> {
        self.conn
            .execute(
                "UPDATE conflicts SET local_data = ? WHERE id = ?",
                params![serde_json::to_string(local_data)?, conflict_id],
            )
            .await?;
        Ok(())
    }

    async fn update_server_data(
        &self,
        conflict_id: i64,
        server_data: Option<&RemoteRecord>,
    ) -> Result<()> {
        let server_json = server_data.map(serde_json::to_string).transpose()?;
        self.conn
            .execute(
                "UPDATE conflicts SET server_data = ? WHERE id = ?",
                params![opt_text(server_json.as_deref()), conflict_id],
            )
            .await?;
        Ok(())
    }

    async fn mark_resolved(
        &self,
        conflict_id: i64,
        resolution: &str,
        resolution_data: Option<&Value>,
    ) -> Result<()> {
        let data_json = resolution_data.map(serde_json::to_string).transpose()?;
        self.conn
            .execute(
                "UPDATE conflicts
                 SET resolved = 1, resolution = ?, resolution_data = ?, resolved_at = ?
                 WHERE id = ?",
                params![
                    resolution,
                    opt_text(data_json.as_deref()),
                    now_millis(),
                    conflict_id
                ],
            )
            .await?;
        Ok(())
    }
}
