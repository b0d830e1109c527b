//! Sync queue repository

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use libsql::params::Params;
use libsql::{params, Connection, Value};

use super::values::text_list_clause;
use crate::error::Result;
use crate::models::{DequeueFilter, QueueEntry, QueueOperation, RecordId};
use crate::util::now_millis;

const QUEUE_COLUMNS: &str =
    "q.id, q.item_id, q.operation, q.priority, q.retry_count, q.last_attempt, q.error_message, q.created_at";

/// Trait for the durable upload backlog (async)
#[allow(async_fn_in_trait)]
pub trait QueueRepository {
    /// Enqueue an operation; an existing `(item, operation)` entry is kept.
    ///
    /// A repeated enqueue only raises the entry's priority.
    async fn enqueue(
        &self,
        item_id: &RecordId,
        operation: QueueOperation,
        priority: i64,
    ) -> Result<()>;

    /// Entries matching `filter`, highest priority then oldest first.
    async fn list(&self, limit: usize, filter: &DequeueFilter) -> Result<Vec<QueueEntry>>;

    /// Number of entries matching `filter`.
    async fn count(&self, filter: &DequeueFilter) -> Result<u64>;

    /// Look up the pending entry for an item and operation.
    async fn find(
        &self,
        item_id: &RecordId,
        operation: QueueOperation,
    ) -> Result<Option<QueueEntry>>;

    /// Whether any operation is pending for an item.
    async fn has_pending(&self, item_id: &RecordId) -> Result<bool>;

    /// Remove an entry after its remote operation was confirmed.
    async fn remove(&self, queue_id: i64) -> Result<bool>;

    /// Remove a specific operation for an item.
    async fn remove_operation(
        &self,
        item_id: &RecordId,
        operation: QueueOperation,
    ) -> Result<()>;

    /// Remove every pending operation for an item.
    async fn remove_for_item(&self, item_id: &RecordId) -> Result<()>;

    /// Count a failed attempt without removing the entry.
    async fn record_failure(&self, queue_id: i64, error: &str) -> Result<()>;
}

/// libSQL-backed durable backlog of pending remote operations
pub struct LibSqlQueueRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlQueueRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_entry(row: &libsql::Row) -> Result<QueueEntry> {
        let item_id: String = row.get(1)?;
        let operation: String = row.get(2)?;
        Ok(QueueEntry {
            id: row.get(0)?,
            item_id: RecordId::from(item_id),
            operation: operation.parse()?,
            priority: row.get(3)?,
            retry_count: row.get(4)?,
            last_attempt: row.get::<Option<i64>>(5)?,
            error_message: row.get::<Option<String>>(6)?,
            created_at: row.get(7)?,
        })
    }

    fn where_clause(filter: &DequeueFilter) -> (String, Vec<Value>) {
        let mut clauses = Vec::new();
        let mut values = Vec::new();

        if !filter.types.is_empty() {
            clauses.push(format!(
                "r.item_type IN ({})",
                text_list_clause(filter.types.len())
            ));
            values.extend(filter.types.iter().map(|t| Value::from(t.as_str())));
        }
        if let Some(item_ids) = &filter.item_ids {
            if item_ids.is_empty() {
                clauses.push("0".to_string());
            } else {
                clauses.push(format!(
                    "q.item_id IN ({})",
                    text_list_clause(item_ids.len())
                ));
                values.extend(item_ids.iter().map(|id| Value::from(id.as_str())));
            }
        }
        if let Some(cursor) = filter.after {
            // Row-value keyset matching the ORDER BY of `list`.
            clauses.push("(-q.priority, q.created_at, q.id) > (?, ?, ?)".to_string());
            values.extend([
                Value::Integer(-cursor.priority),
                Value::Integer(cursor.created_at),
                Value::Integer(cursor.id),
            ]);
        }

        if clauses.is_empty() {
            (String::new(), values)
        } else {
            (format!("WHERE {}", clauses.join(" AND ")), values)
        }
    }
}

impl QueueRepository for LibSqlQueueRepository<'_> {
    async fn enqueue(
        &self,
        item_id: &RecordId,
        operation: QueueOperation,
        priority: i64,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sync_queue (item_id, operation, priority, created_at)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT(item_id, operation)
                 DO UPDATE SET priority = MAX(priority, excluded.priority)",
                params![item_id.as_str(), operation.as_str(), priority, now_millis()],
            )
            .await?;
        Ok(())
    }

    async fn list(&self, limit: usize, filter: &DequeueFilter) -> Result<Vec<QueueEntry>> {
        let (where_clause, mut values) = Self::where_clause(filter);
        let sql = format!(
            "SELECT {QUEUE_COLUMNS} FROM sync_queue q
             LEFT JOIN records r ON r.id = q.item_id
             {where_clause}
             ORDER BY q.priority DESC, q.created_at ASC, q.id ASC
             LIMIT ?"
        );
        values.push(Value::Integer(limit as i64));

        let mut rows = self.conn.query(&sql, Params::Positional(values)).await?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            entries.push(Self::parse_entry(&row)?);
        }
        Ok(entries)
    }

    async fn count(&self, filter: &DequeueFilter) -> Result<u64> {
        let (where_clause, values) = Self::where_clause(filter);
        let sql = format!(
            "SELECT COUNT(*) FROM sync_queue q LEFT JOIN records r ON r.id = q.item_id {where_clause}"
        );
        let mut rows = self.conn.query(&sql, Params::Positional(values)).await?;
        let count = match rows.next().await? {
            Some(row) => row.get::<i64>(0)?,
            None => 0,
        };
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn find(
        &self,
        item_id: &RecordId,
        operation: QueueOperation,
    ) -> Result<Option<QueueEntry>> {
        let sql = format!(
            "SELECT {QUEUE_COLUMNS} FROM sync_queue q WHERE q.item_id = ? AND q.operation = ?"
        );
        let mut rows = self
            .conn
            .query(&sql, params![item_id.as_str(), operation.as_str()])
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_entry(&row)?)),
            None => Ok(None),
        }
    }

    async fn has_pending(&self, item_id: &RecordId) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT EXISTS(SELECT 1 FROM sync_queue WHERE item_id = ?)",
                params![item_id.as_str()],
            )
            .await?;
        Ok(match rows.next().await? {
            Some(row) => row.get::<i32>(0)? != 0,
            None => false,
        })
    }

    async fn remove(&self, queue_id: i64) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM sync_queue WHERE id = ?", params![queue_id])
            .await?;
        Ok(rows > 0)
    }

    async fn remove_operation(
        &self,
        item_id: &RecordId,
        operation: QueueOperation,
    ) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM sync_queue WHERE item_id = ? AND operation = ?",
                params![item_id.as_str(), operation.as_str()],
            )
            .await?;
        Ok(())
    }

    async fn remove_for_item(&self, item_id: &RecordId) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM sync_queue WHERE item_id = ?",
                params![item_id.as_str()],
            )
            .await?;
        Ok(())
    }

    async fn record_failure(&self, queue_id: i64, error: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE sync_queue
                 SET retry_count = retry_count + 1, last_attempt = ?, error_message = ?
                 WHERE id = ?",
                params![now_millis(), error, queue_id],
            )
            .await?;
        Ok(())
    }
}
