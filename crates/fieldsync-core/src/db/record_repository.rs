//! Record repository implementation

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT/OFFSET

use libsql::params::Params;
use libsql::{params, Connection, Value};
use serde::{Deserialize, Serialize};

use super::values::{opt_int, text_list_clause};
use crate::error::Result;
use crate::models::{serialize_payload, Record, RecordId, SyncStatus};

const RECORD_COLUMNS: &str = "id, item_type, payload, version, server_version, checksum, \
     sync_status, is_deleted, created_at, updated_at, last_synced_at";

/// Column used to order query results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderBy {
    /// Creation time
    CreatedAt,
    /// Last write time
    #[default]
    UpdatedAt,
    /// Local version
    Version,
}

impl OrderBy {
    const fn column(self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
            Self::UpdatedAt => "updated_at",
            Self::Version => "version",
        }
    }
}

/// Sort direction for query results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    /// Ascending
    Asc,
    /// Descending
    #[default]
    Desc,
}

impl SortDirection {
    const fn keyword(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Filtering and pagination for record listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordQuery {
    /// Only records in this state
    pub sync_status: Option<SyncStatus>,
    /// Page size
    pub limit: usize,
    /// Rows to skip
    pub offset: usize,
    /// Sort column
    pub order_by: OrderBy,
    /// Sort direction
    pub direction: SortDirection,
}

impl Default for RecordQuery {
    fn default() -> Self {
        Self {
            sync_status: None,
            limit: 50,
            offset: 0,
            order_by: OrderBy::UpdatedAt,
            direction: SortDirection::Desc,
        }
    }
}

/// Per-status record counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    /// Live (non-tombstoned) records
    pub total: u64,
    /// `LOCAL` records
    pub local: u64,
    /// `SYNCED` records
    pub synced: u64,
    /// `ERROR` records
    pub error: u64,
    /// `CONFLICT` records
    pub conflict: u64,
}

/// Trait for record storage operations (async)
#[allow(async_fn_in_trait)]
pub trait RecordRepository {
    /// Fetch a record; tombstones only when `include_deleted` is set
    async fn get(&self, id: &RecordId, include_deleted: bool) -> Result<Option<Record>>;

    /// Insert a new record row
    async fn insert(&self, record: &Record) -> Result<()>;

    /// Overwrite every mutable column of an existing record
    async fn update(&self, record: &Record) -> Result<()>;

    /// List live records of a type
    async fn query(&self, item_type: &str, query: &RecordQuery) -> Result<Vec<Record>>;

    /// Set the sync status; returns false if the record does not exist
    async fn set_status(&self, id: &RecordId, status: SyncStatus) -> Result<bool>;

    /// Atomically move a record to `SYNCING` unless it is already syncing or conflicted
    async fn try_mark_syncing(&self, id: &RecordId) -> Result<bool>;

    /// Physically remove a record
    async fn purge(&self, id: &RecordId) -> Result<()>;

    /// Ids of live `SYNCED` records, optionally restricted to types
    async fn synced_ids(&self, types: &[String]) -> Result<Vec<RecordId>>;

    /// Per-status counts of live records
    async fn status_counts(&self) -> Result<StatusCounts>;

    /// Bytes of stored payload text
    async fn payload_bytes(&self) -> Result<i64>;
}

/// libSQL implementation of `RecordRepository`
pub struct LibSqlRecordRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlRecordRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Parse a record from a database row
    fn parse_record(row: &libsql::Row) -> Result<Record> {
        let id: String = row.get(0)?;
        let payload: String = row.get(2)?;
        let status: String = row.get(6)?;
        Ok(Record {
            id: RecordId::from(id),
            item_type: row.get(1)?,
            payload: serde_json::from_str(&payload)?,
            version: row.get(3)?,
            server_version: row.get::<Option<i64>>(4)?,
            checksum: row.get(5)?,
            sync_status: status.parse()?,
            is_deleted: row.get::<i32>(7)? != 0,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
            last_synced_at: row.get::<Option<i64>>(10)?,
        })
    }

    async fn collect(&self, sql: &str, params: Params) -> Result<Vec<Record>> {
        let mut rows = self.conn.query(sql, params).await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(Self::parse_record(&row)?);
        }
        Ok(records)
    }
}

impl RecordRepository for LibSqlRecordRepository<'_> {
    async fn get(&self, id: &RecordId, include_deleted: bool) -> Result<Option<Record>> {
        let sql = if include_deleted {
            format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = ?")
        } else {
            format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = ? AND is_deleted = 0")
        };
        let mut records = self
            .collect(&sql, Params::Positional(vec![Value::from(id.as_str())]))
            .await?;
        Ok(records.pop())
    }

    async fn insert(&self, record: &Record) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO records ({RECORD_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
                ),
                params![
                    record.id.as_str(),
                    record.item_type.as_str(),
                    serialize_payload(&record.payload)?,
                    record.version,
                    opt_int(record.server_version),
                    record.checksum.as_str(),
                    record.sync_status.as_str(),
                    i32::from(record.is_deleted),
                    record.created_at,
                    record.updated_at,
                    opt_int(record.last_synced_at)
                ],
            )
            .await?;
        Ok(())
    }

    async fn update(&self, record: &Record) -> Result<()> {
        self.conn
            .execute(
                "UPDATE records SET item_type = ?, payload = ?, version = ?, server_version = ?,
                    checksum = ?, sync_status = ?, is_deleted = ?, updated_at = ?, last_synced_at = ?
                 WHERE id = ?",
                params![
                    record.item_type.as_str(),
                    serialize_payload(&record.payload)?,
                    record.version,
                    opt_int(record.server_version),
                    record.checksum.as_str(),
                    record.sync_status.as_str(),
                    i32::from(record.is_deleted),
                    record.updated_at,
                    opt_int(record.last_synced_at),
                    record.id.as_str()
                ],
            )
            .await?;
        Ok(())
    }

    async fn query(&self, item_type: &str, query: &RecordQuery) -> Result<Vec<Record>> {
        let mut values = vec![Value::from(item_type)];
        let mut sql =
            format!("SELECT {RECORD_COLUMNS} FROM records WHERE item_type = ? AND is_deleted = 0");
        if let Some(status) = query.sync_status {
            sql.push_str(" AND sync_status = ?");
            values.push(Value::from(status.as_str()));
        }
        sql.push_str(&format!(
            " ORDER BY {} {}, id ASC LIMIT ? OFFSET ?",
            query.order_by.column(),
            query.direction.keyword()
        ));
        values.push(Value::Integer(query.limit as i64));
        values.push(Value::Integer(query.offset as i64));

        self.collect(&sql, Params::Positional(values)).await
    }

    async fn set_status(&self, id: &RecordId, status: SyncStatus) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "UPDATE records SET sync_status = ? WHERE id = ?",
                params![status.as_str(), id.as_str()],
            )
            .await?;
        Ok(rows > 0)
    }

    async fn try_mark_syncing(&self, id: &RecordId) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "UPDATE records SET sync_status = 'SYNCING'
                 WHERE id = ? AND sync_status NOT IN ('SYNCING', 'CONFLICT')",
                params![id.as_str()],
            )
            .await?;
        Ok(rows == 1)
    }

    async fn purge(&self, id: &RecordId) -> Result<()> {
        self.conn
            .execute("DELETE FROM records WHERE id = ?", params![id.as_str()])
            .await?;
        Ok(())
    }

    async fn synced_ids(&self, types: &[String]) -> Result<Vec<RecordId>> {
        let mut sql = String::from(
            "SELECT id FROM records WHERE sync_status = 'SYNCED' AND is_deleted = 0",
        );
        let mut values = Vec::new();
        if !types.is_empty() {
            sql.push_str(&format!(" AND item_type IN ({})", text_list_clause(types.len())));
            values.extend(types.iter().map(|t| Value::from(t.as_str())));
        }
        sql.push_str(" ORDER BY updated_at ASC");

        let mut rows = self.conn.query(&sql, Params::Positional(values)).await?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next().await? {
            ids.push(RecordId::from(row.get::<String>(0)?));
        }
        Ok(ids)
    }

    async fn status_counts(&self) -> Result<StatusCounts> {
        let mut rows = self
            .conn
            .query(
                "SELECT sync_status, COUNT(*) FROM records WHERE is_deleted = 0 GROUP BY sync_status",
                (),
            )
            .await?;

        let mut counts = StatusCounts::default();
        while let Some(row) = rows.next().await? {
            let status: String = row.get(0)?;
            let count = u64::try_from(row.get::<i64>(1)?).unwrap_or_default();
            counts.total += count;
            match status.parse::<SyncStatus>()? {
                SyncStatus::Local | SyncStatus::Syncing => counts.local += count,
                SyncStatus::Synced => counts.synced += count,
                SyncStatus::Error => counts.error += count,
                SyncStatus::Conflict => counts.conflict += count,
            }
        }
        Ok(counts)
    }

    async fn payload_bytes(&self) -> Result<i64> {
        let mut rows = self
            .conn
            .query("SELECT COALESCE(SUM(LENGTH(payload)), 0) FROM records", ())
            .await?;
        Ok(match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::payload_checksum;
    use serde_json::json;

    async fn setup() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    fn record(id: &str, item_type: &str, updated_at: i64, status: SyncStatus) -> Record {
        let payload = json!({"id": id});
        Record {
            id: RecordId::from(id),
            item_type: item_type.to_string(),
            checksum: payload_checksum(&payload).unwrap(),
            payload,
            version: 1,
            server_version: None,
            sync_status: status,
            is_deleted: false,
            created_at: updated_at,
            updated_at,
            last_synced_at: None,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_insert_and_get() {
        let db = setup().await;
        let repo = LibSqlRecordRepository::new(db.connection());

        let rec = record("V1", "visit", 10, SyncStatus::Local);
        repo.insert(&rec).await.unwrap();

        let fetched = repo.get(&rec.id, false).await.unwrap().unwrap();
        assert_eq!(fetched, rec);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_tombstones_hidden_from_get() {
        let db = setup().await;
        let repo = LibSqlRecordRepository::new(db.connection());

        let mut rec = record("V1", "visit", 10, SyncStatus::Local);
        rec.is_deleted = true;
        repo.insert(&rec).await.unwrap();

        assert!(repo.get(&rec.id, false).await.unwrap().is_none());
        assert!(repo.get(&rec.id, true).await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_query_filters_and_paginates() {
        let db = setup().await;
        let repo = LibSqlRecordRepository::new(db.connection());

        repo.insert(&record("V1", "visit", 10, SyncStatus::Local)).await.unwrap();
        repo.insert(&record("V2", "visit", 20, SyncStatus::Synced)).await.unwrap();
        repo.insert(&record("V3", "visit", 30, SyncStatus::Local)).await.unwrap();
        repo.insert(&record("C1", "customer", 40, SyncStatus::Local)).await.unwrap();

        let all = repo.query("visit", &RecordQuery::default()).await.unwrap();
        let ids: Vec<_> = all.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["V3", "V2", "V1"]);

        let local = repo
            .query(
                "visit",
                &RecordQuery {
                    sync_status: Some(SyncStatus::Local),
                    direction: SortDirection::Asc,
                    ..RecordQuery::default()
                },
            )
            .await
            .unwrap();
        let ids: Vec<_> = local.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["V1", "V3"]);

        let page = repo
            .query(
                "visit",
                &RecordQuery {
                    limit: 1,
                    offset: 1,
                    ..RecordQuery::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id.as_str(), "V2");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_try_mark_syncing_is_check_and_set() {
        let db = setup().await;
        let repo = LibSqlRecordRepository::new(db.connection());
        let rec = record("V1", "visit", 10, SyncStatus::Local);
        repo.insert(&rec).await.unwrap();

        assert!(repo.try_mark_syncing(&rec.id).await.unwrap());
        assert!(!repo.try_mark_syncing(&rec.id).await.unwrap());

        repo.set_status(&rec.id, SyncStatus::Conflict).await.unwrap();
        assert!(!repo.try_mark_syncing(&rec.id).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_status_counts() {
        let db = setup().await;
        let repo = LibSqlRecordRepository::new(db.connection());

        repo.insert(&record("V1", "visit", 1, SyncStatus::Local)).await.unwrap();
        repo.insert(&record("V2", "visit", 2, SyncStatus::Synced)).await.unwrap();
        repo.insert(&record("V3", "visit", 3, SyncStatus::Error)).await.unwrap();
        repo.insert(&record("V4", "visit", 4, SyncStatus::Conflict)).await.unwrap();

        let counts = repo.status_counts().await.unwrap();
        assert_eq!(counts.total, 4);
        assert_eq!(counts.local, 1);
        assert_eq!(counts.synced, 1);
        assert_eq!(counts.error, 1);
        assert_eq!(counts.conflict, 1);

        let synced = repo.synced_ids(&["visit".to_string()]).await.unwrap();
        assert_eq!(synced, vec![RecordId::from("V2")]);
        assert!(repo.synced_ids(&["sale".to_string()]).await.unwrap().is_empty());
    }
}
