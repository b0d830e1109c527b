//! Metadata repository implementation

use crate::error::Result;
use libsql::Connection;

/// Key holding the last fully-completed sync watermark (Unix ms)
pub const LAST_SYNC_KEY: &str = "last_sync";

/// Trait for engine bookkeeping storage (async)
#[allow(async_fn_in_trait)]
pub trait MetadataRepository {
    /// Read a value
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Insert or replace a value
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Read the sync watermark
    async fn last_sync(&self) -> Result<Option<i64>> {
        Ok(self
            .get(LAST_SYNC_KEY)
            .await?
            .and_then(|value| value.trim().parse().ok()))
    }
}

/// libSQL implementation of `MetadataRepository`
pub struct LibSqlMetadataRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlMetadataRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl MetadataRepository for LibSqlMetadataRepository<'_> {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query("SELECT value FROM metadata WHERE key = ?", [key])
            .await?;

        if let Some(row) = rows.next().await? {
            let value: String = row.get(0)?;
            Ok(Some(value))
        } else {
            Ok(None)
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO metadata (key, value) VALUES (?, ?)",
                [key, value],
            )
            .await?;
        Ok(())
    }
}
