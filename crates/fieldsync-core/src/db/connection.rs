//! Database connection management

use crate::error::Result;
use libsql::{Builder, Connection, Database as LibSqlDatabase};
use std::path::Path;

use super::migrations;

/// Database wrapper for a local libSQL connection
pub struct Database {
    _db: LibSqlDatabase,
    conn: Connection,
}

impl Database {
    /// Open a local database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations and crash recovery automatically.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let db = Builder::new_local(&path_str).build().await?;
        Self::init(db, true).await
    }

    /// Open an in-memory database (useful for testing)
    pub async fn open_in_memory() -> Result<Self> {
        let db = Builder::new_local(":memory:").build().await?;
        Self::init(db, false).await
    }

    async fn init(db: LibSqlDatabase, on_disk: bool) -> Result<Self> {
        let conn = db.connect()?;
        let database = Self { _db: db, conn };
        database.configure(on_disk).await?;
        database.migrate().await?;
        database.recover_interrupted_sync().await?;
        Ok(database)
    }

    /// Configure `SQLite` for durable writes
    async fn configure(&self, on_disk: bool) -> Result<()> {
        if on_disk {
            // journal_mode returns a row, which some drivers report as an error
            self.conn
                .execute("PRAGMA journal_mode = WAL;", ())
                .await
                .ok();
            // FULL fsyncs the WAL on every commit so a committed put survives power loss
            self.conn
                .execute("PRAGMA synchronous = FULL;", ())
                .await
                .ok();
        }
        self.conn.execute("PRAGMA foreign_keys = ON;", ()).await?;
        self.conn
            .execute("PRAGMA busy_timeout = 5000;", ())
            .await
            .ok();
        Ok(())
    }

    /// Run database migrations
    async fn migrate(&self) -> Result<()> {
        migrations::run(&self.conn).await
    }

    /// Records left `SYNCING` by a process that died mid-upload go back to `LOCAL`.
    ///
    /// Their queue entries are still present, so the next sync retries them.
    async fn recover_interrupted_sync(&self) -> Result<()> {
        let reset = self
            .conn
            .execute(
                "UPDATE records SET sync_status = 'LOCAL' WHERE sync_status = 'SYNCING'",
                (),
            )
            .await?;
        if reset > 0 {
            tracing::warn!("Recovered {reset} record(s) interrupted mid-sync");
        }
        Ok(())
    }

    /// Get a reference to the underlying connection
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }
}
