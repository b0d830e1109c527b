//! Attachment metadata repository

use libsql::{params, Connection};
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::models::{Attachment, RecordId};

const ATTACHMENT_COLUMNS: &str =
    "id, item_id, file_name, mime_type, size_bytes, local_path, checksum, uploaded, created_at";

/// Trait for attachment metadata storage (async)
#[allow(async_fn_in_trait)]
pub trait AttachmentRepository {
    /// Persist attachment metadata.
    async fn insert(&self, attachment: &Attachment) -> Result<()>;

    /// Attachments of an item, oldest first; only pending ones when `pending_only`.
    async fn list_for_item(
        &self,
        item_id: &RecordId,
        pending_only: bool,
    ) -> Result<Vec<Attachment>>;

    /// Flag an attachment as present on the server.
    async fn mark_uploaded(&self, attachment: &Attachment) -> Result<()>;

    /// Remove all attachment rows of an item.
    async fn delete_for_item(&self, item_id: &RecordId) -> Result<()>;

    /// Bytes held in attachment storage.
    async fn total_bytes(&self) -> Result<i64>;
}

/// libSQL-backed attachment metadata
pub struct LibSqlAttachmentRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlAttachmentRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_attachment(row: &libsql::Row) -> Result<Attachment> {
        let id: String = row.get(0)?;
        let item_id: String = row.get(1)?;
        let local_path: String = row.get(5)?;
        Ok(Attachment {
            id: id
                .parse()
                .map_err(|_| Error::InvalidInput(format!("Invalid attachment id: {id}")))?,
            item_id: RecordId::from(item_id),
            file_name: row.get(2)?,
            mime_type: row.get(3)?,
            size_bytes: row.get(4)?,
            local_path: PathBuf::from(local_path),
            checksum: row.get(6)?,
            uploaded: row.get::<i32>(7)? != 0,
            created_at: row.get(8)?,
        })
    }
}

impl AttachmentRepository for LibSqlAttachmentRepository<'_> {
    async fn insert(&self, attachment: &Attachment) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO attachments ({ATTACHMENT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
                ),
                params![
                    attachment.id.as_str(),
                    attachment.item_id.as_str(),
                    attachment.file_name.as_str(),
                    attachment.mime_type.as_str(),
                    attachment.size_bytes,
                    attachment.local_path.to_string_lossy().to_string(),
                    attachment.checksum.as_str(),
                    i32::from(attachment.uploaded),
                    attachment.created_at
                ],
            )
            .await?;
        Ok(())
    }

    async fn list_for_item(
        &self,
        item_id: &RecordId,
        pending_only: bool,
    ) -> Result<Vec<Attachment>> {
        let sql = if pending_only {
            format!(
                "SELECT {ATTACHMENT_COLUMNS} FROM attachments
                 WHERE item_id = ? AND uploaded = 0 ORDER BY created_at ASC"
            )
        } else {
            format!(
                "SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE item_id = ? ORDER BY created_at ASC"
            )
        };
        let mut rows = self.conn.query(&sql, params![item_id.as_str()]).await?;
        let mut attachments = Vec::new();
        while let Some(row) = rows.next().await? {
            attachments.push(Self::parse_attachment(&row)?);
        }
        Ok(attachments)
    }

    async fn mark_uploaded(&self, attachment: &Attachment) -> Result<()> {
        self.conn
            .execute(
                "UPDATE attachments SET uploaded = 1 WHERE id = ?",
                params![attachment.id.as_str()],
            )
            .await?;
        Ok(())
    }

    async fn delete_for_item(&self, item_id: &RecordId) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM attachments WHERE item_id = ?",
                params![item_id.as_str()],
            )
            .await?;
        Ok(())
    }

    async fn total_bytes(&self) -> Result<i64> {
        let mut rows = self
            .conn
            .query("SELECT COALESCE(SUM(size_bytes), 0) FROM attachments", ())
            .await?;
        Ok(match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        })
    }
}
