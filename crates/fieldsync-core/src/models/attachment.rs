//! Attachment model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

use super::record::RecordId;

/// A unique identifier for an attachment, using UUID v7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttachmentId(Uuid);

impl AttachmentId {
    /// Create a new unique attachment ID using UUID v7.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID.
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for AttachmentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AttachmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AttachmentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Binary file (photo, signature) owned by a record.
///
/// The bytes live in engine-owned storage at `local_path`, never at the
/// caller's transient source path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Unique attachment identifier.
    pub id: AttachmentId,
    /// Owning record.
    pub item_id: RecordId,
    /// Original file name.
    pub file_name: String,
    /// Content MIME type.
    pub mime_type: String,
    /// Attachment size in bytes.
    pub size_bytes: i64,
    /// Engine-owned copy of the bytes.
    pub local_path: PathBuf,
    /// Hex SHA-256 of the bytes.
    pub checksum: String,
    /// Whether the server has the bytes.
    pub uploaded: bool,
    /// Creation timestamp (Unix ms).
    pub created_at: i64,
}

impl Attachment {
    /// Create new attachment metadata.
    pub fn new(
        item_id: RecordId,
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
        size_bytes: i64,
        local_path: PathBuf,
        checksum: impl Into<String>,
    ) -> Result<Self> {
        let file_name = file_name.into().trim().to_string();
        let mime_type = mime_type.into().trim().to_string();

        if file_name.is_empty() {
            return Err(Error::InvalidInput(
                "Attachment file_name cannot be empty".to_string(),
            ));
        }
        if mime_type.is_empty() {
            return Err(Error::InvalidInput(
                "Attachment mime_type cannot be empty".to_string(),
            ));
        }
        if size_bytes < 0 {
            return Err(Error::InvalidInput(
                "Attachment size_bytes cannot be negative".to_string(),
            ));
        }

        Ok(Self {
            id: AttachmentId::new(),
            item_id,
            file_name,
            mime_type,
            size_bytes,
            local_path,
            checksum: checksum.into(),
            uploaded: false,
            created_at: chrono::Utc::now().timestamp_millis(),
        })
    }
}
