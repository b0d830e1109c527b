//! Record model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::util::sha256_hex;

/// Identifier of a synchronized record.
///
/// Client-generated ids are `{type}_{unix_ms}_{suffix}` so records can be
/// created while offline. Server-issued ids are accepted verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Generate a new id for a record of the given type.
    #[must_use]
    pub fn generate(item_type: &str) -> Self {
        let prefix: String = item_type
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .collect::<String>()
            .to_ascii_lowercase();
        let prefix = if prefix.is_empty() {
            "item".to_string()
        } else {
            prefix
        };
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!(
            "{prefix}_{}_{}",
            chrono::Utc::now().timestamp_millis(),
            &suffix[..8]
        ))
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RecordId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidInput("Record id cannot be empty".to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RecordId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Synchronization state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    /// Written locally, not yet acknowledged by the server
    Local,
    /// An upload for this record is in flight
    Syncing,
    /// Server acknowledged the current payload
    Synced,
    /// The last upload attempt failed
    Error,
    /// Diverged from the server; waiting for resolution
    Conflict,
}

impl SyncStatus {
    /// Database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "LOCAL",
            Self::Syncing => "SYNCING",
            Self::Synced => "SYNCED",
            Self::Error => "ERROR",
            Self::Conflict => "CONFLICT",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOCAL" => Ok(Self::Local),
            "SYNCING" => Ok(Self::Syncing),
            "SYNCED" => Ok(Self::Synced),
            "ERROR" => Ok(Self::Error),
            "CONFLICT" => Ok(Self::Conflict),
            other => Err(Error::InvalidInput(format!("Unknown sync status: {other}"))),
        }
    }
}

/// A synchronized business record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Stable identifier
    pub id: RecordId,
    /// Domain tag used for endpoint routing ("visit", "customer", ...)
    pub item_type: String,
    /// Opaque payload; never interpreted by the engine
    pub payload: Value,
    /// Local write counter, bumped on every changing write
    pub version: i64,
    /// Version last acknowledged by the server
    pub server_version: Option<i64>,
    /// Hex SHA-256 of the serialized payload
    pub checksum: String,
    /// Synchronization state
    pub sync_status: SyncStatus,
    /// Tombstone flag; set until the server confirms the delete
    pub is_deleted: bool,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last write timestamp (Unix ms)
    pub updated_at: i64,
    /// Last successful upload or download (Unix ms)
    pub last_synced_at: Option<i64>,
}

impl Record {
    /// Returns true when the record carries edits the server has not seen.
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        !matches!(self.sync_status, SyncStatus::Synced)
    }
}

/// Serialize a payload the way it is stored and checksummed.
pub fn serialize_payload(payload: &Value) -> Result<String> {
    Ok(serde_json::to_string(payload)?)
}

/// Checksum of a payload as stored.
pub fn payload_checksum(payload: &Value) -> Result<String> {
    Ok(sha256_hex(serialize_payload(payload)?.as_bytes()))
}
