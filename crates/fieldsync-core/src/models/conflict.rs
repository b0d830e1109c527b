//! Sync conflict model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use super::record::RecordId;
use super::remote::RemoteRecord;
use crate::error::{Error, Result};

/// Which kind of local change diverged from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictType {
    /// Local create collided with an existing server record
    Create,
    /// Local update raced a server-side change
    Update,
    /// Delete on one side raced an edit on the other
    Delete,
}

impl ConflictType {
    /// Database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CREATE" => Ok(Self::Create),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            other => Err(Error::InvalidInput(format!("Unknown conflict type: {other}"))),
        }
    }
}

/// Recorded divergence between the local and server copy of a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    /// Conflict row identifier
    pub id: i64,
    /// Record involved in the conflict
    pub item_id: RecordId,
    /// Local payload at detection time (`null` for a local delete)
    pub local_data: Value,
    /// Server representation, if the server still has the record
    pub server_data: Option<RemoteRecord>,
    /// Kind of divergence
    pub conflict_type: ConflictType,
    /// Detection timestamp (Unix ms)
    pub timestamp: i64,
    /// Whether a resolution was applied
    pub resolved: bool,
    /// Name of the applied resolution
    pub resolution: Option<String>,
    /// Payload the resolution settled on
    pub resolution_data: Option<Value>,
}

impl Conflict {
    /// Server version known at detection time.
    #[must_use]
    pub fn server_version(&self) -> Option<i64> {
        self.server_data.as_ref().map(|remote| remote.version)
    }

    /// Whether the server reported the record as deleted.
    ///
    /// A conflict without server data is unknown, not deleted.
    #[must_use]
    pub fn server_deleted(&self) -> bool {
        self.server_data.as_ref().is_some_and(|remote| remote.deleted)
    }

    /// Version a push of the local side must be based on.
    ///
    /// `None` means create. Without server data the record keeps `local_base`.
    #[must_use]
    pub fn base_version(&self, local_base: Option<i64>) -> Option<i64> {
        match &self.server_data {
            Some(remote) if remote.deleted => None,
            Some(remote) => Some(remote.version),
            None => local_base,
        }
    }
}
