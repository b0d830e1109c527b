//! Server-side record representation

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::record::{payload_checksum, RecordId};
use crate::error::Result;

/// A record as the server currently holds it.
///
/// Returned by the incremental download and attached to conflict responses,
/// so the resolver can act without another round trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecord {
    /// Record identifier
    pub id: RecordId,
    /// Server version
    pub version: i64,
    /// Server payload; `null` for deletions
    #[serde(default)]
    pub payload: Value,
    /// Whether the server deleted this record
    #[serde(default)]
    pub deleted: bool,
    /// Server modification time (Unix ms)
    #[serde(default)]
    pub updated_at: Option<i64>,
}

impl RemoteRecord {
    /// Checksum of the server payload, comparable to `Record::checksum`.
    pub fn checksum(&self) -> Result<String> {
        payload_checksum(&self.payload)
    }
}
