//! Sync queue model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

use super::record::{Record, RecordId};

/// Remote operation a queue entry stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueOperation {
    /// Create or update the record on the server
    Upsert,
    /// Delete the record on the server (tombstone)
    Delete,
}

impl QueueOperation {
    /// Database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Upsert => "UPSERT",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for QueueOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueOperation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "UPSERT" => Ok(Self::Upsert),
            "DELETE" => Ok(Self::Delete),
            other => Err(Error::InvalidInput(format!(
                "Unknown queue operation: {other}"
            ))),
        }
    }
}

/// A pending remote operation derived from a local write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Queue row identifier
    pub id: i64,
    /// Record the operation applies to
    pub item_id: RecordId,
    /// Operation to perform remotely
    pub operation: QueueOperation,
    /// Higher drains first
    pub priority: i64,
    /// Failed dispatch attempts so far
    pub retry_count: i64,
    /// Timestamp of the last failed attempt (Unix ms)
    pub last_attempt: Option<i64>,
    /// Reason of the last failure
    pub error_message: Option<String>,
    /// Enqueue timestamp (Unix ms)
    pub created_at: i64,
}

impl QueueEntry {
    /// Position of this entry in drain order.
    #[must_use]
    pub const fn cursor(&self) -> QueueCursor {
        QueueCursor {
            priority: self.priority,
            created_at: self.created_at,
            id: self.id,
        }
    }

    /// Whether a dispatch of this entry was ever attempted.
    #[must_use]
    pub const fn was_attempted(&self) -> bool {
        self.last_attempt.is_some()
    }
}

/// Drain-order position: `(priority DESC, created_at ASC, id ASC)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueCursor {
    pub priority: i64,
    pub created_at: i64,
    pub id: i64,
}

/// A queue entry joined with the record's state at drain time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainedEntry {
    /// The queue entry
    pub entry: QueueEntry,
    /// Current record, including tombstones; `None` if purged
    pub record: Option<Record>,
}

/// Selection of queue entries to drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DequeueFilter {
    /// Restrict to these record types (empty = all)
    pub types: Vec<String>,
    /// Restrict to these record ids
    pub item_ids: Option<Vec<RecordId>>,
    /// Only entries ordered strictly after this position
    pub after: Option<QueueCursor>,
}

impl DequeueFilter {
    /// Filter restricted to the given record types.
    #[must_use]
    pub fn for_types(types: &[String]) -> Self {
        Self {
            types: types.to_vec(),
            ..Self::default()
        }
    }

    /// Filter restricted to explicit record ids.
    #[must_use]
    pub fn for_items(item_ids: &[RecordId]) -> Self {
        Self {
            item_ids: Some(item_ids.to_vec()),
            ..Self::default()
        }
    }
}
