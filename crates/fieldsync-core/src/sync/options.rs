//! Run options, conflict policy, and run results.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::progress::SyncState;
use crate::error::Error;
use crate::services::StorageStats;

/// How conflicts raised during a run are handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Adopt the server payload
    #[default]
    ServerWins,
    /// Re-push the local payload on top of the server version
    ClientWins,
    /// Leave conflicts open for an explicit [`Resolution`]
    Manual,
}

impl ConflictStrategy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ServerWins => "server_wins",
            Self::ClientWins => "client_wins",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "server_wins" => Ok(Self::ServerWins),
            "client_wins" => Ok(Self::ClientWins),
            "manual" => Ok(Self::Manual),
            other => Err(Error::InvalidInput(format!(
                "Unknown conflict strategy '{other}'"
            ))),
        }
    }
}

/// Explicit choice for one open conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    UseLocal,
    UseServer,
    /// Push this caller-merged payload as a new local version
    Merge(Value),
    /// Leave the conflict open
    Skip,
}

impl Resolution {
    /// Name stored on the resolved conflict.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::UseLocal => "USE_LOCAL",
            Self::UseServer => "USE_SERVER",
            Self::Merge(_) => "MERGE",
            Self::Skip => "SKIP",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options of one full synchronization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Re-upload already synced records of the selected types
    pub force_sync: bool,
    /// Record types to sync; empty means every tracked type
    pub types: Vec<String>,
    /// Overrides the configured upload chunk size
    pub batch_size: Option<usize>,
    /// Overrides the configured attempt budget
    pub max_retries: Option<u32>,
    /// Overrides the configured conflict strategy
    pub conflict_resolution: Option<ConflictStrategy>,
}

impl SyncOptions {
    #[must_use]
    pub fn forced(mut self) -> Self {
        self.force_sync = true;
        self
    }

    #[must_use]
    pub fn with_types(mut self, types: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.types = types.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub const fn with_conflict_resolution(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_resolution = Some(strategy);
        self
    }
}

/// Outcome of a sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    /// No item failed, no error was recorded, and the run was not cancelled
    pub success: bool,
    pub items_synced: u64,
    pub items_failed: u64,
    /// Conflicts raised during the run
    pub conflicts: u64,
    /// Conflicts still awaiting a manual choice at the end of the run
    pub pending_conflicts: u64,
    pub errors: Vec<String>,
    pub duration_ms: u64,
    pub cancelled: bool,
}

impl SyncResult {
    pub(crate) fn push_error(&mut self, error: impl fmt::Display) {
        self.errors.push(error.to_string());
    }

    /// One-line summary for notifications and logs.
    pub fn summary(&self) -> String {
        let mut summary = format!(
            "{} synced, {} failed, {} conflicts",
            self.items_synced, self.items_failed, self.conflicts
        );
        if self.cancelled {
            summary.push_str(" (cancelled)");
        }
        summary
    }
}

/// Engine-wide counters and the latest storage snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatistics {
    pub state: SyncState,
    pub storage: StorageStats,
    /// Queue entries waiting for upload
    pub pending_uploads: u64,
    pub open_conflicts: u64,
    pub runs_completed: u64,
    pub runs_failed: u64,
    pub last_result: Option<SyncResult>,
    pub last_error: Option<String>,
}
