//! Applies conflict strategies and explicit resolutions.

use serde_json::Value;

use super::batch::{BatchSynchronizer, PushOutcome};
use super::cancel::CancellationToken;
use super::options::{ConflictStrategy, Resolution};
use super::retry::RetryPolicy;
use crate::error::{Error, Result};
use crate::models::{Conflict, ConflictType, Record};
use crate::services::{LocalStore, UploadCompletion};

/// What resolving one conflict did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionOutcome {
    /// Closed; the record is `SYNCED` (or purged)
    Resolved,
    /// Closed; the record is `LOCAL` with an upload queued
    Requeued,
    /// The server rejected the push again; the conflict stays open
    Reopened,
    /// Left open
    Skipped,
}

/// Totals of applying a strategy to a set of conflicts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionReport {
    pub resolved: u64,
    pub requeued: u64,
    /// Conflicts still open afterwards
    pub pending: u64,
    pub errors: Vec<String>,
}

/// Resolves conflicts through the store, pushing local data when needed.
#[derive(Clone)]
pub struct ConflictResolver {
    store: LocalStore,
    sync: BatchSynchronizer,
}

impl ConflictResolver {
    pub const fn new(store: LocalStore, sync: BatchSynchronizer) -> Self {
        Self { store, sync }
    }

    /// Apply `strategy` to each of `conflict_ids`.
    ///
    /// `Manual` leaves every conflict open. Auth and storage failures abort;
    /// other per-conflict errors are accumulated.
    pub async fn apply_strategy(
        &self,
        conflict_ids: &[i64],
        strategy: ConflictStrategy,
        retry: RetryPolicy,
        cancel: &CancellationToken,
        on_progress: &mut (dyn FnMut(u64, u64) + Send),
    ) -> Result<ResolutionReport> {
        let mut report = ResolutionReport::default();
        let total = conflict_ids.len() as u64;
        on_progress(0, total);

        let resolution = match strategy {
            ConflictStrategy::ServerWins => Resolution::UseServer,
            ConflictStrategy::ClientWins => Resolution::UseLocal,
            ConflictStrategy::Manual => {
                report.pending = total;
                on_progress(total, total);
                return Ok(report);
            }
        };

        for (index, conflict_id) in conflict_ids.iter().enumerate() {
            if cancel.is_cancelled() {
                report.pending += total - index as u64;
                break;
            }
            match self.resolve(*conflict_id, resolution.clone(), retry).await {
                Ok(ResolutionOutcome::Resolved) => report.resolved += 1,
                Ok(ResolutionOutcome::Requeued) => report.requeued += 1,
                Ok(ResolutionOutcome::Reopened | ResolutionOutcome::Skipped) => report.pending += 1,
                Err(error) if error.is_run_fatal() => return Err(error),
                Err(error) => {
                    tracing::warn!("Conflict {conflict_id} not resolved: {error}");
                    report.pending += 1;
                    report.errors.push(format!("conflict {conflict_id}: {error}"));
                }
            }
            on_progress(index as u64 + 1, total);
        }
        Ok(report)
    }

    /// Apply an explicit resolution to one open conflict.
    pub async fn resolve(
        &self,
        conflict_id: i64,
        resolution: Resolution,
        retry: RetryPolicy,
    ) -> Result<ResolutionOutcome> {
        let conflict = self
            .store
            .get_conflict(conflict_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("conflict {conflict_id}")))?;
        if conflict.resolved {
            return Err(Error::InvalidInput(format!(
                "Conflict {conflict_id} is already resolved"
            )));
        }
        let Some(_claim) = self.sync.claims().try_claim(&conflict.item_id) else {
            return Err(Error::SyncInProgress);
        };
        let conflict = match resolution {
            Resolution::Skip => conflict,
            _ => self.with_server_side(conflict, retry).await?,
        };

        let name = resolution.as_str();
        let outcome = match resolution {
            Resolution::Skip => ResolutionOutcome::Skipped,
            Resolution::UseServer if conflict.server_data.is_none() => {
                tracing::warn!(
                    "Server copy of {} unknown; conflict {conflict_id} left open",
                    conflict.item_id
                );
                ResolutionOutcome::Skipped
            }
            Resolution::UseServer => {
                self.store.resolve_with_server(&conflict, name).await?;
                ResolutionOutcome::Resolved
            }
            Resolution::UseLocal => self.push_local(&conflict, name, retry).await?,
            Resolution::Merge(payload) => {
                self.write_merged(&conflict, payload).await?;
                self.push_local(&conflict, name, retry).await?
            }
        };
        tracing::info!("Conflict {conflict_id} on {}: {name} -> {outcome:?}", conflict.item_id);
        Ok(outcome)
    }

    /// Fill in the server side of a conflict recorded without one.
    async fn with_server_side(&self, conflict: Conflict, retry: RetryPolicy) -> Result<Conflict> {
        if conflict.server_data.is_some() {
            return Ok(conflict);
        }
        let record = self.record(&conflict).await?;
        let Some(remote) = self.sync.fetch_server_copy(&record, retry).await? else {
            return Ok(conflict);
        };
        let conflict_type = if remote.deleted {
            ConflictType::Delete
        } else {
            conflict.conflict_type
        };
        self.store
            .record_conflict(&conflict.item_id, Some(&remote), conflict_type)
            .await?;
        self.store
            .get_conflict(conflict.id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("conflict {}", conflict.id)))
    }

    async fn write_merged(&self, conflict: &Conflict, payload: Value) -> Result<()> {
        let record = self.record(conflict).await?;
        self.store
            .put(&record.item_type, payload, Some(&record.id))
            .await?;
        Ok(())
    }

    async fn record(&self, conflict: &Conflict) -> Result<Record> {
        self.store
            .get_including_deleted(&conflict.item_id)
            .await?
            .ok_or_else(|| Error::NotFound(conflict.item_id.to_string()))
    }

    /// Push the local side on top of the server version from the conflict.
    async fn push_local(
        &self,
        conflict: &Conflict,
        name: &str,
        retry: RetryPolicy,
    ) -> Result<ResolutionOutcome> {
        let record = self.record(conflict).await?;
        let base_version = conflict.base_version(record.server_version);

        if record.is_deleted && base_version.is_none() {
            // Deleted on both sides.
            self.store.rebase_on_server(conflict, name).await?;
            return Ok(ResolutionOutcome::Resolved);
        }

        match self.sync.push_record(&record, base_version, retry).await? {
            PushOutcome::Accepted { server_version } => {
                let completion = self
                    .store
                    .resolve_with_push(conflict, name, record.version, server_version)
                    .await?;
                Ok(match completion {
                    UploadCompletion::Synced | UploadCompletion::Purged => {
                        ResolutionOutcome::Resolved
                    }
                    UploadCompletion::Superseded => ResolutionOutcome::Requeued,
                })
            }
            PushOutcome::Conflict(server_data) => {
                let conflict_type = if record.is_deleted
                    || server_data.as_ref().is_some_and(|remote| remote.deleted)
                {
                    ConflictType::Delete
                } else {
                    conflict.conflict_type
                };
                self.store
                    .record_conflict(&record.id, server_data.as_ref(), conflict_type)
                    .await?;
                Ok(ResolutionOutcome::Reopened)
            }
            PushOutcome::Failed(error) => {
                tracing::warn!(
                    "Push of {} failed ({error}); queued for the next sync",
                    record.id
                );
                self.store.rebase_on_server(conflict, name).await?;
                Ok(ResolutionOutcome::Requeued)
            }
        }
    }
}
