//! Durable local store shared by the application and the sync engine.
//!
//! `LocalStore` is the only component that mutates records, queue entries,
//! conflicts, and metadata. Every multi-step mutation runs inside a single
//! libSQL transaction, so a crash leaves either the old or the new state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use libsql::{params, Transaction};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::db::{
    AttachmentRepository, ConflictRepository, Database, LibSqlAttachmentRepository,
    LibSqlConflictRepository, LibSqlMetadataRepository, LibSqlQueueRepository,
    LibSqlRecordRepository, MetadataRepository, QueueRepository, RecordQuery, RecordRepository,
    LAST_SYNC_KEY,
};
use crate::error::{Error, Result};
use crate::models::{
    payload_checksum, Attachment, AttachmentId, Conflict, ConflictType, DequeueFilter,
    DrainedEntry, QueueEntry, QueueOperation, Record, RecordId, RemoteRecord, SyncStatus,
};
use crate::util::{now_millis, sanitize_file_name, sha256_hex};

/// Snapshot of local storage usage and sync health.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStats {
    /// Live records
    pub total_items: u64,
    /// Records with unsynced local edits
    pub local_items: u64,
    /// Records matching the server
    pub synced_items: u64,
    /// Records whose last upload failed
    pub error_items: u64,
    /// Records blocked on a conflict
    pub conflict_items: u64,
    /// Payload plus attachment bytes
    pub storage_size: i64,
    /// Last sync watermark (Unix ms)
    pub last_sync: Option<i64>,
}

/// What happened to a record after its upload was acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadCompletion {
    /// Record is now `SYNCED` and its entry removed
    Synced,
    /// Record was written again mid-flight; it stays queued as `LOCAL`
    Superseded,
    /// Server confirmed the delete; the record was purged
    Purged,
}

/// Effect of applying one downloaded server record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteApplyOutcome {
    /// No local copy existed; stored as `SYNCED`
    Inserted,
    /// Clean local copy overwritten
    Updated,
    /// Nothing to do
    Unchanged,
    /// Clean local copy removed after a server delete
    Purged,
    /// Local copy busy or already pending upload on the same base
    Skipped,
    /// Dirty local copy already matched the server payload
    AutoResolved,
    /// Divergence recorded as the given conflict
    Conflict(i64),
}

/// Thread-safe handle to the durable local store.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
    attachments_dir: PathBuf,
}

impl LocalStore {
    /// Open the store at `db_path`, keeping attachment copies under `attachments_dir`.
    pub async fn open_path(
        db_path: impl Into<PathBuf>,
        attachments_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let attachments_dir = attachments_dir.into();
        std::fs::create_dir_all(&attachments_dir)?;

        let db = Database::open(&db_path).await?;
        tracing::info!("Opened local store at {}", db_path.display());
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
            attachments_dir,
        })
    }

    /// Open an in-memory store (primarily for tests).
    pub async fn open_in_memory(attachments_dir: impl Into<PathBuf>) -> Result<Self> {
        let attachments_dir = attachments_dir.into();
        std::fs::create_dir_all(&attachments_dir)?;
        let db = Database::open_in_memory().await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
            attachments_dir,
        })
    }

    /// Path of the database file, if on disk.
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Directory holding engine-owned attachment copies.
    pub fn attachments_dir(&self) -> &Path {
        &self.attachments_dir
    }

    // ------------------------------------------------------------------
    // Records
    // ------------------------------------------------------------------

    /// Store a payload, creating or updating a record and queueing its upload.
    pub async fn put(
        &self,
        item_type: &str,
        payload: Value,
        id: Option<&RecordId>,
    ) -> Result<RecordId> {
        self.put_with_priority(item_type, payload, id, 0).await
    }

    /// [`put`](Self::put) with an explicit queue priority.
    pub async fn put_with_priority(
        &self,
        item_type: &str,
        payload: Value,
        id: Option<&RecordId>,
        priority: i64,
    ) -> Result<RecordId> {
        let item_type = item_type.trim();
        if item_type.is_empty() {
            return Err(Error::InvalidInput("Record type cannot be empty".to_string()));
        }
        let checksum = payload_checksum(&payload)?;

        let db = self.db.lock().await;
        let tx = db.connection().transaction().await?;
        let result = Self::put_in_tx(&tx, item_type, payload, checksum, id, priority).await;
        finish(tx, result).await
    }

    async fn put_in_tx(
        tx: &Transaction,
        item_type: &str,
        payload: Value,
        checksum: String,
        id: Option<&RecordId>,
        priority: i64,
    ) -> Result<RecordId> {
        let records = LibSqlRecordRepository::new(tx);
        let queue = LibSqlQueueRepository::new(tx);
        let now = now_millis();

        let existing = match id {
            Some(id) => records.get(id, true).await?,
            None => None,
        };

        let Some(mut record) = existing else {
            let id = id
                .cloned()
                .unwrap_or_else(|| RecordId::generate(item_type));
            let record = Record {
                id: id.clone(),
                item_type: item_type.to_string(),
                payload,
                version: 1,
                server_version: None,
                checksum,
                sync_status: SyncStatus::Local,
                is_deleted: false,
                created_at: now,
                updated_at: now,
                last_synced_at: None,
            };
            records.insert(&record).await?;
            queue.enqueue(&id, QueueOperation::Upsert, priority).await?;
            tracing::debug!("Created record {id} ({item_type})");
            return Ok(id);
        };

        if record.item_type != item_type {
            return Err(Error::InvalidInput(format!(
                "Record {} has type '{}', not '{item_type}'",
                record.id, record.item_type
            )));
        }
        if !record.is_deleted && record.checksum == checksum {
            return Ok(record.id);
        }

        record.payload = payload;
        record.checksum = checksum;
        record.version += 1;
        record.updated_at = now;
        if record.is_deleted {
            record.is_deleted = false;
            queue
                .remove_operation(&record.id, QueueOperation::Delete)
                .await?;
        }

        if record.sync_status == SyncStatus::Conflict {
            // Resolution decides what to upload; refresh the local side only.
            records.update(&record).await?;
            let conflicts = LibSqlConflictRepository::new(tx);
            if let Some(open) = conflicts.open_for_item(&record.id).await? {
                conflicts.update_local_data(open.id, &record.payload).await?;
            }
        } else {
            // An in-flight upload keeps its claim; the acknowledgment sees the newer version.
            if record.sync_status != SyncStatus::Syncing {
                record.sync_status = SyncStatus::Local;
            }
            records.update(&record).await?;
            queue
                .enqueue(&record.id, QueueOperation::Upsert, priority)
                .await?;
        }
        tracing::debug!("Updated record {} to version {}", record.id, record.version);
        Ok(record.id)
    }

    /// Fetch a live record.
    pub async fn get(&self, id: &RecordId) -> Result<Option<Record>> {
        let db = self.db.lock().await;
        LibSqlRecordRepository::new(db.connection())
            .get(id, false)
            .await
    }

    /// Fetch a record including tombstones.
    pub async fn get_including_deleted(&self, id: &RecordId) -> Result<Option<Record>> {
        let db = self.db.lock().await;
        LibSqlRecordRepository::new(db.connection())
            .get(id, true)
            .await
    }

    /// List live records of a type.
    pub async fn query(&self, item_type: &str, query: &RecordQuery) -> Result<Vec<Record>> {
        let db = self.db.lock().await;
        LibSqlRecordRepository::new(db.connection())
            .query(item_type, query)
            .await
    }

    /// Delete a record.
    ///
    /// Records that never left the device are purged at once. Anything the
    /// server may hold, including a record whose create is in flight or
    /// failed mid-request, becomes a tombstone with a queued `DELETE`.
    /// Returns false if no live record has this id.
    pub async fn delete(&self, id: &RecordId) -> Result<bool> {
        let (deleted, purged_files) = {
            let db = self.db.lock().await;
            let tx = db.connection().transaction().await?;
            let result = Self::delete_in_tx(&tx, id).await;
            finish(tx, result).await?
        };
        self.remove_files(&purged_files, id).await;
        Ok(deleted)
    }

    async fn delete_in_tx(tx: &Transaction, id: &RecordId) -> Result<(bool, Vec<PathBuf>)> {
        let records = LibSqlRecordRepository::new(tx);
        let queue = LibSqlQueueRepository::new(tx);

        let Some(mut record) = records.get(id, false).await? else {
            return Ok((false, Vec::new()));
        };

        if record.server_version.is_none()
            && record.sync_status == SyncStatus::Local
            && !queue
                .find(id, QueueOperation::Upsert)
                .await?
                .is_some_and(|entry| entry.was_attempted())
        {
            let files = Self::purge_in_tx(tx, id).await?;
            tracing::debug!("Purged never-synced record {id}");
            return Ok((true, files));
        }

        record.is_deleted = true;
        record.version += 1;
        record.updated_at = now_millis();
        queue.remove_operation(id, QueueOperation::Upsert).await?;
        if record.sync_status == SyncStatus::Conflict {
            let conflicts = LibSqlConflictRepository::new(tx);
            if let Some(open) = conflicts.open_for_item(id).await? {
                conflicts.update_local_data(open.id, &Value::Null).await?;
            }
        } else {
            if record.sync_status != SyncStatus::Syncing {
                record.sync_status = SyncStatus::Local;
            }
            queue.enqueue(id, QueueOperation::Delete, 0).await?;
        }
        records.update(&record).await?;
        tracing::debug!("Tombstoned record {id}");
        Ok((true, Vec::new()))
    }

    /// Remove a record, its queue entries, and its attachment rows.
    ///
    /// Returns attachment file paths to delete once the transaction commits.
    async fn purge_in_tx(tx: &Transaction, id: &RecordId) -> Result<Vec<PathBuf>> {
        let attachments = LibSqlAttachmentRepository::new(tx);
        let files = attachments
            .list_for_item(id, false)
            .await?
            .into_iter()
            .map(|attachment| attachment.local_path)
            .collect();
        attachments.delete_for_item(id).await?;
        LibSqlQueueRepository::new(tx).remove_for_item(id).await?;
        LibSqlRecordRepository::new(tx).purge(id).await?;
        Ok(files)
    }

    async fn remove_files(&self, files: &[PathBuf], item_id: &RecordId) {
        for path in files {
            if let Err(error) = tokio::fs::remove_file(path).await {
                tracing::warn!("Failed to remove attachment {}: {error}", path.display());
            }
        }
        if !files.is_empty() {
            let dir = self.item_dir(item_id);
            tokio::fs::remove_dir(&dir).await.ok();
        }
    }

    /// Set a record's sync status.
    pub async fn update_sync_status(&self, id: &RecordId, status: SyncStatus) -> Result<()> {
        let db = self.db.lock().await;
        let updated = LibSqlRecordRepository::new(db.connection())
            .set_status(id, status)
            .await?;
        if updated {
            Ok(())
        } else {
            Err(Error::NotFound(id.to_string()))
        }
    }

    /// Ids of `SYNCED` records, optionally restricted to types.
    pub async fn synced_ids(&self, types: &[String]) -> Result<Vec<RecordId>> {
        let db = self.db.lock().await;
        LibSqlRecordRepository::new(db.connection())
            .synced_ids(types)
            .await
    }

    /// Storage and sync-health counters.
    pub async fn storage_stats(&self) -> Result<StorageStats> {
        let db = self.db.lock().await;
        let conn = db.connection();
        let records = LibSqlRecordRepository::new(conn);
        let counts = records.status_counts().await?;
        let payload_bytes = records.payload_bytes().await?;
        let attachment_bytes = LibSqlAttachmentRepository::new(conn).total_bytes().await?;
        let last_sync = LibSqlMetadataRepository::new(conn).last_sync().await?;

        Ok(StorageStats {
            total_items: counts.total,
            local_items: counts.local,
            synced_items: counts.synced,
            error_items: counts.error,
            conflict_items: counts.conflict,
            storage_size: payload_bytes + attachment_bytes,
            last_sync,
        })
    }

    // ------------------------------------------------------------------
    // Attachments
    // ------------------------------------------------------------------

    fn item_dir(&self, item_id: &RecordId) -> PathBuf {
        self.attachments_dir
            .join(sanitize_file_name(item_id.as_str()))
    }

    /// Copy bytes into engine-owned storage and attach them to a record.
    pub async fn store_attachment(
        &self,
        item_id: &RecordId,
        bytes: &[u8],
        file_name: &str,
        mime_type: &str,
    ) -> Result<AttachmentId> {
        if self.get(item_id).await?.is_none() {
            return Err(Error::NotFound(item_id.to_string()));
        }

        let dir = self.item_dir(item_id);
        tokio::fs::create_dir_all(&dir).await?;

        let size_bytes = i64::try_from(bytes.len())
            .map_err(|_| Error::InvalidInput("Attachment too large".to_string()))?;
        let mut attachment = Attachment::new(
            item_id.clone(),
            file_name,
            mime_type,
            size_bytes,
            PathBuf::new(),
            sha256_hex(bytes),
        )?;
        attachment.local_path = dir.join(format!(
            "{}-{}",
            attachment.id,
            sanitize_file_name(&attachment.file_name)
        ));
        tokio::fs::write(&attachment.local_path, bytes).await?;

        let inserted = {
            let db = self.db.lock().await;
            LibSqlAttachmentRepository::new(db.connection())
                .insert(&attachment)
                .await
        };
        if let Err(error) = inserted {
            tokio::fs::remove_file(&attachment.local_path).await.ok();
            return Err(error);
        }

        tracing::debug!(
            "Stored attachment {} ({} bytes) for {item_id}",
            attachment.id,
            attachment.size_bytes
        );
        Ok(attachment.id)
    }

    /// Read a caller's file and attach a copy of it to a record.
    pub async fn store_attachment_from_path(
        &self,
        item_id: &RecordId,
        source: &Path,
        file_name: Option<&str>,
        mime_type: &str,
    ) -> Result<AttachmentId> {
        let bytes = tokio::fs::read(source).await?;
        let file_name = file_name
            .map(str::to_string)
            .or_else(|| {
                source
                    .file_name()
                    .map(|name| name.to_string_lossy().to_string())
            })
            .unwrap_or_else(|| "file".to_string());
        self.store_attachment(item_id, &bytes, &file_name, mime_type)
            .await
    }

    /// All attachments of a record.
    pub async fn list_attachments(&self, item_id: &RecordId) -> Result<Vec<Attachment>> {
        let db = self.db.lock().await;
        LibSqlAttachmentRepository::new(db.connection())
            .list_for_item(item_id, false)
            .await
    }

    /// Attachments of a record not yet on the server.
    pub async fn pending_attachments(&self, item_id: &RecordId) -> Result<Vec<Attachment>> {
        let db = self.db.lock().await;
        LibSqlAttachmentRepository::new(db.connection())
            .list_for_item(item_id, true)
            .await
    }

    /// Flag an attachment as uploaded.
    pub async fn mark_attachment_uploaded(&self, attachment: &Attachment) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlAttachmentRepository::new(db.connection())
            .mark_uploaded(attachment)
            .await
    }

    // ------------------------------------------------------------------
    // Sync queue
    // ------------------------------------------------------------------

    /// Queue a remote operation; idempotent per `(item_id, operation)`.
    pub async fn enqueue(
        &self,
        item_id: &RecordId,
        operation: QueueOperation,
        priority: i64,
    ) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlQueueRepository::new(db.connection())
            .enqueue(item_id, operation, priority)
            .await
    }

    /// Next entries to dispatch, joined with each record's current state.
    pub async fn dequeue_batch(
        &self,
        limit: usize,
        filter: &DequeueFilter,
    ) -> Result<Vec<DrainedEntry>> {
        let db = self.db.lock().await;
        let conn = db.connection();
        let entries = LibSqlQueueRepository::new(conn).list(limit, filter).await?;
        let records = LibSqlRecordRepository::new(conn);

        let mut drained = Vec::with_capacity(entries.len());
        for entry in entries {
            let record = records.get(&entry.item_id, true).await?;
            drained.push(DrainedEntry { entry, record });
        }
        Ok(drained)
    }

    /// Number of queued entries matching `filter`.
    pub async fn pending_count(&self, filter: &DequeueFilter) -> Result<u64> {
        let db = self.db.lock().await;
        LibSqlQueueRepository::new(db.connection())
            .count(filter)
            .await
    }

    /// Remove a queue entry after its remote operation succeeded.
    pub async fn remove_entry(&self, queue_id: i64) -> Result<bool> {
        let db = self.db.lock().await;
        LibSqlQueueRepository::new(db.connection())
            .remove(queue_id)
            .await
    }

    /// Count a failed attempt on a queue entry.
    pub async fn record_failure(&self, queue_id: i64, error: &str) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlQueueRepository::new(db.connection())
            .record_failure(queue_id, error)
            .await
    }

    // ------------------------------------------------------------------
    // Upload bookkeeping
    // ------------------------------------------------------------------

    /// Claim a record for upload by moving it to `SYNCING`.
    ///
    /// Fails when another dispatch already holds it or it is conflicted.
    pub async fn begin_upload(&self, id: &RecordId) -> Result<bool> {
        let db = self.db.lock().await;
        LibSqlRecordRepository::new(db.connection())
            .try_mark_syncing(id)
            .await
    }

    /// Return a claimed record to `LOCAL` without recording an outcome.
    pub async fn release_upload(&self, id: &RecordId) -> Result<()> {
        let db = self.db.lock().await;
        db.connection()
            .execute(
                "UPDATE records SET sync_status = 'LOCAL' WHERE id = ? AND sync_status = 'SYNCING'",
                params![id.as_str()],
            )
            .await?;
        Ok(())
    }

    /// Apply a server acknowledgment for `entry`.
    ///
    /// `uploaded_version` is the local version that was sent; if the record
    /// changed since, it stays queued so the newer payload goes out next.
    pub async fn complete_upload(
        &self,
        entry: &QueueEntry,
        uploaded_version: i64,
        server_version: i64,
    ) -> Result<UploadCompletion> {
        let (completion, files) = {
            let db = self.db.lock().await;
            let tx = db.connection().transaction().await?;
            let result =
                Self::complete_upload_in_tx(&tx, entry, uploaded_version, server_version).await;
            finish(tx, result).await?
        };
        self.remove_files(&files, &entry.item_id).await;
        Ok(completion)
    }

    async fn complete_upload_in_tx(
        tx: &Transaction,
        entry: &QueueEntry,
        uploaded_version: i64,
        server_version: i64,
    ) -> Result<(UploadCompletion, Vec<PathBuf>)> {
        let records = LibSqlRecordRepository::new(tx);
        let queue = LibSqlQueueRepository::new(tx);

        if entry.operation == QueueOperation::Delete {
            let files = Self::purge_in_tx(tx, &entry.item_id).await?;
            return Ok((UploadCompletion::Purged, files));
        }

        let Some(mut record) = records.get(&entry.item_id, true).await? else {
            queue.remove(entry.id).await?;
            return Ok((UploadCompletion::Purged, Vec::new()));
        };

        record.server_version = Some(server_version);
        let completion = if record.version == uploaded_version && !record.is_deleted {
            record.sync_status = SyncStatus::Synced;
            record.last_synced_at = Some(now_millis());
            queue.remove(entry.id).await?;
            UploadCompletion::Synced
        } else {
            if record.sync_status == SyncStatus::Syncing {
                record.sync_status = SyncStatus::Local;
            }
            if record.is_deleted {
                // The create landed after a local delete; the server now needs the delete.
                queue
                    .enqueue(&record.id, QueueOperation::Delete, entry.priority)
                    .await?;
            }
            UploadCompletion::Superseded
        };
        records.update(&record).await?;
        Ok((completion, Vec::new()))
    }

    /// Record a failed upload: bump the entry's retry count and mark the record `ERROR`.
    pub async fn fail_upload(&self, entry: &QueueEntry, error: &str) -> Result<()> {
        let db = self.db.lock().await;
        let tx = db.connection().transaction().await?;
        let result: Result<()> = async {
            LibSqlQueueRepository::new(&tx)
                .record_failure(entry.id, error)
                .await?;
            tx.execute(
                "UPDATE records SET sync_status = 'ERROR' WHERE id = ? AND sync_status = 'SYNCING'",
                params![entry.item_id.as_str()],
            )
            .await?;
            Ok(())
        }
        .await;
        finish(tx, result).await
    }

    /// Record a divergence for an item and block it at `CONFLICT`.
    ///
    /// The local side is the record as stored now, so writes made while a
    /// push was in flight are kept. Pending queue entries for the item are
    /// dropped; resolution re-creates them. An already-open conflict is
    /// refreshed instead of duplicated, keeping its last known server copy
    /// when `server_data` is `None`.
    pub async fn record_conflict(
        &self,
        item_id: &RecordId,
        server_data: Option<&RemoteRecord>,
        conflict_type: ConflictType,
    ) -> Result<i64> {
        let db = self.db.lock().await;
        let tx = db.connection().transaction().await?;
        let result = Self::record_conflict_in_tx(&tx, item_id, server_data, conflict_type).await;
        finish(tx, result).await
    }

    async fn record_conflict_in_tx(
        tx: &Transaction,
        item_id: &RecordId,
        server_data: Option<&RemoteRecord>,
        conflict_type: ConflictType,
    ) -> Result<i64> {
        let (local_data, conflict_type) = match LibSqlRecordRepository::new(tx)
            .get(item_id, true)
            .await?
        {
            Some(record) if !record.is_deleted => (record.payload, conflict_type),
            _ => (Value::Null, ConflictType::Delete),
        };

        let conflicts = LibSqlConflictRepository::new(tx);
        let conflict_id = if let Some(open) = conflicts.open_for_item(item_id).await? {
            conflicts.update_local_data(open.id, &local_data).await?;
            if server_data.is_some() {
                conflicts.update_server_data(open.id, server_data).await?;
            }
            open.id
        } else {
            conflicts
                .insert(item_id, &local_data, server_data, conflict_type)
                .await?
        };
        LibSqlQueueRepository::new(tx)
            .remove_for_item(item_id)
            .await?;
        LibSqlRecordRepository::new(tx)
            .set_status(item_id, SyncStatus::Conflict)
            .await?;
        tracing::info!("Conflict {conflict_id} recorded for {item_id} ({conflict_type})");
        Ok(conflict_id)
    }

    // ------------------------------------------------------------------
    // Download
    // ------------------------------------------------------------------

    /// Apply one server-side change, raising a conflict instead of
    /// overwriting unsynced local edits.
    pub async fn apply_remote_change(
        &self,
        item_type: &str,
        remote: &RemoteRecord,
    ) -> Result<RemoteApplyOutcome> {
        let remote_checksum = remote.checksum()?;
        let (outcome, files) = {
            let db = self.db.lock().await;
            let tx = db.connection().transaction().await?;
            let result = Self::apply_remote_in_tx(&tx, item_type, remote, remote_checksum).await;
            finish(tx, result).await?
        };
        self.remove_files(&files, &remote.id).await;
        Ok(outcome)
    }

    async fn apply_remote_in_tx(
        tx: &Transaction,
        item_type: &str,
        remote: &RemoteRecord,
        remote_checksum: String,
    ) -> Result<(RemoteApplyOutcome, Vec<PathBuf>)> {
        let records = LibSqlRecordRepository::new(tx);
        let queue = LibSqlQueueRepository::new(tx);
        let now = now_millis();

        let Some(mut local) = records.get(&remote.id, true).await? else {
            if remote.deleted {
                return Ok((RemoteApplyOutcome::Unchanged, Vec::new()));
            }
            records
                .insert(&Record {
                    id: remote.id.clone(),
                    item_type: item_type.to_string(),
                    payload: remote.payload.clone(),
                    version: remote.version.max(1),
                    server_version: Some(remote.version),
                    checksum: remote_checksum,
                    sync_status: SyncStatus::Synced,
                    is_deleted: false,
                    created_at: now,
                    updated_at: now,
                    last_synced_at: Some(now),
                })
                .await?;
            return Ok((RemoteApplyOutcome::Inserted, Vec::new()));
        };

        match local.sync_status {
            SyncStatus::Syncing => return Ok((RemoteApplyOutcome::Skipped, Vec::new())),
            SyncStatus::Conflict => {
                let conflicts = LibSqlConflictRepository::new(tx);
                if let Some(open) = conflicts.open_for_item(&local.id).await? {
                    conflicts.update_server_data(open.id, Some(remote)).await?;
                    return Ok((RemoteApplyOutcome::Conflict(open.id), Vec::new()));
                }
                return Ok((RemoteApplyOutcome::Skipped, Vec::new()));
            }
            _ => {}
        }

        let dirty = local.is_dirty() || queue.has_pending(&local.id).await?;

        if !dirty {
            if remote.deleted {
                let files = Self::purge_in_tx(tx, &local.id).await?;
                return Ok((RemoteApplyOutcome::Purged, files));
            }
            if local.server_version == Some(remote.version) && local.checksum == remote_checksum {
                return Ok((RemoteApplyOutcome::Unchanged, Vec::new()));
            }
            if local.checksum != remote_checksum {
                local.version = (local.version + 1).max(remote.version);
            }
            local.payload = remote.payload.clone();
            local.checksum = remote_checksum;
            local.server_version = Some(remote.version);
            local.updated_at = now;
            local.last_synced_at = Some(now);
            records.update(&local).await?;
            return Ok((RemoteApplyOutcome::Updated, Vec::new()));
        }

        if local.server_version == Some(remote.version) {
            // Server unchanged since our base; the queued upload will carry our edit.
            return Ok((RemoteApplyOutcome::Skipped, Vec::new()));
        }

        if !remote.deleted && !local.is_deleted && local.checksum == remote_checksum {
            local.server_version = Some(remote.version);
            local.sync_status = SyncStatus::Synced;
            local.last_synced_at = Some(now);
            records.update(&local).await?;
            queue.remove_for_item(&local.id).await?;
            return Ok((RemoteApplyOutcome::AutoResolved, Vec::new()));
        }

        let conflict_type = if remote.deleted || local.is_deleted {
            ConflictType::Delete
        } else {
            ConflictType::Update
        };
        let conflict_id =
            Self::record_conflict_in_tx(tx, &local.id, Some(remote), conflict_type).await?;
        Ok((RemoteApplyOutcome::Conflict(conflict_id), Vec::new()))
    }

    // ------------------------------------------------------------------
    // Conflicts
    // ------------------------------------------------------------------

    /// Fetch a conflict by id.
    pub async fn get_conflict(&self, conflict_id: i64) -> Result<Option<Conflict>> {
        let db = self.db.lock().await;
        LibSqlConflictRepository::new(db.connection())
            .get(conflict_id)
            .await
    }

    /// Conflicts, newest first.
    pub async fn list_conflicts(&self, include_resolved: bool, limit: usize) -> Result<Vec<Conflict>> {
        let db = self.db.lock().await;
        LibSqlConflictRepository::new(db.connection())
            .list(include_resolved, limit)
            .await
    }

    /// Number of unresolved conflicts.
    pub async fn open_conflict_count(&self) -> Result<u64> {
        let db = self.db.lock().await;
        LibSqlConflictRepository::new(db.connection())
            .open_count()
            .await
    }

    /// Adopt the server side of a conflict and close it.
    pub async fn resolve_with_server(&self, conflict: &Conflict, resolution: &str) -> Result<()> {
        let files = {
            let db = self.db.lock().await;
            let tx = db.connection().transaction().await?;
            let result = Self::resolve_with_server_in_tx(&tx, conflict, resolution).await;
            finish(tx, result).await?
        };
        self.remove_files(&files, &conflict.item_id).await;
        Ok(())
    }

    async fn resolve_with_server_in_tx(
        tx: &Transaction,
        conflict: &Conflict,
        resolution: &str,
    ) -> Result<Vec<PathBuf>> {
        let conflicts = LibSqlConflictRepository::new(tx);
        let records = LibSqlRecordRepository::new(tx);

        let remote = match &conflict.server_data {
            Some(remote) if !remote.deleted => remote,
            Some(_) => {
                let files = Self::purge_in_tx(tx, &conflict.item_id).await?;
                conflicts.mark_resolved(conflict.id, resolution, None).await?;
                return Ok(files);
            }
            None => {
                return Err(Error::InvalidInput(format!(
                    "Server copy of {} is unknown; conflict {} stays open",
                    conflict.item_id, conflict.id
                )));
            }
        };

        let checksum = remote.checksum()?;
        let now = now_millis();
        if let Some(mut record) = records.get(&conflict.item_id, true).await? {
            record.version = (record.version + 1).max(remote.version);
            record.payload = remote.payload.clone();
            record.checksum = checksum;
            record.server_version = Some(remote.version);
            record.sync_status = SyncStatus::Synced;
            record.is_deleted = false;
            record.updated_at = now;
            record.last_synced_at = Some(now);
            records.update(&record).await?;
        }
        LibSqlQueueRepository::new(tx)
            .remove_for_item(&conflict.item_id)
            .await?;
        conflicts
            .mark_resolved(conflict.id, resolution, Some(&remote.payload))
            .await?;
        Ok(Vec::new())
    }

    /// Close a conflict whose local side the server accepted.
    ///
    /// `uploaded_version` is the version that was pushed; a write made while
    /// the push was in flight leaves the record `LOCAL` and queued.
    pub async fn resolve_with_push(
        &self,
        conflict: &Conflict,
        resolution: &str,
        uploaded_version: i64,
        server_version: i64,
    ) -> Result<UploadCompletion> {
        let (completion, files) = {
            let db = self.db.lock().await;
            let tx = db.connection().transaction().await?;
            let result = Self::resolve_with_push_in_tx(
                &tx,
                conflict,
                resolution,
                uploaded_version,
                server_version,
            )
            .await;
            finish(tx, result).await?
        };
        self.remove_files(&files, &conflict.item_id).await;
        Ok(completion)
    }

    async fn resolve_with_push_in_tx(
        tx: &Transaction,
        conflict: &Conflict,
        resolution: &str,
        uploaded_version: i64,
        server_version: i64,
    ) -> Result<(UploadCompletion, Vec<PathBuf>)> {
        let records = LibSqlRecordRepository::new(tx);
        let queue = LibSqlQueueRepository::new(tx);
        let conflicts = LibSqlConflictRepository::new(tx);

        let Some(mut record) = records.get(&conflict.item_id, true).await? else {
            conflicts.mark_resolved(conflict.id, resolution, None).await?;
            return Ok((UploadCompletion::Purged, Vec::new()));
        };

        if record.is_deleted {
            let files = Self::purge_in_tx(tx, &record.id).await?;
            conflicts.mark_resolved(conflict.id, resolution, None).await?;
            return Ok((UploadCompletion::Purged, files));
        }

        queue.remove_for_item(&record.id).await?;
        record.server_version = Some(server_version);
        let completion = if record.version == uploaded_version {
            record.sync_status = SyncStatus::Synced;
            record.last_synced_at = Some(now_millis());
            UploadCompletion::Synced
        } else {
            record.sync_status = SyncStatus::Local;
            queue.enqueue(&record.id, QueueOperation::Upsert, 1).await?;
            UploadCompletion::Superseded
        };
        records.update(&record).await?;
        conflicts
            .mark_resolved(conflict.id, resolution, Some(&record.payload))
            .await?;
        Ok((completion, Vec::new()))
    }

    /// Close a conflict in favour of local data and queue it for upload.
    ///
    /// The record is re-based on the server version from the conflict, so
    /// the queued upload is an update against what the server holds now.
    pub async fn rebase_on_server(&self, conflict: &Conflict, resolution: &str) -> Result<Record> {
        let db = self.db.lock().await;
        let tx = db.connection().transaction().await?;
        let result = Self::rebase_in_tx(&tx, conflict, resolution).await;
        finish(tx, result).await
    }

    async fn rebase_in_tx(
        tx: &Transaction,
        conflict: &Conflict,
        resolution: &str,
    ) -> Result<Record> {
        let records = LibSqlRecordRepository::new(tx);
        let queue = LibSqlQueueRepository::new(tx);

        let mut record = records
            .get(&conflict.item_id, true)
            .await?
            .ok_or_else(|| Error::NotFound(conflict.item_id.to_string()))?;

        record.server_version = conflict.base_version(record.server_version);
        record.sync_status = SyncStatus::Local;
        records.update(&record).await?;

        queue.remove_for_item(&record.id).await?;
        if record.is_deleted {
            if record.server_version.is_some() {
                queue.enqueue(&record.id, QueueOperation::Delete, 1).await?;
            } else {
                // Both sides deleted it; nothing left to tell the server.
                Self::purge_in_tx(tx, &record.id).await?;
            }
        } else {
            queue.enqueue(&record.id, QueueOperation::Upsert, 1).await?;
        }

        let resolution_data = (!record.is_deleted).then(|| record.payload.clone());
        LibSqlConflictRepository::new(tx)
            .mark_resolved(conflict.id, resolution, resolution_data.as_ref())
            .await?;
        Ok(record)
    }

    // ------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------

    /// Read a metadata value.
    pub async fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let db = self.db.lock().await;
        LibSqlMetadataRepository::new(db.connection()).get(key).await
    }

    /// Write a metadata value.
    pub async fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlMetadataRepository::new(db.connection())
            .set(key, value)
            .await
    }

    /// Watermark of the last completed sync (Unix ms).
    pub async fn last_sync(&self) -> Result<Option<i64>> {
        let db = self.db.lock().await;
        LibSqlMetadataRepository::new(db.connection())
            .last_sync()
            .await
    }

    /// Persist the sync watermark.
    pub async fn set_last_sync(&self, millis: i64) -> Result<()> {
        self.set_metadata(LAST_SYNC_KEY, &millis.to_string()).await
    }
}

/// Commit on success, roll back on failure.
async fn finish<T>(tx: Transaction, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(error) => {
            if let Err(rollback_error) = tx.rollback().await {
                tracing::warn!("Rollback failed after {error}: {rollback_error}");
            }
            Err(error)
        }
    }
}
