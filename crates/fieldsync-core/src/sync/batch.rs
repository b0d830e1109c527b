//! Network exchange for queued uploads and incremental downloads.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::api::{ApiResponse, EndpointMap, Method, RemoteApi};
use super::cancel::CancellationToken;
use super::claims::ClaimSet;
use super::retry::RetryPolicy;
use crate::error::{Error, Result};
use crate::models::{
    Attachment, ConflictType, DequeueFilter, DrainedEntry, QueueOperation, Record, RecordId,
    RemoteRecord,
};
use crate::services::{LocalStore, RemoteApplyOutcome, UploadCompletion};

/// Upload chunking and retry settings of one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadSettings {
    pub batch_size: usize,
    pub retry: RetryPolicy,
}

/// Totals of an upload pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub synced: u64,
    pub failed: u64,
    /// Ids of conflicts raised
    pub conflicts: Vec<i64>,
    pub errors: Vec<String>,
    pub cancelled: bool,
}

/// Totals of a download pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadReport {
    /// Server records written locally
    pub applied: u64,
    /// Ids of conflicts raised or refreshed
    pub conflicts: Vec<i64>,
    pub errors: Vec<String>,
    pub cancelled: bool,
}

/// Result of pushing one record to the server.
#[derive(Debug)]
pub enum PushOutcome {
    Accepted { server_version: i64 },
    Conflict(Option<RemoteRecord>),
    /// Attempts exhausted or the server refused for good
    Failed(Error),
}

#[derive(Debug)]
enum ItemOutcome {
    Synced { attachment_errors: Vec<String> },
    Superseded,
    Busy,
    Conflict(i64),
    Failed(String),
}

/// Drives uploads of queue entries and downloads of server changes.
///
/// Items are handled one at a time; all state changes go through
/// [`LocalStore`].
#[derive(Clone)]
pub struct BatchSynchronizer {
    store: LocalStore,
    api: Arc<dyn RemoteApi>,
    endpoints: Arc<dyn EndpointMap>,
    claims: ClaimSet,
    request_timeout: Duration,
}

impl BatchSynchronizer {
    pub fn new(
        store: LocalStore,
        api: Arc<dyn RemoteApi>,
        endpoints: Arc<dyn EndpointMap>,
        claims: ClaimSet,
        request_timeout: Duration,
    ) -> Self {
        Self {
            store,
            api,
            endpoints,
            claims,
            request_timeout,
        }
    }

    pub const fn claims(&self) -> &ClaimSet {
        &self.claims
    }

    /// Upload every queued entry matching `filter`, in chunks.
    ///
    /// Per-item failures are accumulated; auth and local storage failures
    /// abort the pass.
    pub async fn upload(
        &self,
        mut filter: DequeueFilter,
        settings: UploadSettings,
        cancel: &CancellationToken,
        on_progress: &mut (dyn FnMut(u64, u64) + Send),
    ) -> Result<UploadReport> {
        let mut report = UploadReport::default();
        let total = self.store.pending_count(&filter).await?;
        let mut processed = 0;
        on_progress(processed, total);

        'chunks: loop {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let chunk = self
                .store
                .dequeue_batch(settings.batch_size.max(1), &filter)
                .await?;
            if chunk.is_empty() {
                break;
            }
            tracing::debug!("Uploading chunk of {} entries", chunk.len());

            for drained in chunk {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    break 'chunks;
                }
                filter.after = Some(drained.entry.cursor());
                let item_id = drained.entry.item_id.clone();

                match self.upload_item(drained, settings.retry).await {
                    Ok(ItemOutcome::Synced { attachment_errors }) => {
                        report.synced += 1;
                        report.errors.extend(attachment_errors);
                    }
                    Ok(ItemOutcome::Superseded | ItemOutcome::Busy) => {}
                    Ok(ItemOutcome::Conflict(conflict_id)) => report.conflicts.push(conflict_id),
                    Ok(ItemOutcome::Failed(message)) => {
                        report.failed += 1;
                        report.errors.push(format!("{item_id}: {message}"));
                    }
                    Err(error) if error.is_run_fatal() => return Err(error),
                    Err(error) => {
                        tracing::warn!("Upload of {item_id} failed: {error}");
                        report.failed += 1;
                        report.errors.push(format!("{item_id}: {error}"));
                    }
                }
                processed += 1;
                on_progress(processed, total.max(processed));
            }
        }

        tracing::info!(
            "Upload pass: {} synced, {} failed, {} conflicts",
            report.synced,
            report.failed,
            report.conflicts.len()
        );
        Ok(report)
    }

    async fn upload_item(&self, drained: DrainedEntry, retry: RetryPolicy) -> Result<ItemOutcome> {
        let DrainedEntry { entry, record } = drained;
        let Some(record) = record else {
            self.store.remove_entry(entry.id).await?;
            return Ok(ItemOutcome::Superseded);
        };

        let Some(_claim) = self.claims.try_claim(&record.id) else {
            tracing::debug!("Skipping {}: already being synced", record.id);
            return Ok(ItemOutcome::Busy);
        };
        if !self.store.begin_upload(&record.id).await? {
            return Ok(ItemOutcome::Busy);
        }

        let Some(base_path) = self.endpoints.base_path(&record.item_type) else {
            let message = format!("No endpoint for type '{}'", record.item_type);
            self.store.fail_upload(&entry, &message).await?;
            return Ok(ItemOutcome::Failed(message));
        };

        let outcome = match self
            .push(&record, entry.operation, record.server_version, &base_path, retry)
            .await
        {
            Ok(outcome) => outcome,
            Err(error) => {
                self.store.release_upload(&record.id).await?;
                return Err(error);
            }
        };

        match outcome {
            PushOutcome::Accepted { server_version } => {
                let completion = self
                    .store
                    .complete_upload(&entry, record.version, server_version)
                    .await?;
                match completion {
                    UploadCompletion::Synced => {
                        let attachment_errors = self.upload_attachments(&record, &base_path).await;
                        Ok(ItemOutcome::Synced { attachment_errors })
                    }
                    UploadCompletion::Purged => Ok(ItemOutcome::Synced {
                        attachment_errors: Vec::new(),
                    }),
                    UploadCompletion::Superseded => Ok(ItemOutcome::Superseded),
                }
            }
            PushOutcome::Conflict(server_data) => {
                let conflict_type = if entry.operation == QueueOperation::Delete
                    || server_data.as_ref().is_some_and(|remote| remote.deleted)
                {
                    ConflictType::Delete
                } else if record.server_version.is_none() {
                    ConflictType::Create
                } else {
                    ConflictType::Update
                };
                let conflict_id = self
                    .store
                    .record_conflict(&record.id, server_data.as_ref(), conflict_type)
                    .await?;
                Ok(ItemOutcome::Conflict(conflict_id))
            }
            PushOutcome::Failed(error) => {
                let message = error.to_string();
                tracing::warn!("Giving up on {} for this pass: {message}", record.id);
                self.store.fail_upload(&entry, &message).await?;
                Ok(ItemOutcome::Failed(message))
            }
        }
    }

    /// Push a record's current state against `base_version`.
    ///
    /// Tombstones are sent as deletes. Used when a conflict is resolved in
    /// favour of local data.
    pub(crate) async fn push_record(
        &self,
        record: &Record,
        base_version: Option<i64>,
        retry: RetryPolicy,
    ) -> Result<PushOutcome> {
        let base_path = self.endpoints.base_path(&record.item_type).ok_or_else(|| {
            Error::InvalidInput(format!("No endpoint for type '{}'", record.item_type))
        })?;
        let operation = if record.is_deleted {
            QueueOperation::Delete
        } else {
            QueueOperation::Upsert
        };
        self.push(record, operation, base_version, &base_path, retry)
            .await
    }

    /// Push one record against `base_version`, retrying transient failures.
    ///
    /// Returns `Err` only for failures that must abort the whole run.
    async fn push(
        &self,
        record: &Record,
        operation: QueueOperation,
        base_version: Option<i64>,
        base_path: &str,
        retry: RetryPolicy,
    ) -> Result<PushOutcome> {
        let base_path = base_path.trim_end_matches('/');
        let encoded_id = urlencoding::encode(record.id.as_str());
        let (method, path, body) = match (operation, base_version) {
            (QueueOperation::Delete, Some(version)) => (
                Method::Delete,
                format!("{base_path}/{encoded_id}?baseVersion={version}"),
                None,
            ),
            // A create that may have landed; delete whatever the server holds.
            (QueueOperation::Delete, None) => {
                (Method::Delete, format!("{base_path}/{encoded_id}"), None)
            }
            (QueueOperation::Upsert, Some(version)) => (
                Method::Put,
                format!("{base_path}/{encoded_id}?baseVersion={version}"),
                Some(&record.payload),
            ),
            (QueueOperation::Upsert, None) => (
                Method::Post,
                format!("{base_path}?clientId={encoded_id}"),
                Some(&record.payload),
            ),
        };

        match self.request_with_retry(method, &path, body, retry).await {
            Ok(response) if response.conflict => {
                tracing::info!("Server reported a conflict for {}", record.id);
                let server_data = match response.remote_record(&record.id) {
                    Some(remote) => Some(remote),
                    None => self.fetch_remote(base_path, &record.id, retry).await?,
                };
                Ok(PushOutcome::Conflict(server_data))
            }
            Ok(response) if response.success => Ok(PushOutcome::Accepted {
                server_version: response
                    .server_version
                    .unwrap_or_else(|| base_version.map_or(1, |version| version + 1)),
            }),
            // Already gone on the server.
            Ok(_) => Ok(PushOutcome::Accepted {
                server_version: base_version.unwrap_or_default(),
            }),
            Err(error @ Error::Auth(_)) => Err(error),
            Err(error) => Ok(PushOutcome::Failed(error)),
        }
    }

    /// Fetch the server's current copy of a record.
    ///
    /// `None` when the type has no endpoint or the copy could not be read.
    pub(crate) async fn fetch_server_copy(
        &self,
        record: &Record,
        retry: RetryPolicy,
    ) -> Result<Option<RemoteRecord>> {
        match self.endpoints.base_path(&record.item_type) {
            Some(base_path) => {
                self.fetch_remote(base_path.trim_end_matches('/'), &record.id, retry)
                    .await
            }
            None => Ok(None),
        }
    }

    async fn fetch_remote(
        &self,
        base_path: &str,
        id: &RecordId,
        retry: RetryPolicy,
    ) -> Result<Option<RemoteRecord>> {
        let path = format!("{base_path}/{}", urlencoding::encode(id.as_str()));
        match self.request_with_retry(Method::Get, &path, None, retry).await {
            Ok(response) => Ok(match response.data {
                Some(Value::Object(mut body)) => {
                    body.insert("id".to_string(), Value::from(id.as_str()));
                    serde_json::from_value::<RemoteRecord>(Value::Object(body)).ok()
                }
                _ => None,
            }),
            Err(error @ Error::Auth(_)) => Err(error),
            Err(error) => {
                tracing::warn!("Could not read server copy of {id}: {error}");
                Ok(None)
            }
        }
    }

    /// Send a request under the timeout, retrying transient failures.
    ///
    /// Returns successes, conflicts, and 404/410 on deletes; every other
    /// outcome becomes an error.
    async fn request_with_retry(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        retry: RetryPolicy,
    ) -> Result<ApiResponse> {
        let mut attempt = 0;
        loop {
            let result =
                match tokio::time::timeout(self.request_timeout, self.api.request(method, path, body))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout),
                };

            let error = match result {
                Ok(response)
                    if response.success
                        || response.conflict
                        || (method == Method::Delete
                            && matches!(response.status, Some(404 | 410))) =>
                {
                    return Ok(response);
                }
                Ok(response) => response.failure_error(),
                Err(Error::Conflict { .. }) => {
                    return Ok(ApiResponse {
                        conflict: true,
                        status: Some(409),
                        ..ApiResponse::default()
                    });
                }
                Err(error) => error,
            };

            attempt += 1;
            if !error.is_retryable() || !retry.should_retry(attempt) {
                return Err(error);
            }
            let delay = retry.delay_for_attempt(attempt - 1);
            tracing::debug!("{method} {path} failed ({error}), retrying in {delay:?}");
            tokio::time::sleep(delay).await;
        }
    }

    async fn upload_attachments(&self, record: &Record, base_path: &str) -> Vec<String> {
        let pending = match self.store.pending_attachments(&record.id).await {
            Ok(pending) => pending,
            Err(error) => return vec![format!("{}: {error}", record.id)],
        };

        let mut errors = Vec::new();
        for attachment in pending {
            if let Err(error) = self.upload_attachment(&attachment, base_path).await {
                tracing::warn!("Attachment {} of {} not uploaded: {error}", attachment.id, record.id);
                errors.push(format!("{} attachment {}: {error}", record.id, attachment.file_name));
            }
        }
        errors
    }

    async fn upload_attachment(&self, attachment: &Attachment, base_path: &str) -> Result<()> {
        let bytes = tokio::fs::read(&attachment.local_path).await?;
        let path = format!(
            "{}/{}/attachments",
            base_path.trim_end_matches('/'),
            urlencoding::encode(attachment.item_id.as_str())
        );
        let upload = self
            .api
            .upload_file(&path, &attachment.file_name, &attachment.mime_type, bytes);
        let response = match tokio::time::timeout(self.request_timeout, upload).await {
            Ok(result) => result?,
            Err(_) => return Err(Error::Timeout),
        };
        if !response.success {
            return Err(response.failure_error());
        }
        self.store.mark_attachment_uploaded(attachment).await
    }

    /// Pull server changes newer than `since` for each type.
    pub async fn download(
        &self,
        types: &[String],
        since: i64,
        retry: RetryPolicy,
        cancel: &CancellationToken,
        on_progress: &mut (dyn FnMut(u64, u64) + Send),
    ) -> Result<DownloadReport> {
        let mut report = DownloadReport::default();
        let total = types.len() as u64;
        on_progress(0, total);

        for (index, item_type) in types.iter().enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            match self.download_type(item_type, since, retry, cancel, &mut report).await {
                Ok(()) => {}
                Err(error) if error.is_run_fatal() => return Err(error),
                Err(error) => {
                    tracing::warn!("Download of '{item_type}' failed: {error}");
                    report.errors.push(format!("{item_type}: {error}"));
                }
            }
            on_progress(index as u64 + 1, total);
        }

        tracing::info!(
            "Download pass: {} applied, {} conflicts, {} errors",
            report.applied,
            report.conflicts.len(),
            report.errors.len()
        );
        Ok(report)
    }

    async fn download_type(
        &self,
        item_type: &str,
        since: i64,
        retry: RetryPolicy,
        cancel: &CancellationToken,
        report: &mut DownloadReport,
    ) -> Result<()> {
        let path = self
            .endpoints
            .changes_path(item_type, since)
            .ok_or_else(|| Error::InvalidInput(format!("No endpoint for type '{item_type}'")))?;
        let response = self
            .request_with_retry(Method::Get, &path, None, retry)
            .await?;

        let records = match response.data {
            Some(Value::Array(records)) => records,
            Some(Value::Object(mut body)) => match body.remove("data") {
                Some(Value::Array(records)) => records,
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };
        tracing::debug!("{} change(s) for '{item_type}' since {since}", records.len());

        for value in records {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let remote: RemoteRecord = match serde_json::from_value(value) {
                Ok(remote) => remote,
                Err(error) => {
                    report.errors.push(format!("{item_type}: malformed record: {error}"));
                    continue;
                }
            };
            if self.claims.is_claimed(&remote.id) {
                continue;
            }
            match self.store.apply_remote_change(item_type, &remote).await {
                Ok(
                    RemoteApplyOutcome::Inserted
                    | RemoteApplyOutcome::Updated
                    | RemoteApplyOutcome::Purged
                    | RemoteApplyOutcome::AutoResolved,
                ) => report.applied += 1,
                Ok(RemoteApplyOutcome::Conflict(conflict_id)) => {
                    if !report.conflicts.contains(&conflict_id) {
                        report.conflicts.push(conflict_id);
                    }
                }
                Ok(RemoteApplyOutcome::Unchanged | RemoteApplyOutcome::Skipped) => {}
                Err(error) if error.is_run_fatal() => return Err(error),
                Err(error) => report.errors.push(format!("{}: {error}", remote.id)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use crate::models::SyncStatus;
    use crate::sync::testing::ScriptedApi;

    struct Fixture {
        store: LocalStore,
        api: Arc<ScriptedApi>,
        sync: BatchSynchronizer,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open_in_memory(dir.path().join("attachments"))
            .await
            .unwrap();
        let api = Arc::new(ScriptedApi::new());
        let mut endpoints = BTreeMap::new();
        endpoints.insert("visit".to_string(), "/visits".to_string());
        let sync = BatchSynchronizer::new(
            store.clone(),
            api.clone(),
            Arc::new(endpoints),
            ClaimSet::new(),
            Duration::from_secs(5),
        );
        Fixture {
            store,
            api,
            sync,
            _dir: dir,
        }
    }

    /// Run a store call from inside a synchronous request hook.
    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(future))
    }

    fn settings() -> UploadSettings {
        UploadSettings {
            batch_size: 50,
            retry: RetryPolicy::new(3, Duration::ZERO),
        }
    }

    impl Fixture {
        async fn upload(&self) -> Result<UploadReport> {
            self.sync
                .upload(
                    DequeueFilter::default(),
                    settings(),
                    &CancellationToken::new(),
                    &mut |_, _| {},
                )
                .await
        }

        async fn download(&self) -> DownloadReport {
            self.sync
                .download(
                    &["visit".to_string()],
                    0,
                    RetryPolicy::no_retry(),
                    &CancellationToken::new(),
                    &mut |_, _| {},
                )
                .await
                .unwrap()
        }

        async fn record(&self, id: &RecordId) -> Record {
            self.store.get_including_deleted(id).await.unwrap().unwrap()
        }

        async fn pending(&self) -> u64 {
            self.store
                .pending_count(&DequeueFilter::default())
                .await
                .unwrap()
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn creates_with_post_then_updates_with_put() {
        let f = fixture().await;
        let id = f.store.put("visit", json!({"notes": "first"}), None).await.unwrap();

        let report = f.upload().await.unwrap();
        assert_eq!(report.synced, 1);
        let record = f.record(&id).await;
        assert_eq!(record.sync_status, SyncStatus::Synced);
        assert_eq!(record.server_version, Some(1));
        assert_eq!(f.pending().await, 0);

        f.store
            .put("visit", json!({"notes": "second"}), Some(&id))
            .await
            .unwrap();
        f.upload().await.unwrap();

        let calls = f.api.calls();
        assert_eq!(calls[0].method, Method::Post);
        assert_eq!(calls[0].path, format!("/visits?clientId={id}"));
        assert_eq!(calls[0].body, Some(json!({"notes": "first"})));
        assert_eq!(calls[1].method, Method::Put);
        assert_eq!(calls[1].path, format!("/visits/{id}?baseVersion=1"));
        assert_eq!(f.record(&id).await.server_version, Some(2));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn always_failing_item_is_tried_max_retries_times() {
        let f = fixture().await;
        let id = f.store.put("visit", json!({}), None).await.unwrap();
        f.api
            .respond(Method::Post, "/visits", ApiResponse::failure(500, "boom"));

        let report = f.upload().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(f.api.calls_to(Method::Post, "/visits"), 3);
        assert_eq!(f.record(&id).await.sync_status, SyncStatus::Error);
        let queued = f
            .store
            .dequeue_batch(10, &DequeueFilter::default())
            .await
            .unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].entry.retry_count, 1);
        assert!(queued[0].entry.last_attempt.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn timeouts_are_retried() {
        let f = fixture().await;
        f.store.put("visit", json!({}), None).await.unwrap();
        f.api.fail(Method::Post, "/visits", || Error::Timeout);

        let report = f.upload().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(f.api.calls_to(Method::Post, "/visits"), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transient_failure_then_success() {
        let f = fixture().await;
        let id = f.store.put("visit", json!({}), None).await.unwrap();
        f.api
            .respond(Method::Post, "/visits", ApiResponse::failure(503, "busy"));
        f.api
            .respond(Method::Post, "/visits", ApiResponse::ok(json!({"version": 1})));

        let report = f.upload().await.unwrap();

        assert_eq!(report.synced, 1);
        assert_eq!(f.api.calls_to(Method::Post, "/visits"), 2);
        assert_eq!(f.record(&id).await.sync_status, SyncStatus::Synced);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn client_error_is_not_retried() {
        let f = fixture().await;
        let id = f.store.put("visit", json!({}), None).await.unwrap();
        f.api
            .respond(Method::Post, "/visits", ApiResponse::failure(422, "bad field"));

        let report = f.upload().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(f.api.calls_to(Method::Post, "/visits"), 1);
        assert_eq!(f.record(&id).await.sync_status, SyncStatus::Error);
        assert_eq!(f.pending().await, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn server_conflict_blocks_record() {
        let f = fixture().await;
        let id = f.store.put("visit", json!({"v": 1}), None).await.unwrap();
        f.upload().await.unwrap();
        f.store.put("visit", json!({"v": 2}), Some(&id)).await.unwrap();
        f.api.respond(
            Method::Put,
            &format!("/visits/{id}"),
            ApiResponse::conflict(json!({"id": id, "version": 3, "payload": {"v": "server"}})),
        );

        let report = f.upload().await.unwrap();

        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.failed, 0);
        assert_eq!(f.api.calls_to(Method::Put, "/visits"), 1);
        assert_eq!(f.record(&id).await.sync_status, SyncStatus::Conflict);
        assert_eq!(f.pending().await, 0);

        let conflict = f
            .store
            .get_conflict(report.conflicts[0])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conflict.conflict_type, ConflictType::Update);
        assert_eq!(conflict.local_data, json!({"v": 2}));
        assert_eq!(conflict.server_version(), Some(3));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn conflict_keeps_write_made_during_push() {
        let f = fixture().await;
        let id = f.store.put("visit", json!({"v": 1}), None).await.unwrap();
        f.upload().await.unwrap();
        f.store.put("visit", json!({"v": 2}), Some(&id)).await.unwrap();
        f.api.respond(
            Method::Put,
            &format!("/visits/{id}"),
            ApiResponse::conflict(json!({"id": id, "version": 3, "payload": {"v": "server"}})),
        );
        let store = f.store.clone();
        let edited = id.clone();
        f.api.on_request(move |method, _| {
            if method == Method::Put {
                block_on(store.put("visit", json!({"v": 3}), Some(&edited))).unwrap();
            }
        });

        let report = f.upload().await.unwrap();

        assert_eq!(report.conflicts.len(), 1);
        let conflict = f
            .store
            .get_conflict(report.conflicts[0])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conflict.local_data, json!({"v": 3}));
        let record = f.record(&id).await;
        assert_eq!(record.payload, json!({"v": 3}));
        assert_eq!(record.sync_status, SyncStatus::Conflict);
        assert_eq!(f.pending().await, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn conflict_without_body_reads_server_copy() {
        let f = fixture().await;
        let id = f.store.put("visit", json!({"v": 1}), None).await.unwrap();
        f.upload().await.unwrap();
        f.store.put("visit", json!({"v": 2}), Some(&id)).await.unwrap();
        f.api.respond(
            Method::Put,
            &format!("/visits/{id}"),
            ApiResponse {
                conflict: true,
                status: Some(409),
                ..ApiResponse::default()
            },
        );
        f.api.respond(
            Method::Get,
            &format!("/visits/{id}"),
            ApiResponse::ok(json!({"version": 4, "payload": {"v": "server"}})),
        );

        let report = f.upload().await.unwrap();

        let conflict = f
            .store
            .get_conflict(report.conflicts[0])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conflict.server_version(), Some(4));
        assert!(!conflict.server_deleted());
        assert_eq!(
            conflict.server_data.unwrap().payload,
            json!({"v": "server"})
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_during_create_is_sent_after_acknowledgment() {
        let f = fixture().await;
        let id = f.store.put("visit", json!({"v": 1}), None).await.unwrap();
        let store = f.store.clone();
        let deleted = id.clone();
        f.api.on_request(move |method, _| {
            if method == Method::Post {
                assert!(block_on(store.delete(&deleted)).unwrap());
            }
        });

        f.upload().await.unwrap();
        f.upload().await.unwrap();

        let calls = f.api.calls();
        assert_eq!(calls[0].method, Method::Post);
        let deletes: Vec<_> = calls
            .iter()
            .filter(|call| call.method == Method::Delete)
            .collect();
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].path, format!("/visits/{id}?baseVersion=1"));
        assert!(f.store.get_including_deleted(&id).await.unwrap().is_none());
        assert_eq!(f.pending().await, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_after_failed_create_still_reaches_server() {
        let f = fixture().await;
        let id = f.store.put("visit", json!({}), None).await.unwrap();
        f.api.fail(Method::Post, "/visits", || Error::Timeout);
        f.upload().await.unwrap();

        assert!(f.store.delete(&id).await.unwrap());
        assert!(f.record(&id).await.is_deleted);
        f.upload().await.unwrap();

        let delete = f.api.calls().pop().unwrap();
        assert_eq!(delete.method, Method::Delete);
        assert_eq!(delete.path, format!("/visits/{id}"));
        assert!(f.store.get_including_deleted(&id).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn auth_failure_aborts_pass() {
        let f = fixture().await;
        let first = f.store.put("visit", json!({"n": 1}), None).await.unwrap();
        f.store.put("visit", json!({"n": 2}), None).await.unwrap();
        f.api
            .respond(Method::Post, "/visits", ApiResponse::failure(401, "expired"));

        let error = f.upload().await.unwrap_err();

        assert!(matches!(error, Error::Auth(_)));
        assert_eq!(f.api.calls().len(), 1);
        assert_eq!(f.record(&first).await.sync_status, SyncStatus::Local);
        assert_eq!(f.pending().await, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_is_sent_with_base_version_and_purges() {
        let f = fixture().await;
        let id = f.store.put("visit", json!({}), None).await.unwrap();
        f.upload().await.unwrap();
        f.store.delete(&id).await.unwrap();

        let report = f.upload().await.unwrap();

        assert_eq!(report.synced, 1);
        let delete = f.api.calls().pop().unwrap();
        assert_eq!(delete.method, Method::Delete);
        assert_eq!(delete.path, format!("/visits/{id}?baseVersion=1"));
        assert!(f.store.get_including_deleted(&id).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_of_record_already_gone_counts_as_done() {
        let f = fixture().await;
        let id = f.store.put("visit", json!({}), None).await.unwrap();
        f.upload().await.unwrap();
        f.store.delete(&id).await.unwrap();
        f.api.respond(
            Method::Delete,
            &format!("/visits/{id}"),
            ApiResponse::failure(404, "not found"),
        );

        let report = f.upload().await.unwrap();

        assert_eq!(report.synced, 1);
        assert!(f.store.get_including_deleted(&id).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn attachments_follow_confirmed_upload() {
        let f = fixture().await;
        let id = f.store.put("visit", json!({}), None).await.unwrap();
        f.store
            .store_attachment(&id, b"sig", "signature.png", "image/png")
            .await
            .unwrap();

        let report = f.upload().await.unwrap();

        assert!(report.errors.is_empty());
        assert_eq!(
            f.api.uploads(),
            vec![(format!("/visits/{id}/attachments"), "signature.png".to_string())]
        );
        assert!(f.store.pending_attachments(&id).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn attachment_failure_keeps_record_synced() {
        let f = fixture().await;
        let id = f.store.put("visit", json!({}), None).await.unwrap();
        f.store
            .store_attachment(&id, b"sig", "signature.png", "image/png")
            .await
            .unwrap();
        f.api.respond(
            Method::Post,
            &format!("/visits/{id}/attachments"),
            ApiResponse::failure(413, "too large"),
        );

        let report = f.upload().await.unwrap();

        assert_eq!(report.synced, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(f.record(&id).await.sync_status, SyncStatus::Synced);
        assert_eq!(f.store.pending_attachments(&id).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelled_pass_dispatches_nothing() {
        let f = fixture().await;
        f.store.put("visit", json!({}), None).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = f
            .sync
            .upload(DequeueFilter::default(), settings(), &cancel, &mut |_, _| {})
            .await
            .unwrap();

        assert!(report.cancelled);
        assert!(f.api.calls().is_empty());
        assert_eq!(f.pending().await, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn claimed_item_is_skipped() {
        let f = fixture().await;
        let id = f.store.put("visit", json!({}), None).await.unwrap();
        let _claim = f.sync.claims().try_claim(&id).unwrap();

        let report = f.upload().await.unwrap();

        assert_eq!(report.synced, 0);
        assert!(f.api.calls().is_empty());
        assert_eq!(f.pending().await, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn progress_reaches_total() {
        let f = fixture().await;
        for n in 0..3 {
            f.store.put("visit", json!({"n": n}), None).await.unwrap();
        }
        let mut seen = Vec::new();

        f.sync
            .upload(
                DequeueFilter::default(),
                UploadSettings {
                    batch_size: 2,
                    retry: RetryPolicy::no_retry(),
                },
                &CancellationToken::new(),
                &mut |processed, total| seen.push((processed, total)),
            )
            .await
            .unwrap();

        assert_eq!(seen, vec![(0, 3), (1, 3), (2, 3), (3, 3)]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn large_backlog_drains_in_one_pass() {
        let f = fixture().await;
        for n in 0..33_000 {
            f.store.put("visit", json!({"n": n}), None).await.unwrap();
        }

        let report = f
            .sync
            .upload(
                DequeueFilter::default(),
                UploadSettings {
                    batch_size: 500,
                    retry: RetryPolicy::no_retry(),
                },
                &CancellationToken::new(),
                &mut |_, _| {},
            )
            .await
            .unwrap();

        assert_eq!(report.synced, 33_000);
        assert_eq!(report.failed, 0);
        assert_eq!(f.api.calls_to(Method::Post, "/visits"), 33_000);
        assert_eq!(f.pending().await, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn download_applies_changes_and_raises_conflicts() {
        let f = fixture().await;
        let dirty = f.store.put("visit", json!({"v": 1}), None).await.unwrap();
        f.upload().await.unwrap();
        f.store
            .put("visit", json!({"v": "local"}), Some(&dirty))
            .await
            .unwrap();
        f.api.serve_changes(
            "/visits",
            json!([
                {"id": "visit_new", "version": 2, "payload": {"v": "new"}},
                {"id": dirty, "version": 2, "payload": {"v": "server"}},
                {"version": "garbage"}
            ]),
        );

        let report = f.download().await;

        assert_eq!(report.applied, 1);
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(
            f.record(&RecordId::from("visit_new")).await.sync_status,
            SyncStatus::Synced
        );
        assert_eq!(f.record(&dirty).await.sync_status, SyncStatus::Conflict);
        assert_eq!(f.api.calls()[1].path, "/visits/changes?since=0");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn download_accepts_wrapped_data() {
        let f = fixture().await;
        f.api.serve_changes(
            "/visits",
            json!({"data": [{"id": "visit_a", "version": 1, "payload": {}}]}),
        );

        let report = f.download().await;

        assert_eq!(report.applied, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn download_failure_is_accumulated() {
        let f = fixture().await;
        f.api.respond(
            Method::Get,
            "/visits/changes",
            ApiResponse::failure(500, "down"),
        );

        let report = f
            .sync
            .download(
                &["visit".to_string(), "sale".to_string()],
                0,
                RetryPolicy::no_retry(),
                &CancellationToken::new(),
                &mut |_, _| {},
            )
            .await
            .unwrap();

        assert_eq!(report.errors.len(), 2);
        assert_eq!(report.applied, 0);
    }
}
