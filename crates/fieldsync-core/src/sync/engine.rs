//! Sync orchestrator: runs the upload, download, and resolve phases.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::api::{Connectivity, EndpointMap, Notifier, RemoteApi};
use super::batch::{BatchSynchronizer, DownloadReport, UploadSettings};
use super::cancel::CancellationToken;
use super::claims::ClaimSet;
use super::conflict::{ConflictResolver, ResolutionOutcome, ResolutionReport};
use super::options::{ConflictStrategy, Resolution, SyncOptions, SyncResult, SyncStatistics};
use super::progress::{bands, ProgressReporter, ProgressSubscription, SyncProgress, SyncState};
use super::retry::RetryPolicy;
use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::models::{Conflict, DequeueFilter, QueueOperation, RecordId};
use crate::services::LocalStore;
use crate::util::now_millis;

const CONFLICT_LIST_LIMIT: usize = 500;

#[derive(Debug, Default)]
struct Counters {
    runs_completed: u64,
    runs_failed: u64,
    last_result: Option<SyncResult>,
    last_error: Option<String>,
}

struct EngineInner {
    store: LocalStore,
    sync: BatchSynchronizer,
    resolver: ConflictResolver,
    api: Arc<dyn RemoteApi>,
    connectivity: Arc<dyn Connectivity>,
    notifier: Arc<dyn Notifier>,
    config: SyncConfig,
    state: RwLock<SyncState>,
    running: AtomicBool,
    cancel: CancellationToken,
    progress: ProgressReporter,
    counters: Mutex<Counters>,
}

/// Handle to the sync engine. Cheap to clone.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

/// Clears the full-run flag when a run ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SyncEngine {
    pub fn new(
        store: LocalStore,
        config: SyncConfig,
        api: Arc<dyn RemoteApi>,
        connectivity: Arc<dyn Connectivity>,
        endpoints: Arc<dyn EndpointMap>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let sync = BatchSynchronizer::new(
            store.clone(),
            Arc::clone(&api),
            endpoints,
            ClaimSet::new(),
            config.request_timeout,
        );
        let resolver = ConflictResolver::new(store.clone(), sync.clone());
        Self {
            inner: Arc::new(EngineInner {
                store,
                sync,
                resolver,
                api,
                connectivity,
                notifier,
                config,
                state: RwLock::new(SyncState::Idle),
                running: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                progress: ProgressReporter::new(),
                counters: Mutex::new(Counters::default()),
            }),
        }
    }

    pub fn store(&self) -> &LocalStore {
        &self.inner.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SyncState {
        *self.inner.state.read()
    }

    /// Whether a full run is in flight.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: SyncState) {
        let previous = std::mem::replace(&mut *self.inner.state.write(), state);
        if previous != state {
            tracing::debug!("Sync state {previous} -> {state}");
        }
    }

    fn publish(&self, progress: SyncProgress) {
        self.inner.progress.publish(progress);
    }

    /// Run a full synchronization.
    ///
    /// Fails immediately with [`Error::SyncInProgress`] if another full run
    /// is active. Offline, missing credentials, auth rejections, and local
    /// storage failures end the run in [`SyncState::Failed`].
    pub async fn run_full_sync(&self, options: SyncOptions) -> Result<SyncResult> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Rejected full sync: another run is active");
            return Err(Error::SyncInProgress);
        }
        let _guard = RunGuard(&self.inner.running);
        self.inner.cancel.reset();

        let started = Instant::now();
        let watermark = now_millis();
        match self.execute(&options, started, watermark).await {
            Ok(result) => Ok(result),
            Err(error) => Err(self.fail(error)),
        }
    }

    async fn preflight(&self) -> Result<()> {
        if !self.inner.connectivity.is_online().await {
            return Err(Error::Offline);
        }
        if !self.inner.api.has_credentials() {
            return Err(Error::Auth("no credentials configured".to_string()));
        }
        Ok(())
    }

    async fn execute(
        &self,
        options: &SyncOptions,
        started: Instant,
        watermark: i64,
    ) -> Result<SyncResult> {
        let config = &self.inner.config;
        let store = &self.inner.store;
        let cancel = &self.inner.cancel;

        // Preparing
        self.set_state(SyncState::Preparing);
        self.publish(SyncProgress::new(SyncState::Preparing, 0, "Preparing sync"));
        self.preflight().await?;

        let types = if options.types.is_empty() {
            config.tracked_types.clone()
        } else {
            options.types.clone()
        };
        if options.force_sync {
            let ids = store.synced_ids(&types).await?;
            tracing::info!("Force sync: re-queueing {} synced record(s)", ids.len());
            for id in &ids {
                store.enqueue(id, QueueOperation::Upsert, 0).await?;
            }
        }
        let settings = UploadSettings {
            batch_size: options.batch_size.unwrap_or(config.batch_size).max(1),
            retry: match options.max_retries {
                Some(max_retries) => {
                    RetryPolicy::new(max_retries.max(1), config.retry_base_delay)
                }
                None => config.retry_policy(),
            },
        };
        let strategy = options
            .conflict_resolution
            .unwrap_or(config.conflict_strategy);

        // Uploading
        self.set_state(SyncState::Uploading);
        let progress = &self.inner.progress;
        let upload = self
            .inner
            .sync
            .upload(
                DequeueFilter::for_types(&types),
                settings,
                cancel,
                &mut |processed, total| {
                    progress.publish(SyncProgress::in_band(
                        SyncState::Uploading,
                        bands::UPLOAD,
                        processed,
                        total,
                        format!("Uploaded {processed} of {total}"),
                    ));
                },
            )
            .await?;

        // Downloading
        let mut download = DownloadReport::default();
        let mut downloaded = false;
        if !cancel.is_cancelled() {
            self.set_state(SyncState::Downloading);
            let since = store.last_sync().await?.unwrap_or_default();
            download = self
                .inner
                .sync
                .download(&types, since, settings.retry, cancel, &mut |processed, total| {
                    progress.publish(SyncProgress::in_band(
                        SyncState::Downloading,
                        bands::DOWNLOAD,
                        processed,
                        total,
                        format!("Downloaded {processed} of {total} types"),
                    ));
                })
                .await?;
            downloaded = !download.cancelled;
        }

        // Resolving conflicts
        let mut conflict_ids = upload.conflicts.clone();
        for id in &download.conflicts {
            if !conflict_ids.contains(id) {
                conflict_ids.push(*id);
            }
        }
        let mut resolution = ResolutionReport::default();
        if !cancel.is_cancelled() && !conflict_ids.is_empty() {
            self.set_state(SyncState::ResolvingConflicts);
            resolution = self
                .inner
                .resolver
                .apply_strategy(&conflict_ids, strategy, settings.retry, cancel, &mut |done, total| {
                    progress.publish(SyncProgress::in_band(
                        SyncState::ResolvingConflicts,
                        bands::RESOLVE,
                        done,
                        total,
                        format!("Resolved {done} of {total} conflicts"),
                    ));
                })
                .await?;
        }

        // Completing
        self.set_state(SyncState::Completing);
        let cancelled = cancel.is_cancelled() || upload.cancelled || download.cancelled;
        if downloaded && download.errors.is_empty() && !cancelled {
            store.set_last_sync(watermark).await?;
        } else {
            tracing::info!("Keeping previous sync watermark");
        }

        let pending_conflicts = store.open_conflict_count().await?;
        let mut result = SyncResult {
            items_synced: upload.synced + resolution.resolved,
            items_failed: upload.failed,
            conflicts: conflict_ids.len() as u64,
            pending_conflicts,
            cancelled,
            ..SyncResult::default()
        };
        for error in upload
            .errors
            .iter()
            .chain(&download.errors)
            .chain(&resolution.errors)
        {
            result.push_error(error);
        }
        result.success = result.items_failed == 0 && result.errors.is_empty() && !cancelled;
        result.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        self.finish(&result, strategy);
        Ok(result)
    }

    fn finish(&self, result: &SyncResult, strategy: ConflictStrategy) {
        let title = if result.cancelled {
            "Sync cancelled"
        } else if result.success {
            "Sync complete"
        } else {
            "Sync finished with errors"
        };
        self.inner.notifier.notify(title, &result.summary());
        self.notify_pending_conflicts(result, strategy);

        {
            let mut counters = self.inner.counters.lock();
            counters.runs_completed += 1;
            counters.last_result = Some(result.clone());
            if let Some(error) = result.errors.last() {
                counters.last_error = Some(error.clone());
            }
        }

        tracing::info!("{title}: {} in {} ms", result.summary(), result.duration_ms);
        self.set_state(SyncState::Idle);
        self.publish(SyncProgress::new(SyncState::Idle, bands::COMPLETE, title));
    }

    fn notify_pending_conflicts(&self, result: &SyncResult, strategy: ConflictStrategy) {
        if result.pending_conflicts == 0 {
            return;
        }
        if strategy == ConflictStrategy::Manual || result.conflicts > 0 {
            self.inner.notifier.notify(
                "Conflicts need attention",
                &format!(
                    "{} conflict(s) waiting: resolve now or later",
                    result.pending_conflicts
                ),
            );
        }
    }

    /// Record a run-level failure and move to `Failed`.
    fn fail(&self, error: Error) -> Error {
        tracing::warn!("Sync failed: {error}");
        {
            let mut counters = self.inner.counters.lock();
            counters.runs_failed += 1;
            counters.last_error = Some(error.to_string());
        }
        self.set_state(SyncState::Failed);
        let percent = self.inner.progress.current().percent;
        self.publish(SyncProgress::new(SyncState::Failed, percent, error.to_string()));
        self.inner.notifier.notify("Sync failed", &error.to_string());
        error
    }

    /// Upload a few named records right away.
    ///
    /// Runs alongside a full sync; records already in flight are skipped.
    /// Notifies only about failures and conflicts.
    pub async fn run_quick_sync(&self, ids: &[RecordId]) -> Result<SyncResult> {
        let strategy = self.inner.config.conflict_strategy;
        match self.quick_sync(ids).await {
            Ok(result) => {
                if result.items_failed > 0 || !result.errors.is_empty() {
                    self.inner
                        .notifier
                        .notify("Quick sync finished with errors", &result.summary());
                }
                self.notify_pending_conflicts(&result, strategy);
                tracing::info!("Quick sync: {}", result.summary());
                Ok(result)
            }
            Err(error) => {
                tracing::warn!("Quick sync failed: {error}");
                self.inner
                    .notifier
                    .notify("Quick sync failed", &error.to_string());
                Err(error)
            }
        }
    }

    async fn quick_sync(&self, ids: &[RecordId]) -> Result<SyncResult> {
        let started = Instant::now();
        self.preflight().await?;
        if ids.is_empty() {
            return Ok(SyncResult {
                success: true,
                ..SyncResult::default()
            });
        }

        let config = &self.inner.config;
        let settings = UploadSettings {
            batch_size: config.batch_size.max(1),
            retry: config.retry_policy(),
        };
        let cancel = CancellationToken::new();
        let upload = self
            .inner
            .sync
            .upload(DequeueFilter::for_items(ids), settings, &cancel, &mut |_, _| {})
            .await?;
        let resolution = if upload.conflicts.is_empty() {
            ResolutionReport::default()
        } else {
            self.inner
                .resolver
                .apply_strategy(
                    &upload.conflicts,
                    config.conflict_strategy,
                    settings.retry,
                    &cancel,
                    &mut |_, _| {},
                )
                .await?
        };

        let mut result = SyncResult {
            items_synced: upload.synced + resolution.resolved,
            items_failed: upload.failed,
            conflicts: upload.conflicts.len() as u64,
            pending_conflicts: resolution.pending,
            ..SyncResult::default()
        };
        for error in upload.errors.iter().chain(&resolution.errors) {
            result.push_error(error);
        }
        result.success = result.items_failed == 0 && result.errors.is_empty();
        result.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        Ok(result)
    }

    /// Apply an explicit resolution to an open conflict.
    pub async fn resolve_conflict(
        &self,
        conflict_id: i64,
        resolution: Resolution,
    ) -> Result<ResolutionOutcome> {
        self.inner
            .resolver
            .resolve(conflict_id, resolution, self.inner.config.retry_policy())
            .await
    }

    /// Conflicts, newest first.
    pub async fn list_conflicts(&self, include_resolved: bool) -> Result<Vec<Conflict>> {
        self.inner
            .store
            .list_conflicts(include_resolved, CONFLICT_LIST_LIMIT)
            .await
    }

    /// Call `callback` with every progress update until the handle is dropped.
    pub fn subscribe_progress<F>(&self, callback: F) -> ProgressSubscription
    where
        F: Fn(&SyncProgress) + Send + 'static,
    {
        self.inner.progress.subscribe(callback)
    }

    pub fn progress_receiver(&self) -> watch::Receiver<SyncProgress> {
        self.inner.progress.receiver()
    }

    pub fn current_progress(&self) -> SyncProgress {
        self.inner.progress.current()
    }

    /// Ask the running sync to stop after the item in flight.
    pub fn cancel_sync(&self) {
        if self.is_running() {
            tracing::info!("Cancelling sync");
        }
        self.inner.cancel.cancel();
    }

    #[cfg(test)]
    fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub async fn statistics(&self) -> Result<SyncStatistics> {
        let store = &self.inner.store;
        let storage = store.storage_stats().await?;
        let pending_uploads = store.pending_count(&DequeueFilter::default()).await?;
        let open_conflicts = store.open_conflict_count().await?;
        let counters = self.inner.counters.lock();
        Ok(SyncStatistics {
            state: self.state(),
            storage,
            pending_uploads,
            open_conflicts,
            runs_completed: counters.runs_completed,
            runs_failed: counters.runs_failed,
            last_result: counters.last_result.clone(),
            last_error: counters.last_error.clone(),
        })
    }

    /// Start background full syncs every `interval`, and as soon as
    /// connectivity returns (checked every `poll`). The first run starts
    /// right away.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_auto_sync(&self, interval: Duration, poll: Duration) -> AutoSyncHandle {
        let engine = self.clone();
        let stop = Arc::new(Notify::new());
        let stopped = Arc::clone(&stop);

        let handle = tokio::spawn(async move {
            let mut sync_tick = tokio::time::interval(interval);
            sync_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut poll_tick = tokio::time::interval(poll);
            poll_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut was_online = engine.inner.connectivity.is_online().await;
            tracing::info!("Auto sync every {interval:?}");

            loop {
                let trigger = tokio::select! {
                    () = stopped.notified() => break,
                    _ = sync_tick.tick() => true,
                    _ = poll_tick.tick() => {
                        let online = engine.inner.connectivity.is_online().await;
                        let reconnected = online && !was_online;
                        was_online = online;
                        if reconnected {
                            tracing::info!("Connectivity restored");
                        }
                        reconnected
                    }
                };
                if !trigger || engine.is_running() {
                    continue;
                }
                if !engine.inner.connectivity.is_online().await {
                    was_online = false;
                    continue;
                }
                match engine.run_full_sync(SyncOptions::default()).await {
                    Ok(result) => tracing::debug!("Auto sync: {}", result.summary()),
                    Err(Error::SyncInProgress) => {}
                    Err(error) => tracing::warn!("Auto sync failed: {error}"),
                }
            }
            tracing::debug!("Auto sync stopped");
        });

        AutoSyncHandle {
            stop,
            handle: Some(handle),
        }
    }
}

/// Background auto-sync task; stops when dropped.
///
/// A run in flight is allowed to finish first.
#[derive(Debug)]
pub struct AutoSyncHandle {
    stop: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl AutoSyncHandle {
    /// Stop the task and wait for it to exit.
    pub async fn stop(mut self) {
        self.stop.notify_one();
        if let Some(handle) = self.handle.take() {
            if let Err(error) = handle.await {
                tracing::warn!("Auto sync task ended abnormally: {error}");
            }
        }
    }
}

impl Drop for AutoSyncHandle {
    fn drop(&mut self) {
        self.stop.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use crate::models::SyncStatus;
    use crate::sync::api::{ApiResponse, Method};
    use crate::sync::testing::{RecordingNotifier, ScriptedApi};

    struct Fixture {
        engine: SyncEngine,
        store: LocalStore,
        api: Arc<ScriptedApi>,
        notifier: Arc<RecordingNotifier>,
        _dir: tempfile::TempDir,
    }

    fn config(strategy: ConflictStrategy) -> SyncConfig {
        SyncConfig {
            tracked_types: vec!["visit".to_string()],
            batch_size: 50,
            max_retries: 2,
            retry_base_delay: Duration::ZERO,
            request_timeout: Duration::from_secs(5),
            conflict_strategy: strategy,
        }
    }

    async fn fixture_with(strategy: ConflictStrategy) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open_in_memory(dir.path().join("attachments"))
            .await
            .unwrap();
        let api = Arc::new(ScriptedApi::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let mut endpoints = BTreeMap::new();
        endpoints.insert("visit".to_string(), "/visits".to_string());
        let engine = SyncEngine::new(
            store.clone(),
            config(strategy),
            api.clone(),
            api.clone(),
            Arc::new(endpoints),
            notifier.clone(),
        );
        Fixture {
            engine,
            store,
            api,
            notifier,
            _dir: dir,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(ConflictStrategy::ServerWins).await
    }

    impl Fixture {
        async fn status(&self, id: &RecordId) -> SyncStatus {
            self.store.get(id).await.unwrap().unwrap().sync_status
        }

        /// A record the server accepted at version 1, then edited locally.
        async fn edited_after_sync(&self) -> RecordId {
            let id = self.store.put("visit", json!({"notes": "v1"}), None).await.unwrap();
            self.engine.run_full_sync(SyncOptions::default()).await.unwrap();
            self.store
                .put("visit", json!({"notes": "local"}), Some(&id))
                .await
                .unwrap();
            id
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offline_run_fails_without_touching_records() {
        let f = fixture().await;
        let id = f.store.put("visit", json!({"notes": "a"}), None).await.unwrap();
        f.api.set_online(false);

        let result = f.engine.run_full_sync(SyncOptions::default()).await;

        assert!(matches!(result, Err(Error::Offline)));
        assert_eq!(f.status(&id).await, SyncStatus::Local);
        assert_eq!(f.engine.state(), SyncState::Failed);
        assert_eq!(f.notifier.titles(), vec!["Sync failed".to_string()]);
        assert!(f.api.calls().is_empty());
        assert!(!f.engine.is_running());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_credentials_fail_the_run() {
        let f = fixture().await;
        f.api.set_credentials(false);

        let result = f.engine.run_full_sync(SyncOptions::default()).await;

        assert!(matches!(result, Err(Error::Auth(_))));
        assert_eq!(f.engine.state(), SyncState::Failed);
        assert_eq!(f.notifier.sent().len(), 1);
        assert!(f.api.calls().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn online_run_syncs_and_stores_watermark() {
        let f = fixture().await;
        let id = f.store.put("visit", json!({"notes": "a"}), None).await.unwrap();
        let before = now_millis();

        let result = f.engine.run_full_sync(SyncOptions::default()).await.unwrap();

        assert!(result.success);
        assert_eq!(result.items_synced, 1);
        assert_eq!(result.items_failed, 0);
        assert_eq!(f.status(&id).await, SyncStatus::Synced);
        let watermark = f.store.last_sync().await.unwrap().unwrap();
        assert!(watermark >= before);
        assert_eq!(f.api.calls_to(Method::Post, "/visits"), 1);
        assert_eq!(f.api.calls_to(Method::Get, "/visits/changes?since=0"), 1);
        assert_eq!(f.engine.state(), SyncState::Idle);
        assert_eq!(f.notifier.titles(), vec!["Sync complete".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn next_run_downloads_since_watermark() {
        let f = fixture().await;
        f.engine.run_full_sync(SyncOptions::default()).await.unwrap();
        let watermark = f.store.last_sync().await.unwrap().unwrap();

        f.engine.run_full_sync(SyncOptions::default()).await.unwrap();

        let expected = format!("/visits/changes?since={watermark}");
        assert!(f.api.calls().iter().any(|call| call.path == expected));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_full_run_is_rejected() {
        let f = fixture().await;
        f.engine.inner.running.store(true, Ordering::SeqCst);

        let result = f.engine.run_full_sync(SyncOptions::default()).await;

        assert!(matches!(result, Err(Error::SyncInProgress)));
        assert_eq!(f.engine.state(), SyncState::Idle);
        assert!(f.notifier.sent().is_empty());
        assert!(f.engine.is_running());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn server_wins_resolves_upload_conflict() {
        let f = fixture().await;
        let id = f.edited_after_sync().await;
        f.api.respond(
            Method::Put,
            &format!("/visits/{id}"),
            ApiResponse::conflict(json!({
                "id": id,
                "version": 3,
                "payload": {"notes": "server"}
            })),
        );

        let result = f.engine.run_full_sync(SyncOptions::default()).await.unwrap();

        assert_eq!(result.conflicts, 1);
        assert_eq!(result.pending_conflicts, 0);
        let record = f.store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Synced);
        assert_eq!(record.version, 3);
        assert_eq!(record.payload, json!({"notes": "server"}));
        assert_eq!(f.store.open_conflict_count().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn conflict_without_server_copy_keeps_local_edit() {
        let f = fixture().await;
        let id = f.edited_after_sync().await;
        f.api.respond(
            Method::Put,
            &format!("/visits/{id}"),
            ApiResponse {
                conflict: true,
                status: Some(409),
                ..ApiResponse::default()
            },
        );

        let result = f.engine.run_full_sync(SyncOptions::default()).await.unwrap();

        assert_eq!(result.conflicts, 1);
        assert_eq!(result.pending_conflicts, 1);
        let record = f.store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.payload, json!({"notes": "local"}));
        assert_eq!(record.sync_status, SyncStatus::Conflict);
        let conflicts = f.engine.list_conflicts(false).await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].server_data, None);
        assert_eq!(conflicts[0].local_data, json!({"notes": "local"}));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn conflict_without_body_reads_server_copy() {
        let f = fixture().await;
        let id = f.edited_after_sync().await;
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
            ApiResponse::ok(json!({"version": 3, "payload": {"notes": "server"}})),
        );

        let result = f.engine.run_full_sync(SyncOptions::default()).await.unwrap();

        assert_eq!(result.conflicts, 1);
        assert_eq!(result.pending_conflicts, 0);
        let record = f.store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.payload, json!({"notes": "server"}));
        assert_eq!(record.server_version, Some(3));
        assert_eq!(record.sync_status, SyncStatus::Synced);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn manual_strategy_leaves_conflict_and_prompts() {
        let f = fixture_with(ConflictStrategy::Manual).await;
        let id = f.edited_after_sync().await;
        f.api.respond(
            Method::Put,
            &format!("/visits/{id}"),
            ApiResponse::conflict(json!({"id": id, "version": 3, "payload": {}})),
        );

        let result = f.engine.run_full_sync(SyncOptions::default()).await.unwrap();

        assert_eq!(result.pending_conflicts, 1);
        assert_eq!(f.status(&id).await, SyncStatus::Conflict);
        assert!(f
            .notifier
            .titles()
            .contains(&"Conflicts need attention".to_string()));

        let conflicts = f.engine.list_conflicts(false).await.unwrap();
        assert_eq!(conflicts.len(), 1);
        let outcome = f
            .engine
            .resolve_conflict(conflicts[0].id, Resolution::UseServer)
            .await
            .unwrap();
        assert_eq!(outcome, ResolutionOutcome::Resolved);
        assert_eq!(f.status(&id).await, SyncStatus::Synced);
        assert!(f.engine.list_conflicts(false).await.unwrap().is_empty());
        assert_eq!(f.engine.list_conflicts(true).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn option_overrides_configured_strategy() {
        let f = fixture().await;
        let id = f.edited_after_sync().await;
        f.api.respond(
            Method::Put,
            &format!("/visits/{id}"),
            ApiResponse::conflict(json!({"id": id, "version": 3, "payload": {}})),
        );

        let result = f
            .engine
            .run_full_sync(SyncOptions::default().with_conflict_resolution(ConflictStrategy::Manual))
            .await
            .unwrap();

        assert_eq!(result.pending_conflicts, 1);
        assert_eq!(f.status(&id).await, SyncStatus::Conflict);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancellation_stops_between_items() {
        let f = fixture().await;
        for n in 0..3 {
            f.store.put("visit", json!({"n": n}), None).await.unwrap();
        }
        let token = f.engine.cancellation_token();
        f.api.on_request(move |method, _| {
            if method == Method::Post {
                token.cancel();
            }
        });

        let result = f.engine.run_full_sync(SyncOptions::default()).await.unwrap();

        assert!(result.cancelled);
        assert!(!result.success);
        assert_eq!(result.items_synced, 1);
        assert_eq!(f.api.calls_to(Method::Post, "/visits"), 1);
        assert_eq!(f.api.calls_to(Method::Get, "/visits/changes"), 0);
        assert_eq!(f.store.last_sync().await.unwrap(), None);
        assert_eq!(f.engine.state(), SyncState::Idle);
        assert_eq!(f.notifier.titles(), vec!["Sync cancelled".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_is_cleared_for_next_run() {
        let f = fixture().await;
        f.engine.cancel_sync();
        let id = f.store.put("visit", json!({}), None).await.unwrap();

        let result = f.engine.run_full_sync(SyncOptions::default()).await.unwrap();

        assert!(!result.cancelled);
        assert_eq!(f.status(&id).await, SyncStatus::Synced);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn download_error_keeps_previous_watermark() {
        let f = fixture().await;
        f.store.set_last_sync(42).await.unwrap();
        f.api.respond(
            Method::Get,
            "/visits/changes",
            ApiResponse::failure(500, "down"),
        );

        let result = f.engine.run_full_sync(SyncOptions::default()).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(f.store.last_sync().await.unwrap(), Some(42));
        assert_eq!(
            f.notifier.titles(),
            vec!["Sync finished with errors".to_string()]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn force_sync_reuploads_synced_records() {
        let f = fixture().await;
        let id = f.store.put("visit", json!({}), None).await.unwrap();
        f.engine.run_full_sync(SyncOptions::default()).await.unwrap();

        let result = f
            .engine
            .run_full_sync(SyncOptions::default().forced())
            .await
            .unwrap();

        assert_eq!(result.items_synced, 1);
        assert_eq!(f.api.calls_to(Method::Put, &format!("/visits/{id}")), 1);
        assert_eq!(f.status(&id).await, SyncStatus::Synced);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn quick_sync_uploads_only_named_records() {
        let f = fixture().await;
        let first = f.store.put("visit", json!({"n": 1}), None).await.unwrap();
        let second = f.store.put("visit", json!({"n": 2}), None).await.unwrap();

        let result = f.engine.run_quick_sync(&[first.clone()]).await.unwrap();

        assert!(result.success);
        assert_eq!(result.items_synced, 1);
        assert_eq!(f.status(&first).await, SyncStatus::Synced);
        assert_eq!(f.status(&second).await, SyncStatus::Local);
        assert_eq!(f.store.last_sync().await.unwrap(), None);
        assert_eq!(f.engine.state(), SyncState::Idle);
        assert!(f.notifier.sent().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn quick_sync_skips_record_already_in_flight() {
        let f = fixture().await;
        let id = f.store.put("visit", json!({"n": 1}), None).await.unwrap();
        assert!(f.store.begin_upload(&id).await.unwrap());
        f.store.put("visit", json!({"n": 2}), Some(&id)).await.unwrap();
        assert_eq!(f.status(&id).await, SyncStatus::Syncing);

        let result = f.engine.run_quick_sync(&[id.clone()]).await.unwrap();

        assert_eq!(result.items_synced, 0);
        assert!(f.api.calls().is_empty());
        assert_eq!(
            f.store
                .pending_count(&DequeueFilter::default())
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn quick_sync_reports_failures() {
        let f = fixture().await;
        let id = f.store.put("visit", json!({}), None).await.unwrap();
        f.api.respond(Method::Post, "/visits", ApiResponse::failure(422, "bad"));

        let result = f.engine.run_quick_sync(&[id.clone()]).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.items_failed, 1);
        assert_eq!(f.status(&id).await, SyncStatus::Error);
        assert_eq!(
            f.notifier.titles(),
            vec!["Quick sync finished with errors".to_string()]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn quick_sync_offline_leaves_state_alone() {
        let f = fixture().await;
        f.api.set_online(false);

        let result = f.engine.run_quick_sync(&[RecordId::from("visit_x")]).await;

        assert!(matches!(result, Err(Error::Offline)));
        assert_eq!(f.engine.state(), SyncState::Idle);
        assert_eq!(f.notifier.titles(), vec!["Quick sync failed".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn progress_ends_at_complete() {
        let f = fixture().await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _subscription = f
            .engine
            .subscribe_progress(move |progress| sink.lock().push(progress.clone()));
        f.store.put("visit", json!({}), None).await.unwrap();

        f.engine.run_full_sync(SyncOptions::default()).await.unwrap();

        let current = f.engine.current_progress();
        assert_eq!(current.state, SyncState::Idle);
        assert_eq!(current.percent, 100);
        assert_eq!(f.engine.progress_receiver().borrow().percent, 100);

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if seen.lock().last().is_some_and(|p| p.percent == 100) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let percents: Vec<u8> = seen.lock().iter().map(|p| p.percent).collect();
        assert!(percents.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn statistics_track_runs() {
        let f = fixture().await;
        f.store.put("visit", json!({}), None).await.unwrap();
        f.store.put("visit", json!({}), None).await.unwrap();
        f.engine.run_full_sync(SyncOptions::default()).await.unwrap();
        f.api.set_online(false);
        let _ = f.engine.run_full_sync(SyncOptions::default()).await;

        let stats = f.engine.statistics().await.unwrap();

        assert_eq!(stats.state, SyncState::Failed);
        assert_eq!(stats.runs_completed, 1);
        assert_eq!(stats.runs_failed, 1);
        assert_eq!(stats.pending_uploads, 0);
        assert_eq!(stats.open_conflicts, 0);
        assert_eq!(stats.storage.synced_items, 2);
        assert_eq!(stats.last_result.map(|r| r.items_synced), Some(2));
        assert_eq!(stats.last_error.as_deref(), Some("Device is offline"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_engine_can_run_again() {
        let f = fixture().await;
        f.api.set_online(false);
        let _ = f.engine.run_full_sync(SyncOptions::default()).await;
        f.api.set_online(true);

        let result = f.engine.run_full_sync(SyncOptions::default()).await;

        assert!(result.is_ok());
        assert_eq!(f.engine.state(), SyncState::Idle);
    }

    async fn wait_for_status(f: &Fixture, id: &RecordId, status: SyncStatus) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while f.status(id).await != status {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn auto_sync_runs_and_stops() {
        let f = fixture().await;
        let id = f.store.put("visit", json!({}), None).await.unwrap();

        let handle = f
            .engine
            .spawn_auto_sync(Duration::from_secs(3600), Duration::from_millis(10));
        wait_for_status(&f, &id, SyncStatus::Synced).await;
        handle.stop().await;

        let later = f.store.put("visit", json!({}), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.status(&later).await, SyncStatus::Local);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn auto_sync_runs_when_connectivity_returns() {
        let f = fixture().await;
        f.api.set_online(false);
        let id = f.store.put("visit", json!({}), None).await.unwrap();

        let _handle = f
            .engine
            .spawn_auto_sync(Duration::from_secs(3600), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.status(&id).await, SyncStatus::Local);
        assert!(f.notifier.sent().is_empty());

        f.api.set_online(true);
        wait_for_status(&f, &id, SyncStatus::Synced).await;
    }
}
