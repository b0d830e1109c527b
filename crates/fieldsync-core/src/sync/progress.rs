//! Sync state machine states and progress publication.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Orchestrator state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    #[default]
    Idle,
    Preparing,
    Uploading,
    Downloading,
    ResolvingConflicts,
    Completing,
    Failed,
}

impl SyncState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Preparing => "PREPARING",
            Self::Uploading => "UPLOADING",
            Self::Downloading => "DOWNLOADING",
            Self::ResolvingConflicts => "RESOLVING_CONFLICTS",
            Self::Completing => "COMPLETING",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest progress of the running (or last) sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub state: SyncState,
    /// Overall completion, 0-100
    pub percent: u8,
    /// Items handled in the current phase
    pub processed: u64,
    /// Items expected in the current phase
    pub total: u64,
    pub message: String,
}

impl SyncProgress {
    pub fn new(state: SyncState, percent: u8, message: impl Into<String>) -> Self {
        Self {
            state,
            percent: percent.min(100),
            processed: 0,
            total: 0,
            message: message.into(),
        }
    }

    /// Progress within the `[start, end]` percent band of a phase.
    pub fn in_band(
        state: SyncState,
        (start, end): (u8, u8),
        processed: u64,
        total: u64,
        message: impl Into<String>,
    ) -> Self {
        let span = u64::from(end.saturating_sub(start));
        let offset = if total == 0 {
            0
        } else {
            span * processed.min(total) / total
        };
        let percent = u8::try_from(u64::from(start) + offset).unwrap_or(100);
        Self {
            state,
            percent: percent.min(100),
            processed,
            total,
            message: message.into(),
        }
    }
}

/// Percent bands of the run phases.
pub mod bands {
    pub const UPLOAD: (u8, u8) = (0, 50);
    pub const DOWNLOAD: (u8, u8) = (50, 75);
    pub const RESOLVE: (u8, u8) = (75, 90);
    pub const COMPLETE: u8 = 100;
}

/// Non-blocking latest-value publisher.
///
/// Slow observers only ever see the newest value; the engine never waits
/// on them.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: watch::Sender<SyncProgress>,
}

impl ProgressReporter {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SyncProgress::default());
        Self { tx }
    }

    pub fn publish(&self, progress: SyncProgress) {
        tracing::trace!(
            "Sync progress {}% ({}): {}",
            progress.percent,
            progress.state,
            progress.message
        );
        self.tx.send_replace(progress);
    }

    pub fn current(&self) -> SyncProgress {
        self.tx.borrow().clone()
    }

    pub fn receiver(&self) -> watch::Receiver<SyncProgress> {
        self.tx.subscribe()
    }

    /// Run `callback` on every published update until the handle is dropped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe<F>(&self, callback: F) -> ProgressSubscription
    where
        F: Fn(&SyncProgress) + Send + 'static,
    {
        let mut rx = self.tx.subscribe();
        let handle = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let progress = rx.borrow_and_update().clone();
                callback(&progress);
            }
        });
        ProgressSubscription {
            handle: Some(handle),
        }
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle of a callback subscription; unsubscribes on drop.
#[derive(Debug)]
pub struct ProgressSubscription {
    handle: Option<JoinHandle<()>>,
}

impl ProgressSubscription {
    pub fn unsubscribe(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for ProgressSubscription {
    fn drop(&mut self) {
        self.stop();
    }
}
