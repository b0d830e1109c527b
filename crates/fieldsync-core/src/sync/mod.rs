//! Sync engine: upload queue draining, incremental download, conflicts.

mod api;
mod batch;
mod cancel;
mod claims;
mod conflict;
mod engine;
mod http;
mod options;
mod progress;
mod retry;
#[cfg(test)]
pub mod testing;

pub use api::{
    ApiResponse, Connectivity, EndpointMap, Method, Notifier, RemoteApi, StaticConnectivity,
    TracingNotifier,
};
pub use batch::{BatchSynchronizer, DownloadReport, PushOutcome, UploadReport, UploadSettings};
pub use cancel::CancellationToken;
pub use claims::{ClaimSet, ItemClaim};
pub use conflict::{ConflictResolver, ResolutionOutcome, ResolutionReport};
pub use engine::{AutoSyncHandle, SyncEngine};
pub use http::HttpRemoteApi;
pub use options::{ConflictStrategy, Resolution, SyncOptions, SyncResult, SyncStatistics};
pub use progress::{bands, ProgressReporter, ProgressSubscription, SyncProgress, SyncState};
pub use retry::RetryPolicy;
