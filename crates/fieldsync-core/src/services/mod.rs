//! Services shared by the sync engine and client binaries.

mod store;

pub use store::{LocalStore, RemoteApplyOutcome, StorageStats, UploadCompletion};
