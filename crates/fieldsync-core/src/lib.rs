//! fieldsync-core - Offline-first record sync engine
//!
//! Records are written to a local libSQL store and queued for upload. The
//! [`SyncEngine`] drains the queue, pulls incremental server changes, and
//! routes mismatches to conflict resolution.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod sync;
pub mod util;

pub use config::{EngineConfig, SyncConfig};
pub use error::{Error, Result};
pub use models::{Attachment, AttachmentId, Conflict, ConflictType, Record, RecordId, SyncStatus};
pub use services::{LocalStore, StorageStats};
pub use sync::{
    ConflictStrategy, Resolution, SyncEngine, SyncOptions, SyncProgress, SyncResult, SyncState,
};
