//! Database layer for FieldSync

mod attachment_repository;
mod conflict_repository;
mod connection;
mod metadata_repository;
mod migrations;
mod queue_repository;
mod record_repository;
mod values;

pub use attachment_repository::{AttachmentRepository, LibSqlAttachmentRepository};
pub use conflict_repository::{ConflictRepository, LibSqlConflictRepository};
pub use connection::Database;
pub use metadata_repository::{LibSqlMetadataRepository, MetadataRepository, LAST_SYNC_KEY};
pub use queue_repository::{LibSqlQueueRepository, QueueRepository};
pub use record_repository::{
    LibSqlRecordRepository, OrderBy, RecordQuery, RecordRepository, SortDirection, StatusCounts,
};
