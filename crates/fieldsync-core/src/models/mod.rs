//! Data models for FieldSync

mod attachment;
mod conflict;
mod queue;
mod record;
mod remote;

pub use attachment::{Attachment, AttachmentId};
pub use conflict::{Conflict, ConflictType};
pub use queue::{DequeueFilter, DrainedEntry, QueueCursor, QueueEntry, QueueOperation};
pub use record::{payload_checksum, serialize_payload, Record, RecordId, SyncStatus};
pub use remote::RemoteRecord;
