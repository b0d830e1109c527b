pub mod attach;
pub mod common;
pub mod conflicts;
pub mod delete;
pub mod get;
pub mod list;
pub mod put;
pub mod stats;
pub mod sync;
