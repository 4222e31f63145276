//! Upload lifecycle tracking.
//!
//! One record per upload (`file_id`) with its current status and an
//! append-only timeline of every command issued against it.

pub mod in_memory;
pub mod store;

pub use in_memory::InMemoryLifecycleStore;
pub use store::{
    IssuedCommand, ReprocessRequested, StoreError, TimelineItem, UploadLifecycleStore, UploadRecord,
    UploadRequested, UploadStatus,
};
