//! Infrastructure layer: broker publishing, broker transports, lifecycle storage.

pub mod broker;
pub mod lifecycle;
pub mod publisher;

pub use lifecycle::{InMemoryLifecycleStore, UploadLifecycleStore, UploadRecord, UploadStatus};
pub use publisher::{CommandPublisher, PublishError, PublisherConfig, PublisherState};
