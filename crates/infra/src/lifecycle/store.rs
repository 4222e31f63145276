use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use uploadflow_events::{Envelope, EnvelopeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UploadStatus {
    UploadRequested,
    ReprocessRequested,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::UploadRequested => "upload-requested",
            UploadStatus::ReprocessRequested => "reprocess-requested",
        }
    }
}

/// One command issued against an upload. Never mutated once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineItem {
    pub event_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub correlation_id: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRecord {
    pub file_id: String,
    /// Correlation id of the most recent command.
    pub correlation_id: String,
    pub user_id: String,
    pub user_name: String,
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub status: UploadStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub reprocess_count: u32,
    pub last_command: String,
    pub timeline: Vec<TimelineItem>,
}

/// The published command a lifecycle transition is recorded for.
#[derive(Debug, Clone, PartialEq)]
pub struct IssuedCommand {
    pub message_id: String,
    pub correlation_id: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl IssuedCommand {
    pub fn from_envelope<P: Serialize>(envelope: &Envelope<P>) -> Result<Self, EnvelopeError> {
        Ok(Self {
            message_id: envelope.message_id().to_string(),
            correlation_id: envelope.correlation_id().to_string(),
            occurred_at: envelope.occurred_at(),
            payload: envelope.payload_json()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadRequested {
    pub file_id: String,
    /// Requester; becomes the owner when the record is created.
    pub user_id: String,
    pub user_name: String,
    /// Admins may re-announce uploads they do not own.
    pub requester_is_admin: bool,
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub command: IssuedCommand,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReprocessRequested {
    pub file_id: String,
    pub command: IssuedCommand,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backing storage could not be reached.
    #[error("lifecycle store unavailable: {0}")]
    Unavailable(String),

    /// The upload exists and belongs to someone other than the requester.
    #[error("upload {file_id} is owned by another user")]
    NotOwner { file_id: String },
}

/// Upload lifecycle state, keyed by `file_id`.
///
/// Implementations must serialize mutations per key: two concurrent writes to
/// the same upload never interleave partial updates. The in-memory store is
/// the reference; a durable backend can be substituted behind this trait.
pub trait UploadLifecycleStore: Send + Sync {
    /// Create the record (status `upload-requested`, `reprocess_count = 0`) or
    /// update it in place. Always appends an `UploadRequested.v1` entry.
    ///
    /// The owner is fixed at creation. Updating a record owned by someone
    /// else fails with [`StoreError::NotOwner`] unless the requester is an
    /// admin; the ownership check and the write happen atomically.
    fn upsert_requested(&self, input: UploadRequested) -> Result<UploadRecord, StoreError>;

    /// Move to `reprocess-requested`, bump `reprocess_count` and append a
    /// `ReprocessFileRequested.v1` entry. Unknown uploads get placeholder
    /// metadata instead of an error.
    fn mark_reprocess_requested(&self, input: ReprocessRequested) -> Result<UploadRecord, StoreError>;

    fn get_by_id(&self, file_id: &str) -> Result<Option<UploadRecord>, StoreError>;

    /// Non-admins see their own records; admins see everything, optionally
    /// narrowed to `user_id_filter`. Most recently updated first.
    fn list(
        &self,
        requester_user_id: &str,
        is_admin: bool,
        user_id_filter: Option<&str>,
    ) -> Result<Vec<UploadRecord>, StoreError>;
}

impl<S> UploadLifecycleStore for std::sync::Arc<S>
where
    S: UploadLifecycleStore + ?Sized,
{
    fn upsert_requested(&self, input: UploadRequested) -> Result<UploadRecord, StoreError> {
        (**self).upsert_requested(input)
    }

    fn mark_reprocess_requested(&self, input: ReprocessRequested) -> Result<UploadRecord, StoreError> {
        (**self).mark_reprocess_requested(input)
    }

    fn get_by_id(&self, file_id: &str) -> Result<Option<UploadRecord>, StoreError> {
        (**self).get_by_id(file_id)
    }

    fn list(
        &self,
        requester_user_id: &str,
        is_admin: bool,
        user_id_filter: Option<&str>,
    ) -> Result<Vec<UploadRecord>, StoreError> {
        (**self).list(requester_user_id, is_admin, user_id_filter)
    }
}
