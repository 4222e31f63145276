//! Versioned command contracts issued by the upload gateway.
//!
//! Message `type` tags carry a literal `.vN` suffix. Fields may be added
//! within a version; anything breaking ships as `vN+1` alongside the old type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const UPLOAD_REQUESTED: &str = "UploadRequested";
pub const REPROCESS_FILE_REQUESTED: &str = "ReprocessFileRequested";

pub const UPLOAD_REQUESTED_V1: &str = "UploadRequested.v1";
pub const REPROCESS_FILE_REQUESTED_V1: &str = "ReprocessFileRequested.v1";

/// `("UploadRequested", 1)` → `"UploadRequested.v1"`.
pub fn versioned_type(name: &str, version: u32) -> String {
    format!("{name}.v{version}")
}

/// Split a versioned type tag into its name and version.
pub fn parse_versioned_type(tag: &str) -> Option<(&str, u32)> {
    let (name, version) = tag.rsplit_once(".v")?;
    let version: u32 = version.parse().ok()?;
    if name.is_empty() || version == 0 {
        return None;
    }
    Some((name, version))
}

/// Payload of `UploadRequested.v1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequestedV1 {
    pub file_id: String,
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub user_id: String,
    pub user_name: String,
    pub requested_at: DateTime<Utc>,
}

/// Payload of `ReprocessFileRequested.v1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReprocessFileRequestedV1 {
    pub file_id: String,
    pub requested_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub requested_at: DateTime<Utc>,
}
