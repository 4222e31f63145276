use serde::{Deserialize, Serialize};

use uploadflow_infra::UploadRecord;

// -------------------------
// Request DTOs
// -------------------------

/// `POST /uploads`. Types are checked by serde; values by `NewUpload::validate`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUploadRequest {
    #[serde(default)]
    pub file_id: Option<String>,
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReprocessRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListUploadsQuery {
    pub user_id: Option<String>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct UploadListResponse {
    pub items: Vec<UploadRecord>,
    pub count: usize,
}

impl From<Vec<UploadRecord>> for UploadListResponse {
    fn from(items: Vec<UploadRecord>) -> Self {
        Self {
            count: items.len(),
            items,
        }
    }
}
