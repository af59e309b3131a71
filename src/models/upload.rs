//! The logical upload record written after a successful completion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// The only database-visible trace of an upload.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UploadRecord {
    pub id: Uuid,
    pub event_id: String,
    pub file_key: String,
    /// Public URL of the finished object.
    pub file_url: String,
    pub file_name: String,
    pub file_type: String,
    pub file_size: i64,
    /// `None` for guest uploads.
    pub uploader_id: Option<String>,
    /// Moderation flag.
    pub approved: bool,
    pub created_at: DateTime<Utc>,
}
