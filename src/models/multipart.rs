//! Multipart upload sessions and their staged parts, as the local provider
//! tracks them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// An open multipart session. The row disappears on completion or abort.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct MultipartUpload {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Opaque session identifier handed to clients.
    pub upload_id: String,

    /// Object key the session will produce.
    pub key: String,

    /// Content type captured at open time.
    pub content_type: String,

    /// Timestamp when the session was opened.
    pub initiated_at: DateTime<Utc>,
}

/// A single staged part within an open session.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct MultipartPart {
    pub id: Uuid,

    /// Session the part belongs to.
    pub upload_id: String,

    /// Part number (1-based).
    pub part_number: i64,

    /// Size in bytes.
    pub size_bytes: i64,

    /// Unquoted MD5 of the part payload.
    pub etag: String,

    pub uploaded_at: DateTime<Utc>,
}
