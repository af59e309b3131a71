//! Represents a finished object held by the local storage provider.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A durable object, addressable by its key.
///
/// Only the metadata lives here; the payload sits on disk under the
/// provider's sharded object directory.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Object {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Object key (path-like identifier, e.g. `events/e1/media/ab12_17000.jpg`).
    pub key: String,

    /// Last path segment of the key.
    pub filename: String,

    /// Content type (MIME type).
    pub content_type: Option<String>,

    /// Size in bytes.
    pub size_bytes: i64,

    /// Unquoted MD5 for single PUTs, `{md5}-{parts}` for multipart objects.
    pub etag: Option<String>,

    /// Timestamp when object was last written.
    pub last_modified: DateTime<Utc>,
}
