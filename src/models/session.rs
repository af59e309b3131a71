//! Values that travel through the multipart protocol.
//!
//! No session state is held server-side: an [`UploadSession`] is rebuilt from
//! the `fileKey`/`uploadId` pair on every request and handed to the provider,
//! which is the single source of truth.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Handle to an open provider-side multipart session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    pub session_id: String,
    pub object_key: String,
}

impl UploadSession {
    pub fn new(session_id: impl Into<String>, object_key: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            object_key: object_key.into(),
        }
    }
}

/// Descriptive metadata captured when a session opens and stored by the
/// provider alongside the object.
#[derive(Debug, Clone)]
pub struct SessionMetadata {
    /// Original file name, already reduced to a safe character set.
    pub original_name: String,
    pub event_id: String,
    pub uploader_id: Option<String>,
    pub file_size: u64,
    pub uploaded_at: DateTime<Utc>,
    /// Present for multipart sessions only.
    pub part_size: Option<u64>,
    pub part_count: Option<u32>,
}

impl SessionMetadata {
    /// Flatten into provider metadata pairs.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("original-name", self.original_name.clone()),
            ("event-id", self.event_id.clone()),
            (
                "uploader-id",
                self.uploader_id
                    .clone()
                    .unwrap_or_else(|| "anonymous".into()),
            ),
            ("file-size", self.file_size.to_string()),
            ("uploaded-at", self.uploaded_at.to_rfc3339()),
        ];
        if let Some(part_size) = self.part_size {
            pairs.push(("part-size", part_size.to_string()));
        }
        if let Some(part_count) = self.part_count {
            pairs.push(("part-count", part_count.to_string()));
        }
        pairs
    }
}

/// Completion token for one uploaded part.
///
/// Serialized with the provider's field names because the completion body
/// forwards these verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartToken {
    #[serde(rename = "PartNumber")]
    pub part_number: u32,
    #[serde(rename = "ETag")]
    pub e_tag: String,
}

impl PartToken {
    pub fn new(part_number: u32, e_tag: impl Into<String>) -> Self {
        Self {
            part_number,
            e_tag: e_tag.into(),
        }
    }
}

/// Result of opening a provider session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedSession {
    pub session_id: String,
}

/// Result of finalizing a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedObject {
    pub location: String,
    /// Quoted ETag of the assembled object.
    pub e_tag: String,
    pub key: String,
}

/// A pre-signed URL for one part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPartUrl {
    pub part_number: u32,
    pub url: String,
}
