//! JSON bodies of the upload endpoints.
//!
//! Fields that need per-element validation with a precise error (part numbers,
//! completion tokens) are carried as raw [`serde_json::Value`]s and checked by
//! the upload service.

use crate::models::session::SignedPartUrl;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateRequest {
    pub event_id: String,
    pub file_name: String,
    pub file_type: String,
    pub file_size: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateResponse {
    pub upload_id: String,
    pub file_key: String,
    pub file_url: String,
    pub part_size: u64,
    pub part_count: u32,
    pub expires_in: u64,
}

/// Response of the single-PUT path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignResponse {
    pub upload_url: String,
    pub file_key: String,
    pub file_url: String,
    pub expires_in: u64,
}

/// Response of `start`: the server picks the transfer path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "kebab-case")]
pub enum StartUploadResponse {
    SinglePut(PresignResponse),
    Multipart(InitiateResponse),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignPartsRequest {
    pub file_key: String,
    pub upload_id: String,
    pub part_numbers: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignPartsResponse {
    pub urls: Vec<SignedPartUrl>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest {
    pub file_key: String,
    pub upload_id: String,
    pub parts: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteResponse {
    pub location: String,
    pub etag: String,
    pub file_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortRequest {
    pub file_key: String,
    pub upload_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordUploadRequest {
    pub event_id: String,
    pub file_key: String,
    pub file_name: String,
    pub file_type: String,
    pub file_size: i64,
}
