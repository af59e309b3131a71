//! Object storage control plane as the upload path consumes it.
//!
//! Implementations return typed results and typed failures so the upload
//! service can tell "restart this part" from "restart the whole upload".

use crate::models::session::{CompletedObject, OpenedSession, PartToken, SessionMetadata};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Session expired, already completed, or already aborted.
    #[error("upload `{0}` does not exist")]
    NoSuchUpload(String),
    #[error("object `{0}` does not exist")]
    NoSuchKey(String),
    /// A listed ETag does not match what the provider stored for that slot.
    #[error("part {part_number} is missing or its etag does not match")]
    InvalidPart { part_number: u32 },
    #[error("parts must be listed in strictly ascending order")]
    InvalidPartOrder,
    /// The manifest does not list every planned part exactly once.
    #[error("expected parts 1..={expected}, got {listed}")]
    IncompleteParts { expected: u32, listed: usize },
    #[error("part {part_number} is smaller than the minimum part size")]
    EntityTooSmall { part_number: u32 },
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("{0}")]
    Unavailable(String),
}

pub type ProviderResult<T> = Result<T, ProviderError>;

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Open a multipart session for `key`.
    async fn open_session(
        &self,
        key: &str,
        content_type: &str,
        metadata: &SessionMetadata,
    ) -> ProviderResult<OpenedSession>;

    /// Pre-sign one PUT of `part_number` into an open session.
    fn sign_part_upload(
        &self,
        key: &str,
        session_id: &str,
        part_number: u32,
        ttl: Duration,
    ) -> ProviderResult<String>;

    /// Pre-sign one PUT of a whole object, bound to its content type.
    fn sign_object_upload(
        &self,
        key: &str,
        content_type: &str,
        ttl: Duration,
    ) -> ProviderResult<String>;

    /// Finalize a session from a manifest sorted by part number.
    async fn complete_session(
        &self,
        key: &str,
        session_id: &str,
        parts: &[PartToken],
    ) -> ProviderResult<CompletedObject>;

    /// Discard a session and its staged parts.
    async fn abort_session(&self, key: &str, session_id: &str) -> ProviderResult<()>;

    async fn object_exists(&self, key: &str) -> ProviderResult<bool>;

    fn public_url(&self, key: &str) -> String;
}
