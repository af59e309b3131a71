//! src/services/storage_service.rs
//!
//! StorageService: the local object-storage provider. Multipart sessions,
//! staged parts, object rows and object metadata live in SQLite; payloads
//! live on disk. Finished objects are sharded beneath
//! `base_path/objects/{shard}/{shard}/{key}`, staged parts beneath
//! `base_path/.multipart/{upload_id}/{part_number}`.

use crate::{
    models::{
        metadata::ObjectMetadata,
        multipart::{MultipartPart, MultipartUpload},
        object::Object,
        session::{CompletedObject, OpenedSession, PartToken, SessionMetadata},
    },
    services::{
        object_storage::{ObjectStorage, ProviderError, ProviderResult},
        part_planner::MIN_PART_SIZE,
        url_signer::{SignedTarget, UrlSigner},
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use sqlx::SqlitePool;
use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object `{0}` not found")]
    ObjectNotFound(String),
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl From<StorageError> for ProviderError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Provider(inner) => inner,
            StorageError::ObjectNotFound(key) => ProviderError::NoSuchKey(key),
            other => ProviderError::Unavailable(other.to_string()),
        }
    }
}

/// StorageService provides the provider side of the upload protocol:
/// - open / complete / abort multipart sessions
/// - accept part and whole-object PUTs arriving through signed URLs
/// - serve finished objects
#[derive(Clone)]
pub struct StorageService {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where payloads are stored.
    pub base_path: PathBuf,

    signer: UrlSigner,

    /// Floor for every part except the last, checked at completion.
    min_part_size: u64,
}

const MAX_OBJECT_KEY_LEN: usize = 1024;

impl StorageService {
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>, signer: UrlSigner) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            signer,
            min_part_size: MIN_PART_SIZE,
        }
    }

    pub fn signer(&self) -> &UrlSigner {
        &self.signer
    }

    /// Basic key validation to avoid trivial path traversal vectors.
    ///
    /// Rejects keys that begin with `/` or contain `..`, control characters
    /// or backslashes.
    fn ensure_key_safe(&self, key: &str) -> StorageResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(StorageError::InvalidObjectKey);
        }
        if key.starts_with('/') || key.contains("..") {
            return Err(StorageError::InvalidObjectKey);
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(StorageError::InvalidObjectKey);
        }
        Ok(())
    }

    /// Generate two-level shard identifiers for an object key.
    ///
    /// Uses MD5(key) and returns the first two bytes as lowercase hex.
    fn object_shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(key);
        let mut path = self.base_path.join("objects");
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    fn parts_dir(&self, upload_id: &str) -> PathBuf {
        self.base_path.join(".multipart").join(upload_id)
    }

    fn part_path(&self, upload_id: &str, part_number: u32) -> PathBuf {
        self.parts_dir(upload_id)
            .join(format!("{:05}", part_number))
    }

    async fn fetch_object(&self, key: &str) -> StorageResult<Object> {
        sqlx::query_as::<_, Object>(
            "SELECT id, key, filename, content_type, size_bytes, etag, last_modified
             FROM objects WHERE key = ?",
        )
        .bind(key)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::ObjectNotFound(key.to_string()),
            other => StorageError::Sqlx(other),
        })
    }

    /// Fetch an open session; a missing row or a key mismatch both mean the
    /// session is gone as far as the caller is concerned.
    async fn fetch_session(&self, key: &str, upload_id: &str) -> StorageResult<MultipartUpload> {
        sqlx::query_as::<_, MultipartUpload>(
            "SELECT id, upload_id, key, content_type, initiated_at
             FROM multipart_uploads WHERE upload_id = ? AND key = ?",
        )
        .bind(upload_id)
        .bind(key)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => {
                ProviderError::NoSuchUpload(upload_id.to_string()).into()
            }
            other => StorageError::Sqlx(other),
        })
    }

    /// Stream bytes into `dest` through a temp file in the same directory.
    ///
    /// Returns size and hex MD5. The temp file is removed on any error.
    async fn write_stream_atomic<S>(&self, dest: &Path, stream: S) -> StorageResult<(i64, String)>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let parent = dest.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "payload path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: i64 = 0;
        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(StorageError::Io(err));
                }
            };
            size_bytes += chunk.len() as i64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        drop(file);

        if let Err(err) = fs::rename(&tmp_path, dest).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(dest).await?;
                fs::rename(&tmp_path, dest).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        }

        Ok((size_bytes, format!("{:x}", digest.compute())))
    }

    /// Store one part of an open session.
    ///
    /// Re-uploading a part number replaces the earlier payload and ETag.
    pub async fn put_part_stream<S>(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        stream: S,
    ) -> StorageResult<MultipartPart>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        self.ensure_key_safe(key)?;
        self.fetch_session(key, upload_id).await?;

        let path = self.part_path(upload_id, part_number);
        let (size_bytes, etag) = match self.write_stream_atomic(&path, stream).await {
            Ok(written) => written,
            // abort and completion remove the staging directory under the writer
            Err(err) => {
                return match self.fetch_session(key, upload_id).await {
                    Err(gone @ StorageError::Provider(ProviderError::NoSuchUpload(_))) => {
                        self.discard_staged_part(upload_id, &path).await;
                        Err(gone)
                    }
                    _ => Err(err),
                };
            }
        };

        // The session may have been completed or aborted while the body was
        // streaming, so the row is only written if it still exists.
        let stored = sqlx::query_as::<_, MultipartPart>(
            r#"
            INSERT INTO multipart_parts (id, upload_id, part_number, size_bytes, etag, uploaded_at)
            SELECT ?, ?, ?, ?, ?, ?
            WHERE EXISTS (SELECT 1 FROM multipart_uploads WHERE upload_id = ? AND key = ?)
            ON CONFLICT(upload_id, part_number) DO UPDATE SET
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                uploaded_at = excluded.uploaded_at
            RETURNING id, upload_id, part_number, size_bytes, etag, uploaded_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(upload_id)
        .bind(i64::from(part_number))
        .bind(size_bytes)
        .bind(&etag)
        .bind(Utc::now())
        .bind(upload_id)
        .bind(key)
        .fetch_optional(&*self.db)
        .await;

        match stored {
            Ok(Some(part)) => {
                debug!(upload_id, part_number, size_bytes, "stored part");
                Ok(part)
            }
            Ok(None) => {
                self.discard_staged_part(upload_id, &path).await;
                debug!(upload_id, part_number, "session closed during part upload");
                Err(ProviderError::NoSuchUpload(upload_id.to_string()).into())
            }
            Err(err) => {
                self.discard_staged_part(upload_id, &path).await;
                Err(StorageError::Sqlx(err))
            }
        }
    }

    /// Stream-upload a whole object (single PUT path), overwriting any
    /// previous object at the key.
    pub async fn put_object_stream<S>(
        &self,
        key: &str,
        content_type: Option<String>,
        stream: S,
    ) -> StorageResult<Object>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        self.ensure_key_safe(key)?;
        let file_path = self.object_path(key);
        let (size_bytes, etag) = self.write_stream_atomic(&file_path, stream).await?;

        let insert_result = self
            .upsert_object(key, content_type, size_bytes, &etag)
            .await;
        match insert_result {
            Ok(obj) => Ok(obj),
            Err(err) => {
                let _ = fs::remove_file(&file_path).await;
                Err(StorageError::Sqlx(err))
            }
        }
    }

    async fn upsert_object(
        &self,
        key: &str,
        content_type: Option<String>,
        size_bytes: i64,
        etag: &str,
    ) -> Result<Object, sqlx::Error> {
        let filename = key.rsplit('/').next().unwrap_or(key).to_string();
        sqlx::query_as::<_, Object>(
            r#"
            INSERT INTO objects (id, key, filename, content_type, size_bytes, etag, last_modified)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                filename = excluded.filename,
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                last_modified = excluded.last_modified
            RETURNING id, key, filename, content_type, size_bytes, etag, last_modified
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(key)
        .bind(&filename)
        .bind(content_type)
        .bind(size_bytes)
        .bind(etag)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await
    }

    /// Fetch an object for reading.
    ///
    /// Returns metadata and an opened File handle ready for streaming out.
    /// Returns ObjectNotFound if metadata exists but physical file is missing.
    pub async fn get_object_reader(&self, key: &str) -> StorageResult<(Object, File)> {
        self.ensure_key_safe(key)?;
        let object = self.fetch_object(key).await?;

        let file = File::open(self.object_path(key)).await.map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                StorageError::ObjectNotFound(key.to_string())
            } else {
                StorageError::Io(err)
            }
        })?;

        Ok((object, file))
    }

    /// Fetch only object metadata.
    pub async fn get_object_metadata(&self, key: &str) -> StorageResult<Object> {
        self.ensure_key_safe(key)?;
        self.fetch_object(key).await
    }

    /// Metadata declared when the object's session was opened.
    pub async fn list_object_metadata(&self, key: &str) -> StorageResult<Vec<ObjectMetadata>> {
        let rows = sqlx::query_as::<_, ObjectMetadata>(
            "SELECT id, object_key, name, value FROM object_metadata
             WHERE object_key = ? ORDER BY name",
        )
        .bind(key)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[PartToken],
    ) -> StorageResult<CompletedObject> {
        self.ensure_key_safe(key)?;
        let session = self.fetch_session(key, upload_id).await?;

        if parts.is_empty()
            || parts
                .windows(2)
                .any(|pair| pair[0].part_number >= pair[1].part_number)
        {
            return Err(ProviderError::InvalidPartOrder.into());
        }

        let planned = sqlx::query_scalar::<_, String>(
            "SELECT value FROM object_metadata WHERE object_key = ? AND name = 'part-count'",
        )
        .bind(key)
        .fetch_optional(&*self.db)
        .await?
        .and_then(|value| value.parse::<u32>().ok());
        if let Some(expected) = planned {
            if !parts.iter().map(|token| token.part_number).eq(1..=expected) {
                return Err(ProviderError::IncompleteParts {
                    expected,
                    listed: parts.len(),
                }
                .into());
            }
        }

        let stored: HashMap<i64, MultipartPart> = sqlx::query_as::<_, MultipartPart>(
            "SELECT id, upload_id, part_number, size_bytes, etag, uploaded_at
             FROM multipart_parts WHERE upload_id = ?",
        )
        .bind(upload_id)
        .fetch_all(&*self.db)
        .await?
        .into_iter()
        .map(|part| (part.part_number, part))
        .collect();

        let last_index = parts.len() - 1;
        let mut manifest = Vec::with_capacity(parts.len());
        for (index, token) in parts.iter().enumerate() {
            let part = stored
                .get(&i64::from(token.part_number))
                .filter(|part| part.etag == token.e_tag.trim_matches('"'))
                .ok_or(ProviderError::InvalidPart {
                    part_number: token.part_number,
                })?;
            if index < last_index && (part.size_bytes as u64) < self.min_part_size {
                return Err(ProviderError::EntityTooSmall {
                    part_number: token.part_number,
                }
                .into());
            }
            manifest.push((token.part_number, part));
        }

        // Assemble into the object path through a temp file.
        let file_path = self.object_path(key);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let assembled = self
            .concat_parts(&tmp_path, upload_id, &manifest)
            .await;
        let size_bytes = match assembled {
            Ok(size) => size,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        };
        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }

        let mut digest = Context::new();
        for (_, part) in &manifest {
            digest.consume(decode_hex(&part.etag));
        }
        let etag = format!("{:x}-{}", digest.compute(), manifest.len());

        let mut tx = self.db.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO objects (id, key, filename, content_type, size_bytes, etag, last_modified)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                filename = excluded.filename,
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                last_modified = excluded.last_modified
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(key)
        .bind(key.rsplit('/').next().unwrap_or(key))
        .bind(&session.content_type)
        .bind(size_bytes)
        .bind(&etag)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM multipart_parts WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM multipart_uploads WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.remove_parts_dir(upload_id).await;
        info!(key, upload_id, parts = manifest.len(), size_bytes, "completed multipart upload");

        Ok(CompletedObject {
            location: self.public_url(key),
            e_tag: format!("\"{}\"", etag),
            key: key.to_string(),
        })
    }

    async fn concat_parts(
        &self,
        dest: &Path,
        upload_id: &str,
        manifest: &[(u32, &MultipartPart)],
    ) -> StorageResult<i64> {
        let mut out = File::create(dest).await?;
        let mut size_bytes: i64 = 0;
        for (part_number, _) in manifest {
            let mut input = File::open(self.part_path(upload_id, *part_number)).await?;
            size_bytes += tokio::io::copy(&mut input, &mut out).await? as i64;
        }
        out.flush().await?;
        out.sync_all().await?;
        Ok(size_bytes)
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> StorageResult<()> {
        let result = sqlx::query("DELETE FROM multipart_uploads WHERE upload_id = ? AND key = ?")
            .bind(upload_id)
            .bind(key)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ProviderError::NoSuchUpload(upload_id.to_string()).into());
        }

        sqlx::query("DELETE FROM multipart_parts WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&*self.db)
            .await?;
        sqlx::query(
            "DELETE FROM object_metadata WHERE object_key = ?
             AND NOT EXISTS (SELECT 1 FROM objects WHERE key = ?)",
        )
        .bind(key)
        .bind(key)
        .execute(&*self.db)
        .await?;

        self.remove_parts_dir(upload_id).await;
        info!(key, upload_id, "aborted multipart upload");
        Ok(())
    }

    /// Remove one orphaned part file, and its directory once empty.
    async fn discard_staged_part(&self, upload_id: &str, path: &Path) {
        if let Err(err) = fs::remove_file(path).await {
            if err.kind() != ErrorKind::NotFound {
                debug!("failed to remove staged part {}: {}", path.display(), err);
            }
        }
        let _ = fs::remove_dir(self.parts_dir(upload_id)).await;
    }

    async fn remove_parts_dir(&self, upload_id: &str) {
        let dir = self.parts_dir(upload_id);
        match fs::remove_dir_all(&dir).await {
            Ok(_) => debug!("removed staged parts {}", dir.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => debug!("failed to remove staged parts {}: {}", dir.display(), err),
        }
    }

    fn expires_at(ttl: Duration) -> i64 {
        Utc::now().timestamp() + i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX / 2)
    }
}

#[async_trait]
impl ObjectStorage for StorageService {
    async fn open_session(
        &self,
        key: &str,
        content_type: &str,
        metadata: &SessionMetadata,
    ) -> ProviderResult<OpenedSession> {
        self.ensure_key_safe(key)?;
        let session_id = Uuid::new_v4().simple().to_string();

        let mut tx = self
            .db
            .begin()
            .await
            .map_err(|err| ProviderError::Unavailable(err.to_string()))?;
        sqlx::query(
            "INSERT INTO multipart_uploads (id, upload_id, key, content_type, initiated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4())
        .bind(&session_id)
        .bind(key)
        .bind(content_type)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(|err| ProviderError::Unavailable(err.to_string()))?;

        for (name, value) in metadata.to_pairs() {
            sqlx::query(
                "INSERT INTO object_metadata (id, object_key, name, value) VALUES (?, ?, ?, ?)
                 ON CONFLICT(object_key, name) DO UPDATE SET value = excluded.value",
            )
            .bind(Uuid::new_v4())
            .bind(key)
            .bind(name)
            .bind(value)
            .execute(&mut *tx)
            .await
            .map_err(|err| ProviderError::Unavailable(err.to_string()))?;
        }
        tx.commit()
            .await
            .map_err(|err| ProviderError::Unavailable(err.to_string()))?;

        info!(key, session_id, "opened multipart upload");
        Ok(OpenedSession { session_id })
    }

    fn sign_part_upload(
        &self,
        key: &str,
        session_id: &str,
        part_number: u32,
        ttl: Duration,
    ) -> ProviderResult<String> {
        self.signer.sign(
            key,
            SignedTarget::Part {
                upload_id: session_id,
                part_number,
            },
            Self::expires_at(ttl),
        )
    }

    fn sign_object_upload(
        &self,
        key: &str,
        content_type: &str,
        ttl: Duration,
    ) -> ProviderResult<String> {
        self.signer.sign(
            key,
            SignedTarget::Object { content_type },
            Self::expires_at(ttl),
        )
    }

    async fn complete_session(
        &self,
        key: &str,
        session_id: &str,
        parts: &[PartToken],
    ) -> ProviderResult<CompletedObject> {
        Ok(self.complete_multipart(key, session_id, parts).await?)
    }

    async fn abort_session(&self, key: &str, session_id: &str) -> ProviderResult<()> {
        Ok(self.abort_multipart(key, session_id).await?)
    }

    async fn object_exists(&self, key: &str) -> ProviderResult<bool> {
        match self.get_object_metadata(key).await {
            Ok(_) => Ok(true),
            Err(StorageError::ObjectNotFound(_)) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn public_url(&self, key: &str) -> String {
        self.signer
            .object_url(key)
            .map(String::from)
            .unwrap_or_else(|_| format!("/storage/{}", key))
    }
}

/// Decode a lowercase hex digest; non-hex input yields its raw bytes.
fn decode_hex(hex: &str) -> Vec<u8> {
    if hex.len() % 2 != 0 {
        return hex.as_bytes().to_vec();
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16))
        .collect::<Result<Vec<_>, _>>()
        .unwrap_or_else(|_| hex.as_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_hex_round_trips_md5() {
        let digest = md5::compute(b"part");
        let hex = format!("{:x}", digest);
        assert_eq!(decode_hex(&hex), digest.0.to_vec());
    }

    #[test]
    fn shards_are_stable_two_hex_bytes() {
        let (a, b) = StorageService::object_shards("events/e/media/x_1.jpg");
        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 2);
        assert_eq!(
            (a, b),
            StorageService::object_shards("events/e/media/x_1.jpg")
        );
    }
}
