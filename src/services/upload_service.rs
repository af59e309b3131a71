//! Server side of the direct-to-storage upload protocol.
//!
//! `UploadService` authorizes upload targets, opens provider sessions, signs
//! part URLs, and finalizes or aborts sessions. It keeps no session state of
//! its own: every call carries an [`UploadSession`] and the provider is the
//! single source of truth.

use crate::{
    config::{UploadPolicy, UploadStrategy},
    errors::UploadError,
    models::{
        event::Event,
        session::{CompletedObject, PartToken, SessionMetadata, SignedPartUrl, UploadSession},
        upload::UploadRecord,
        wire::{InitiateRequest, RecordUploadRequest},
    },
    services::{
        auth::Identity,
        event_store::EventStore,
        object_storage::{ObjectStorage, ProviderError},
        part_planner::{MAX_PARTS, PartPlan},
    },
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const MAX_FILE_NAME_LEN: usize = 255;

/// A multipart session ready for part signing.
#[derive(Debug, Clone)]
pub struct MultipartTicket {
    pub session: UploadSession,
    pub file_url: String,
    pub plan: PartPlan,
    pub expires_in: u64,
}

/// A single pre-signed PUT for a small file.
#[derive(Debug, Clone)]
pub struct SinglePutTicket {
    pub object_key: String,
    pub upload_url: String,
    pub file_url: String,
    pub expires_in: u64,
}

#[derive(Debug, Clone)]
pub enum InitiatedUpload {
    SinglePut(SinglePutTicket),
    Multipart(MultipartTicket),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortOutcome {
    Aborted,
    /// The session was already gone; the desired end state holds.
    AlreadyGone,
}

struct PreparedTarget {
    object_key: String,
    file_url: String,
    file_size: u64,
    now: DateTime<Utc>,
}

#[derive(Clone)]
pub struct UploadService {
    storage: Arc<dyn ObjectStorage>,
    events: EventStore,
    policy: UploadPolicy,
}

impl UploadService {
    pub fn new(storage: Arc<dyn ObjectStorage>, events: EventStore, policy: UploadPolicy) -> Self {
        Self {
            storage,
            events,
            policy,
        }
    }

    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    /// Validate a declared upload and prepare it for `strategy`.
    ///
    /// Both strategies share one precondition chain; nothing is opened with
    /// the provider unless all checks pass.
    pub async fn initiate(
        &self,
        req: &InitiateRequest,
        identity: Option<&Identity>,
        strategy: UploadStrategy,
    ) -> Result<InitiatedUpload, UploadError> {
        match strategy {
            UploadStrategy::SinglePut => self
                .presign_single(req, identity)
                .await
                .map(InitiatedUpload::SinglePut),
            UploadStrategy::Multipart => self
                .initiate_multipart(req, identity)
                .await
                .map(InitiatedUpload::Multipart),
        }
    }

    /// Validate a declared upload and prepare it for whichever strategy the
    /// policy's size threshold selects.
    pub async fn start(
        &self,
        req: &InitiateRequest,
        identity: Option<&Identity>,
    ) -> Result<InitiatedUpload, UploadError> {
        let strategy = self
            .policy
            .strategy_for(u64::try_from(req.file_size).unwrap_or(0));
        self.initiate(req, identity, strategy).await
    }

    /// Open a provider session and return its part plan.
    pub async fn initiate_multipart(
        &self,
        req: &InitiateRequest,
        identity: Option<&Identity>,
    ) -> Result<MultipartTicket, UploadError> {
        let target = self
            .prepare(req, identity, UploadStrategy::Multipart)
            .await?;
        let plan = PartPlan::for_size(target.file_size, self.policy.max_file_size)?;
        let metadata = SessionMetadata {
            original_name: sanitize_file_name(&req.file_name),
            event_id: req.event_id.clone(),
            uploader_id: identity.map(|id| id.user_id.clone()),
            file_size: target.file_size,
            uploaded_at: target.now,
            part_size: Some(plan.part_size),
            part_count: Some(plan.part_count),
        };
        let opened = self
            .storage
            .open_session(&target.object_key, &req.file_type, &metadata)
            .await
            .map_err(|err| UploadError::StorageUnavailable(err.to_string()))?;

        info!(
            key = %target.object_key,
            session_id = %opened.session_id,
            part_size = plan.part_size,
            part_count = plan.part_count,
            "initiated multipart upload"
        );
        Ok(MultipartTicket {
            session: UploadSession::new(opened.session_id, target.object_key),
            file_url: target.file_url,
            plan,
            expires_in: self.policy.url_ttl.as_secs(),
        })
    }

    /// Sign one whole-object PUT for a file under the single-PUT ceiling.
    pub async fn presign_single(
        &self,
        req: &InitiateRequest,
        identity: Option<&Identity>,
    ) -> Result<SinglePutTicket, UploadError> {
        let target = self
            .prepare(req, identity, UploadStrategy::SinglePut)
            .await?;
        let upload_url = self
            .storage
            .sign_object_upload(&target.object_key, &req.file_type, self.policy.url_ttl)
            .map_err(|err| UploadError::Signing(err.to_string()))?;

        info!(key = %target.object_key, file_size = target.file_size, "presigned single upload");
        Ok(SinglePutTicket {
            object_key: target.object_key,
            upload_url,
            file_url: target.file_url,
            expires_in: self.policy.url_ttl.as_secs(),
        })
    }

    /// Checks run in order: input shape, MIME allow-list, size ceiling, target
    /// existence, upload window.
    async fn prepare(
        &self,
        req: &InitiateRequest,
        identity: Option<&Identity>,
        strategy: UploadStrategy,
    ) -> Result<PreparedTarget, UploadError> {
        ensure_event_id(&req.event_id)?;
        if req.file_name.trim().is_empty() {
            return Err(UploadError::InvalidInput("fileName is required".into()));
        }
        if !self.policy.allows_type(&req.file_type) {
            return Err(UploadError::UnsupportedType(req.file_type.clone()));
        }
        let file_size = self.checked_size(req.file_size, strategy)?;
        self.authorize_target(&req.event_id, identity).await?;

        let now = Utc::now();
        let object_key = build_object_key(&req.event_id, &req.file_name, &req.file_type, now);
        Ok(PreparedTarget {
            file_url: self.storage.public_url(&object_key),
            object_key,
            file_size,
            now,
        })
    }

    /// Sign one URL per requested part, in request order.
    ///
    /// The whole batch is rejected if any part number is not an integer in
    /// `1..=10000`. Signing the same part twice is harmless.
    pub fn sign_parts(
        &self,
        session: &UploadSession,
        part_numbers: &[Value],
    ) -> Result<Vec<SignedPartUrl>, UploadError> {
        ensure_session(session)?;
        if part_numbers.is_empty() {
            return Err(UploadError::InvalidInput("partNumbers must not be empty".into()));
        }
        let numbers = part_numbers
            .iter()
            .map(parse_part_number)
            .collect::<Result<Vec<_>, _>>()?;

        numbers
            .into_iter()
            .map(|part_number| {
                self.storage
                    .sign_part_upload(
                        &session.object_key,
                        &session.session_id,
                        part_number,
                        self.policy.url_ttl,
                    )
                    .map(|url| SignedPartUrl { part_number, url })
                    .map_err(|err| UploadError::Signing(err.to_string()))
            })
            .collect()
    }

    /// Finalize from raw JSON part tokens.
    pub async fn complete(
        &self,
        session: &UploadSession,
        parts: &[Value],
    ) -> Result<CompletedObject, UploadError> {
        let tokens = parse_part_tokens(parts)?;
        self.complete_tokens(session, tokens).await
    }

    /// Finalize a session. Tokens may arrive in any order; the provider
    /// always receives them sorted by part number.
    pub async fn complete_tokens(
        &self,
        session: &UploadSession,
        mut tokens: Vec<PartToken>,
    ) -> Result<CompletedObject, UploadError> {
        ensure_session(session)?;
        if tokens.is_empty() {
            return Err(UploadError::MalformedParts("parts must not be empty".into()));
        }
        tokens.sort_by_key(|token| token.part_number);
        if tokens
            .windows(2)
            .any(|pair| pair[0].part_number == pair[1].part_number)
        {
            return Err(UploadError::MalformedParts(
                "each part number may appear only once".into(),
            ));
        }
        if let Some((index, token)) = tokens
            .iter()
            .enumerate()
            .find(|(index, token)| token.part_number as usize != index + 1)
        {
            return Err(UploadError::MalformedParts(format!(
                "part {} is missing from the list (found {} instead)",
                index + 1,
                token.part_number
            )));
        }

        let completed = self
            .storage
            .complete_session(&session.object_key, &session.session_id, &tokens)
            .await
            .map_err(|err| match err {
                ProviderError::InvalidPart { part_number } => {
                    UploadError::PartMismatch { part_number }
                }
                ProviderError::NoSuchUpload(_) => UploadError::SessionExpired,
                ProviderError::InvalidPartOrder
                | ProviderError::IncompleteParts { .. }
                | ProviderError::EntityTooSmall { .. } => {
                    UploadError::MalformedParts(err.to_string())
                }
                other => UploadError::StorageUnavailable(other.to_string()),
            })?;

        info!(key = %completed.key, parts = tokens.len(), "completed upload");
        Ok(completed)
    }

    /// Discard a session. A session that no longer exists counts as success.
    pub async fn abort(&self, session: &UploadSession) -> Result<AbortOutcome, UploadError> {
        ensure_session(session)?;
        match self
            .storage
            .abort_session(&session.object_key, &session.session_id)
            .await
        {
            Ok(()) => Ok(AbortOutcome::Aborted),
            Err(ProviderError::NoSuchUpload(_)) => {
                info!(session_id = %session.session_id, "abort of unknown session treated as done");
                Ok(AbortOutcome::AlreadyGone)
            }
            Err(err) => Err(UploadError::StorageUnavailable(err.to_string())),
        }
    }

    /// Persist the logical upload once the object exists in storage.
    pub async fn record_upload(
        &self,
        req: &RecordUploadRequest,
        identity: Option<&Identity>,
    ) -> Result<UploadRecord, UploadError> {
        ensure_event_id(&req.event_id)?;
        let prefix = format!("events/{}/media/", req.event_id);
        if !req.file_key.starts_with(&prefix) || req.file_key.len() == prefix.len() {
            return Err(UploadError::InvalidInput(
                "fileKey does not belong to this event".into(),
            ));
        }
        if !self.policy.allows_type(&req.file_type) {
            return Err(UploadError::UnsupportedType(req.file_type.clone()));
        }
        let file_size = self.checked_size(req.file_size, UploadStrategy::Multipart)?;
        let event = self.authorize_target(&req.event_id, identity).await?;

        let exists = self
            .storage
            .object_exists(&req.file_key)
            .await
            .map_err(|err| UploadError::StorageUnavailable(err.to_string()))?;
        if !exists {
            return Err(UploadError::ObjectMissing(req.file_key.clone()));
        }

        let uploader_id = identity.map(|id| id.user_id.clone());
        let approved = !event.requires_approval
            || uploader_id
                .as_deref()
                .is_some_and(|user_id| event.is_owned_by(user_id));

        let record = UploadRecord {
            id: Uuid::new_v4(),
            event_id: req.event_id.clone(),
            file_key: req.file_key.clone(),
            file_url: self.storage.public_url(&req.file_key),
            file_name: sanitize_file_name(&req.file_name),
            file_type: req.file_type.to_ascii_lowercase(),
            file_size: file_size as i64,
            uploader_id,
            approved,
            created_at: Utc::now(),
        };

        match self.events.insert_upload(&record).await {
            Ok(()) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(UploadError::InvalidInput(format!(
                    "upload `{}` is already recorded",
                    record.file_key
                )));
            }
            Err(err) => return Err(err.into()),
        }

        info!(event_id = %record.event_id, key = %record.file_key, approved, "recorded upload");
        Ok(record)
    }

    fn checked_size(&self, declared: i64, strategy: UploadStrategy) -> Result<u64, UploadError> {
        let size = u64::try_from(declared)
            .ok()
            .filter(|size| *size > 0)
            .ok_or(UploadError::InvalidSize(declared))?;
        let max = self.policy.max_size_for(strategy);
        if size > max {
            return Err(UploadError::FileTooLarge { size, max });
        }
        Ok(size)
    }

    /// The target must exist; once its window has closed only the owner may
    /// upload.
    async fn authorize_target(
        &self,
        event_id: &str,
        identity: Option<&Identity>,
    ) -> Result<Event, UploadError> {
        let event = self
            .events
            .find_event(event_id)
            .await?
            .ok_or_else(|| UploadError::TargetNotFound(event_id.to_string()))?;

        if event.window_closed_at(Utc::now())
            && !identity.is_some_and(|id| event.is_owned_by(&id.user_id))
        {
            warn!(event_id, "upload attempted after window closed");
            return Err(UploadError::UploadWindowClosed);
        }
        Ok(event)
    }
}

fn ensure_event_id(event_id: &str) -> Result<(), UploadError> {
    let valid = !event_id.is_empty()
        && event_id.len() <= 128
        && event_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(UploadError::InvalidInput("eventId is invalid".into()))
    }
}

fn ensure_session(session: &UploadSession) -> Result<(), UploadError> {
    if session.session_id.trim().is_empty() || session.object_key.trim().is_empty() {
        return Err(UploadError::InvalidInput(
            "fileKey and uploadId are required".into(),
        ));
    }
    Ok(())
}

fn parse_part_number(value: &Value) -> Result<u32, UploadError> {
    value
        .as_u64()
        .filter(|n| (1..=MAX_PARTS).contains(n))
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| UploadError::InvalidPartNumber(value.to_string()))
}

fn parse_part_tokens(parts: &[Value]) -> Result<Vec<PartToken>, UploadError> {
    if parts.is_empty() {
        return Err(UploadError::MalformedParts("parts must not be empty".into()));
    }
    parts
        .iter()
        .enumerate()
        .map(|(index, part)| {
            let part_number = part
                .get("PartNumber")
                .ok_or_else(|| {
                    UploadError::MalformedParts(format!("part {} is missing PartNumber", index))
                })
                .and_then(|value| {
                    parse_part_number(value).map_err(|_| {
                        UploadError::MalformedParts(format!(
                            "part {} has invalid PartNumber {}",
                            index, value
                        ))
                    })
                })?;
            let e_tag = part
                .get("ETag")
                .and_then(Value::as_str)
                .filter(|tag| !tag.is_empty())
                .ok_or_else(|| {
                    UploadError::MalformedParts(format!("part {} is missing ETag", index))
                })?;
            Ok(PartToken::new(part_number, e_tag))
        })
        .collect()
}

/// `events/{eventId}/media/{randomToken}_{timestampMillis}.{extension}`
///
/// Uniqueness is probabilistic: 60 random bits plus the millisecond clock.
pub fn build_object_key(
    event_id: &str,
    file_name: &str,
    content_type: &str,
    now: DateTime<Utc>,
) -> String {
    let token = Uuid::new_v4().simple().to_string();
    format!(
        "events/{}/media/{}_{}.{}",
        event_id,
        &token[..16],
        now.timestamp_millis(),
        file_extension(file_name, content_type)
    )
}

/// Lowercase extension from the file name, or from the MIME subtype when
/// the name has no usable one.
pub fn file_extension(file_name: &str, content_type: &str) -> String {
    let from_name = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty() && ext.len() <= 10)
        .filter(|ext| ext.chars().all(|c| c.is_ascii_alphanumeric()));
    if let Some(ext) = from_name {
        return ext.to_ascii_lowercase();
    }

    let subtype = content_type
        .split_once('/')
        .map(|(_, sub)| sub.to_ascii_lowercase())
        .unwrap_or_default();
    match subtype.as_str() {
        "jpeg" => "jpg".into(),
        "quicktime" => "mov".into(),
        "mpeg" => "mp3".into(),
        "x-m4a" => "m4a".into(),
        "x-msvideo" => "avi".into(),
        "" => "bin".into(),
        other => other
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect(),
    }
}

/// Restrict a user-supplied file name to `[A-Za-z0-9._-]`.
pub fn sanitize_file_name(file_name: &str) -> String {
    file_name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_FILE_NAME_LEN)
        .collect()
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
