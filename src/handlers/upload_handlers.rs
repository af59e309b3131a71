//! JSON endpoints of the upload protocol.
//!
//! Each handler resolves the caller's identity where the window rule needs
//! it, delegates to `UploadService`, and maps failures through `AppError`.

use crate::{
    AppState,
    config::UploadStrategy,
    errors::{AppError, UploadError},
    models::{
        session::UploadSession,
        upload::UploadRecord,
        wire::{
            AbortRequest, AbortResponse, CompleteRequest, CompleteResponse, InitiateRequest,
            InitiateResponse, PresignResponse, RecordUploadRequest, SignPartsRequest,
            SignPartsResponse, StartUploadResponse,
        },
    },
    services::{
        auth::Identity,
        upload_service::{AbortOutcome, InitiatedUpload, MultipartTicket, SinglePutTicket},
    },
};
use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
};

async fn identity(state: &AppState, headers: &HeaderMap) -> Result<Option<Identity>, AppError> {
    state
        .auth
        .current_identity(headers)
        .await
        .map_err(|err| UploadError::Database(err).into())
}

impl From<MultipartTicket> for InitiateResponse {
    fn from(ticket: MultipartTicket) -> Self {
        Self {
            upload_id: ticket.session.session_id,
            file_key: ticket.session.object_key,
            file_url: ticket.file_url,
            part_size: ticket.plan.part_size,
            part_count: ticket.plan.part_count,
            expires_in: ticket.expires_in,
        }
    }
}

impl From<SinglePutTicket> for PresignResponse {
    fn from(ticket: SinglePutTicket) -> Self {
        Self {
            upload_url: ticket.upload_url,
            file_key: ticket.object_key,
            file_url: ticket.file_url,
            expires_in: ticket.expires_in,
        }
    }
}

impl From<InitiatedUpload> for StartUploadResponse {
    fn from(initiated: InitiatedUpload) -> Self {
        match initiated {
            InitiatedUpload::SinglePut(ticket) => StartUploadResponse::SinglePut(ticket.into()),
            InitiatedUpload::Multipart(ticket) => StartUploadResponse::Multipart(ticket.into()),
        }
    }
}

/// `POST /api/uploads/start`: the server picks single PUT or multipart.
pub async fn start_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<InitiateRequest>, JsonRejection>,
) -> Result<Json<StartUploadResponse>, AppError> {
    let Json(req) = payload?;
    let identity = identity(&state, &headers).await?;
    let initiated = state.uploads.start(&req, identity.as_ref()).await?;
    Ok(Json(initiated.into()))
}

/// `POST /api/uploads/initiate`
pub async fn initiate_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<InitiateRequest>, JsonRejection>,
) -> Result<Json<InitiateResponse>, AppError> {
    let Json(req) = payload?;
    let identity = identity(&state, &headers).await?;
    match state
        .uploads
        .initiate(&req, identity.as_ref(), UploadStrategy::Multipart)
        .await?
    {
        InitiatedUpload::Multipart(ticket) => Ok(Json(ticket.into())),
        InitiatedUpload::SinglePut(_) => Err(AppError::internal("unexpected upload strategy")),
    }
}

/// `POST /api/uploads/presign`: single PUT for small files.
pub async fn presign_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<InitiateRequest>, JsonRejection>,
) -> Result<Json<PresignResponse>, AppError> {
    let Json(req) = payload?;
    let identity = identity(&state, &headers).await?;
    match state
        .uploads
        .initiate(&req, identity.as_ref(), UploadStrategy::SinglePut)
        .await?
    {
        InitiatedUpload::SinglePut(ticket) => Ok(Json(ticket.into())),
        InitiatedUpload::Multipart(_) => Err(AppError::internal("unexpected upload strategy")),
    }
}

/// `POST /api/uploads/parts`
pub async fn sign_parts(
    State(state): State<AppState>,
    payload: Result<Json<SignPartsRequest>, JsonRejection>,
) -> Result<Json<SignPartsResponse>, AppError> {
    let Json(req) = payload?;
    let session = UploadSession::new(req.upload_id, req.file_key);
    let urls = state.uploads.sign_parts(&session, &req.part_numbers)?;
    Ok(Json(SignPartsResponse { urls }))
}

/// `POST /api/uploads/complete`
pub async fn complete_upload(
    State(state): State<AppState>,
    payload: Result<Json<CompleteRequest>, JsonRejection>,
) -> Result<Json<CompleteResponse>, AppError> {
    let Json(req) = payload?;
    let session = UploadSession::new(req.upload_id, req.file_key);
    let completed = state.uploads.complete(&session, &req.parts).await?;

    Ok(Json(CompleteResponse {
        location: completed.location,
        etag: completed.e_tag,
        file_key: completed.key,
    }))
}

/// `POST /api/uploads/abort`
pub async fn abort_upload(
    State(state): State<AppState>,
    payload: Result<Json<AbortRequest>, JsonRejection>,
) -> Result<Json<AbortResponse>, AppError> {
    let Json(req) = payload?;
    let session = UploadSession::new(req.upload_id, req.file_key);
    let message = match state.uploads.abort(&session).await? {
        AbortOutcome::Aborted => "upload aborted",
        AbortOutcome::AlreadyGone => "upload already aborted or completed",
    };

    Ok(Json(AbortResponse {
        success: true,
        message: message.into(),
    }))
}

/// `POST /api/uploads/record`: persist the logical upload after completion.
pub async fn record_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<RecordUploadRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<UploadRecord>), AppError> {
    let Json(req) = payload?;
    let identity = identity(&state, &headers).await?;
    let record = state.uploads.record_upload(&req, identity.as_ref()).await?;
    Ok((StatusCode::CREATED, Json(record)))
}
