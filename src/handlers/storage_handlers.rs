//! Data plane of the local object-storage provider.
//!
//! Clients reach these routes only through pre-signed URLs. Bodies are
//! streamed to disk without buffering and delegated to `StorageService`.

use crate::{
    AppState,
    errors::AppError,
    models::object::Object,
    services::url_signer::SignedTarget,
};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use std::io;
use tokio_util::io::ReaderStream;

/// Query parameters carried by a pre-signed PUT URL.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPutQuery {
    pub upload_id: Option<String>,
    pub part_number: Option<u32>,
    pub content_type: Option<String>,
    pub expires: i64,
    pub signature: String,
}

/// `PUT /storage/{*key}`: one part of a session, or a whole object.
pub async fn put_object(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(q): Query<SignedPutQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let signer = state.storage.signer();
    let now = Utc::now().timestamp();
    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other));

    let etag = match (q.upload_id.as_deref(), q.part_number, q.content_type.as_deref()) {
        (Some(upload_id), Some(part_number), None) => {
            let target = SignedTarget::Part {
                upload_id,
                part_number,
            };
            signer.verify(&key, target, q.expires, &q.signature, now)?;
            state
                .storage
                .put_part_stream(&key, upload_id, part_number, stream)
                .await?
                .etag
        }
        (None, None, Some(content_type)) => {
            signer.verify(
                &key,
                SignedTarget::Object { content_type },
                q.expires,
                &q.signature,
                now,
            )?;
            let sent_type = headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok());
            if !sent_type.is_some_and(|sent| sent.eq_ignore_ascii_case(content_type)) {
                return Err(AppError::forbidden(
                    "content type does not match the signed url",
                ));
            }
            state
                .storage
                .put_object_stream(&key, Some(content_type.to_string()), stream)
                .await?
                .etag
                .unwrap_or_default()
        }
        _ => return Err(AppError::bad_request("unsupported signed url parameters")),
    };

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
        response.headers_mut().insert(header::ETAG, value);
    }
    Ok(response)
}

/// `GET /storage/{*key}`: stream a finished object.
pub async fn get_object(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, AppError> {
    let (meta, file) = state.storage.get_object_reader(&key).await?;
    let stream = ReaderStream::new(file);
    let body = Body::from_stream(stream);

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &meta);

    Ok(response)
}

/// `HEAD /storage/{*key}`: same headers as GET but no body.
pub async fn head_object(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, AppError> {
    let meta = state.storage.get_object_metadata(&key).await?;
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &meta);

    Ok(response)
}

fn set_object_headers(headers: &mut HeaderMap, meta: &Object) {
    let content_type = meta
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".into());
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );

    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&meta.size_bytes.max(0).to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("0")),
    );

    if let Some(etag) = meta.etag.as_ref() {
        if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
            headers.insert(header::ETAG, value);
        }
    }

    if let Ok(value) = HeaderValue::from_str(&meta.last_modified.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}
