use crate::services::{
    object_storage::ProviderError, storage_service::StorageError, url_signer::SignatureError,
};
use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    /// Machine-readable failure kind for clients that recover automatically.
    pub code: Option<&'static str>,
    pub part_number: Option<u32>,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
            code: None,
            part_number: None,
        }
    }

    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    /// Shortcut for 403 Forbidden
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": self.message,
            "status": self.status.as_u16()
        });
        if let Some(code) = self.code {
            body["code"] = json!(code);
        }
        if let Some(part_number) = self.part_number {
            body["partNumber"] = json!(part_number);
        }

        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

/// Body-shape failures are client errors; axum would answer 422 otherwise.
impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::bad_request(rejection.body_text())
    }
}

/// Failures of the upload protocol, grouped by who has to act on them.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid file size {0}")]
    InvalidSize(i64),
    #[error("file type `{0}` is not allowed")]
    UnsupportedType(String),
    #[error("file size {size} exceeds the maximum of {max} bytes")]
    FileTooLarge { size: u64, max: u64 },
    #[error("event `{0}` not found")]
    TargetNotFound(String),
    #[error("the upload window for this event has closed")]
    UploadWindowClosed,
    #[error("invalid part number {0}")]
    InvalidPartNumber(String),
    #[error("malformed parts: {0}")]
    MalformedParts(String),
    /// Re-upload the named part and complete again.
    #[error("part {part_number} does not match the uploaded data")]
    PartMismatch { part_number: u32 },
    /// The whole upload has to restart from initiate.
    #[error("upload session expired or no longer exists")]
    SessionExpired,
    #[error("object `{0}` not found")]
    ObjectMissing(String),
    #[error("could not sign url: {0}")]
    Signing(String),
    #[error("object storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl UploadError {
    pub fn status(&self) -> StatusCode {
        match self {
            UploadError::InvalidInput(_)
            | UploadError::InvalidSize(_)
            | UploadError::UnsupportedType(_)
            | UploadError::FileTooLarge { .. }
            | UploadError::InvalidPartNumber(_)
            | UploadError::MalformedParts(_)
            | UploadError::PartMismatch { .. } => StatusCode::BAD_REQUEST,
            UploadError::UploadWindowClosed => StatusCode::FORBIDDEN,
            UploadError::TargetNotFound(_)
            | UploadError::SessionExpired
            | UploadError::ObjectMissing(_) => StatusCode::NOT_FOUND,
            UploadError::Signing(_)
            | UploadError::StorageUnavailable(_)
            | UploadError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable code sent next to the message in error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            UploadError::InvalidInput(_) => "INVALID_INPUT",
            UploadError::InvalidSize(_) => "INVALID_SIZE",
            UploadError::UnsupportedType(_) => "UNSUPPORTED_TYPE",
            UploadError::FileTooLarge { .. } => "FILE_TOO_LARGE",
            UploadError::TargetNotFound(_) => "TARGET_NOT_FOUND",
            UploadError::UploadWindowClosed => "UPLOAD_WINDOW_CLOSED",
            UploadError::InvalidPartNumber(_) => "INVALID_PART_NUMBER",
            UploadError::MalformedParts(_) => "MALFORMED_PARTS",
            UploadError::PartMismatch { .. } => "PART_MISMATCH",
            UploadError::SessionExpired => "SESSION_EXPIRED",
            UploadError::ObjectMissing(_) => "OBJECT_MISSING",
            UploadError::Signing(_) => "SIGNING_FAILED",
            UploadError::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
            UploadError::Database(_) => "INTERNAL",
        }
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        let status = err.status();
        let code = err.code();
        if status.is_server_error() {
            tracing::error!(error = %err, "upload request failed");
            let message = match err {
                UploadError::StorageUnavailable(_) => "object storage unavailable",
                UploadError::Signing(_) => "could not sign upload url",
                _ => "internal server error",
            };
            return AppError::new(status, message).with_code(code);
        }
        let part_number = match err {
            UploadError::PartMismatch { part_number } => Some(part_number),
            _ => None,
        };
        AppError {
            part_number,
            ..AppError::new(status, err.to_string()).with_code(code)
        }
    }
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::NoSuchUpload(_) => AppError::not_found(err.to_string()),
            ProviderError::NoSuchKey(_) => AppError::not_found(err.to_string()),
            ProviderError::InvalidPart { .. }
            | ProviderError::InvalidPartOrder
            | ProviderError::IncompleteParts { .. }
            | ProviderError::EntityTooSmall { .. } => AppError::bad_request(err.to_string()),
            ProviderError::Signing(_) | ProviderError::Unavailable(_) => {
                tracing::error!(error = %err, "object storage failure");
                AppError::internal("object storage unavailable")
            }
        }
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InvalidObjectKey => AppError::bad_request(err.to_string()),
            StorageError::ObjectNotFound(_) => AppError::not_found(err.to_string()),
            StorageError::Provider(inner) => inner.into(),
            other => {
                tracing::error!(error = %other, "storage failure");
                AppError::internal("storage failure")
            }
        }
    }
}

impl From<SignatureError> for AppError {
    fn from(err: SignatureError) -> Self {
        AppError::forbidden(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_http_categories() {
        assert_eq!(
            UploadError::UnsupportedType("application/pdf".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            UploadError::UploadWindowClosed.status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(UploadError::SessionExpired.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            UploadError::PartMismatch { part_number: 2 }.status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn server_errors_hide_provider_detail() {
        let err: AppError =
            UploadError::StorageUnavailable("disk /var/lib/x exploded".into()).into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.message.contains("/var/lib"));
    }

    #[test]
    fn client_errors_keep_their_message() {
        let err: AppError = UploadError::InvalidPartNumber("10001".into()).into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(err.message.contains("10001"));
        assert_eq!(err.code, Some("INVALID_PART_NUMBER"));
        assert_eq!(err.part_number, None);
    }

    #[test]
    fn part_mismatch_names_the_part() {
        let err: AppError = UploadError::PartMismatch { part_number: 3 }.into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.code, Some("PART_MISMATCH"));
        assert_eq!(err.part_number, Some(3));

        let expired: AppError = UploadError::SessionExpired.into();
        assert_eq!(expired.status, StatusCode::NOT_FOUND);
        assert_eq!(expired.code, Some("SESSION_EXPIRED"));
    }
}
