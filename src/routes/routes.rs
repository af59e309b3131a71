//! Route table of the upload service.
//!
//! ## Structure
//! - **Upload protocol** (JSON)
//!   - `POST /api/uploads/start`    : single PUT or multipart, picked by size
//!   - `POST /api/uploads/initiate` : open a multipart session
//!   - `POST /api/uploads/presign`  : single pre-signed PUT for small files
//!   - `POST /api/uploads/parts`    : sign part URLs
//!   - `POST /api/uploads/complete` : assemble the object
//!   - `POST /api/uploads/abort`    : discard the session
//!   - `POST /api/uploads/record`   : persist the logical upload
//!
//! - **Storage data plane** (pre-signed URLs land here)
//!   - `PUT  /storage/{*key}` : part or whole-object upload
//!   - `GET  /storage/{*key}` : download
//!   - `HEAD /storage/{*key}` : metadata only

use crate::{
    AppState,
    handlers::{
        health_handlers::{healthz, readyz},
        storage_handlers::{get_object, head_object, put_object},
        upload_handlers::{
            abort_upload, complete_upload, initiate_upload, presign_upload, record_upload,
            sign_parts, start_upload,
        },
    },
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post, put},
};

/// Build the router; state is attached by the caller.
pub fn routes() -> Router<AppState> {
    let uploads = Router::new()
        .route("/start", post(start_upload))
        .route("/initiate", post(initiate_upload))
        .route("/presign", post(presign_upload))
        .route("/parts", post(sign_parts))
        .route("/complete", post(complete_upload))
        .route("/abort", post(abort_upload))
        .route("/record", post(record_upload));

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .nest("/api/uploads", uploads)
        // part and object bodies are streamed to disk, not buffered
        .route(
            "/storage/{*key}",
            put(put_object)
                .get(get_object)
                .head(head_object)
                .layer(DefaultBodyLimit::disable()),
        )
}
