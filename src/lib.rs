//! Direct-to-storage media uploads for events.
//!
//! The server never proxies payload bytes for the upload protocol: it plans
//! parts, opens provider sessions, signs per-part URLs and finalizes or
//! aborts. The bundled local provider serves the signed URLs under
//! `/storage`. The [`client`] module drives uploads from the other side.

use anyhow::Result;
use axum::Router;
use sqlx::SqlitePool;
use std::sync::Arc;

pub mod client;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;

use config::UploadPolicy;
use services::{
    auth::Authenticator, event_store::EventStore, storage_service::StorageService,
    upload_service::UploadService,
};

const INIT_SQL: &str = include_str!("../migrations/0001_init.sql");

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub uploads: UploadService,
    pub storage: Arc<StorageService>,
    pub auth: Authenticator,
}

impl AppState {
    pub fn new(db: Arc<SqlitePool>, storage: StorageService, policy: UploadPolicy) -> Self {
        let storage = Arc::new(storage);
        let uploads = UploadService::new(storage.clone(), EventStore::new(db.clone()), policy);
        Self {
            uploads,
            storage,
            auth: Authenticator::new(db),
        }
    }
}

/// Router with state attached, ready for `axum::serve`.
pub fn build_app(state: AppState) -> Router {
    routes::routes::routes().with_state(state)
}

/// Run the embedded schema statement by statement.
pub async fn run_migrations(db: &SqlitePool) -> Result<()> {
    let statements = INIT_SQL
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::info!("Running {} migration statements...", statements.len());

    for stmt in statements {
        tracing::debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(db).await?;
    }

    Ok(())
}
