#![allow(dead_code)]

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use futures::{Stream, stream};
use media_uploads::{
    AppState, config::UploadPolicy, run_migrations, services::storage_service::StorageService,
    services::url_signer::UrlSigner,
};
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use std::{io, sync::Arc};
use tempfile::TempDir;

pub const MIB: usize = 1024 * 1024;

pub struct TestEnv {
    pub db: Arc<SqlitePool>,
    pub state: AppState,
    // keeps the payload directory alive
    pub dir: TempDir,
}

pub async fn memory_pool() -> Arc<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    run_migrations(&pool).await.unwrap();
    Arc::new(pool)
}

pub async fn setup_with(base_url: &str, policy: UploadPolicy) -> TestEnv {
    let db = memory_pool().await;
    let dir = tempfile::tempdir().unwrap();
    let signer = UrlSigner::new("test-secret", base_url);
    let storage = StorageService::new(db.clone(), dir.path(), signer);
    let state = AppState::new(db.clone(), storage, policy);
    TestEnv { db, state, dir }
}

pub async fn setup() -> TestEnv {
    setup_with("http://localhost:3000", UploadPolicy::default()).await
}

pub async fn insert_event(
    db: &SqlitePool,
    id: &str,
    owner_id: &str,
    upload_window_end: Option<DateTime<Utc>>,
    requires_approval: bool,
) {
    sqlx::query(
        "INSERT INTO events (id, owner_id, name, upload_window_end, requires_approval)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(id)
    .bind(owner_id)
    .bind(format!("{} party", id))
    .bind(upload_window_end)
    .bind(requires_approval)
    .execute(db)
    .await
    .unwrap();
}

pub async fn insert_auth_session(db: &SqlitePool, token: &str, user_id: &str) {
    sqlx::query("INSERT INTO auth_sessions (token, user_id, expires_at) VALUES (?, ?, ?)")
        .bind(token)
        .bind(user_id)
        .bind(Utc::now() + Duration::hours(1))
        .execute(db)
        .await
        .unwrap();
}

/// Deterministic, non-repeating-looking payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// A request body split into a few chunks, the way a socket delivers it.
pub fn body_stream(bytes: &[u8]) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
    let chunks = bytes
        .chunks(256 * 1024)
        .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
        .collect::<Vec<_>>();
    stream::iter(chunks)
}
