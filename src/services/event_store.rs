//! Relational reads and writes the upload path needs: one lookup of the
//! target event and one insert of the finished upload record.

use crate::models::{event::Event, upload::UploadRecord};
use sqlx::SqlitePool;
use std::sync::Arc;

#[derive(Clone)]
pub struct EventStore {
    db: Arc<SqlitePool>,
}

impl EventStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    pub async fn find_event(&self, event_id: &str) -> Result<Option<Event>, sqlx::Error> {
        sqlx::query_as::<_, Event>(
            "SELECT id, owner_id, name, upload_window_end, requires_approval
             FROM events WHERE id = ?",
        )
        .bind(event_id)
        .fetch_optional(&*self.db)
        .await
    }

    pub async fn insert_upload(&self, record: &UploadRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO uploads (
                id, event_id, file_key, file_url, file_name, file_type,
                file_size, uploader_id, approved, created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id)
        .bind(&record.event_id)
        .bind(&record.file_key)
        .bind(&record.file_url)
        .bind(&record.file_name)
        .bind(&record.file_type)
        .bind(record.file_size)
        .bind(&record.uploader_id)
        .bind(record.approved)
        .bind(record.created_at)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    pub async fn list_uploads(&self, event_id: &str) -> Result<Vec<UploadRecord>, sqlx::Error> {
        sqlx::query_as::<_, UploadRecord>(
            "SELECT id, event_id, file_key, file_url, file_name, file_type,
                    file_size, uploader_id, approved, created_at
             FROM uploads WHERE event_id = ? ORDER BY created_at",
        )
        .bind(event_id)
        .fetch_all(&*self.db)
        .await
    }
}
