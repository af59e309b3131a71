//! Provider-side metadata attached to an object key.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// One key-value metadata entry, declared when the upload session opens.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ObjectMetadata {
    pub id: Uuid,
    pub object_key: String,
    pub name: String,
    pub value: String,
}
