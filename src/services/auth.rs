//! Resolves the caller's identity from request headers.
//!
//! Sessions are issued elsewhere; this only reads the `auth_sessions` table.
//! A missing, unknown or expired bearer token means a guest.

use axum::http::{HeaderMap, header};
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
}

#[derive(Clone)]
pub struct Authenticator {
    db: Arc<SqlitePool>,
}

impl Authenticator {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    pub async fn current_identity(
        &self,
        headers: &HeaderMap,
    ) -> Result<Option<Identity>, sqlx::Error> {
        let Some(token) = bearer_token(headers) else {
            return Ok(None);
        };

        let user_id = sqlx::query_scalar::<_, String>(
            "SELECT user_id FROM auth_sessions WHERE token = ? AND expires_at > ?",
        )
        .bind(token)
        .bind(Utc::now())
        .fetch_optional(&*self.db)
        .await?;

        Ok(user_id.map(|user_id| Identity { user_id }))
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn reads_bearer_tokens_only() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer tok-1"));
        assert_eq!(bearer_token(&headers), Some("tok-1"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }
}
