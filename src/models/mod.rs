//! Core data models for the media upload service.
//!
//! Rows of the provider tables and the application tables map to these
//! structs via `sqlx::FromRow`; the wire types serialize as the JSON bodies
//! of the upload endpoints.

pub mod event;
pub mod metadata;
pub mod multipart;
pub mod object;
pub mod session;
pub mod upload;
pub mod wire;
