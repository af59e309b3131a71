pub mod auth;
pub mod event_store;
pub mod object_storage;
pub mod part_planner;
pub mod storage_service;
pub mod upload_service;
pub mod url_signer;
