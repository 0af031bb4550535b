//! Core data models for the file storage service.
//!
//! Records map to the `files` table via `sqlx::FromRow` and serialize as JSON
//! via `serde`.

pub mod file_record;
