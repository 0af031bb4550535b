//! Represents the metadata record kept for every stored file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Metadata describing one stored blob.
///
/// The record never holds the payload itself; `file_path` points at the blob
/// in the blob store. Serialized over HTTP in camelCase, with `createdAt` as
/// epoch milliseconds.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    /// Generated identifier (UUID v4 as text). Primary key.
    pub id: String,

    /// Filename supplied by the uploader.
    pub file_name: String,

    /// When the file was first uploaded. Never changes afterwards.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,

    /// Byte length of the current blob.
    pub size: i64,

    /// Content type (MIME type) supplied by the uploader.
    pub file_type: String,

    /// Blob store location of the current payload.
    pub file_path: String,

    /// Free-form user metadata.
    pub metadata: Option<String>,

    /// Bumped every time the payload is replaced.
    #[serde(skip)]
    pub revision: i64,
}
