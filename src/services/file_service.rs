//! src/services/file_service.rs
//!
//! FileService pairs each payload in the blob store with a record in the
//! metadata index and keeps the two consistent: every record in the index
//! points at a blob that exists and whose length matches `size`.
//!
//! Writes are ordered, never transactional. A blob is always written before
//! the record that references it and removed before the record on delete.
//! When the second step fails the first is rolled back where possible; what
//! cannot be rolled back is left as an orphan blob, which `reconcile` finds.

use crate::{
    models::file_record::FileRecord,
    services::{
        blob_store::{BlobReader, BlobStore},
        key_locks::{KeyGuard, KeyLocks},
        metadata_index::MetadataIndex,
        retry::{RetryPolicy, with_backoff},
    },
};
use bytes::Bytes;
use chrono::{DurationRound, TimeDelta, Utc};
use std::{collections::HashSet, io, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
const FALLBACK_FILE_NAME: &str = "file";
/// Upper bound on the name part of a location, leaving room for the id and
/// revision within a 255-byte path component.
const MAX_NAME_BYTES: usize = 180;
const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum FileError {
    #[error("File not found with ID: {0}")]
    NotFound(String),
    #[error("Failed to store the file: {0}")]
    StorageWrite(#[source] io::Error),
    #[error("Unable to read the file with ID: {id}")]
    StorageRead {
        id: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to delete the file: {0}")]
    Delete(String),
    #[error("Failed to save file metadata: {0}")]
    MetadataWrite(#[source] sqlx::Error),
    #[error("Failed to read file metadata: {0}")]
    MetadataRead(#[source] sqlx::Error),
    #[error("File {0} is busy, try again later")]
    Busy(String),
}

pub type FileResult<T> = Result<T, FileError>;

/// A payload supplied for upload or replace.
#[derive(Debug, Clone)]
pub struct NewBlob {
    pub data: Bytes,
    pub file_name: String,
    pub content_type: Option<String>,
}

/// An open download: the record as it was when the blob was opened, and a
/// reader over the payload.
pub struct FetchedFile {
    pub record: FileRecord,
    pub reader: BlobReader,
}

/// Result of comparing the metadata index against the blob store.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Records whose blob is missing.
    pub dangling_records: Vec<String>,
    /// Records whose blob length differs from `size`: `(id, recorded, actual)`.
    pub size_mismatches: Vec<(String, i64, u64)>,
    /// Stored blobs no record points at.
    pub orphan_blobs: Vec<String>,
}

impl ReconcileReport {
    /// No record violates the index/store invariant. Orphans are garbage,
    /// not violations.
    pub fn is_consistent(&self) -> bool {
        self.dangling_records.is_empty() && self.size_mismatches.is_empty()
    }
}

#[derive(Clone)]
pub struct FileService {
    blobs: Arc<dyn BlobStore>,
    index: Arc<dyn MetadataIndex>,
    locks: Arc<KeyLocks>,
    retry: RetryPolicy,
}

impl FileService {
    pub fn new(blobs: Arc<dyn BlobStore>, index: Arc<dyn MetadataIndex>) -> Self {
        Self {
            blobs,
            index,
            locks: Arc::new(KeyLocks::new(DEFAULT_LOCK_WAIT)),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.locks = Arc::new(KeyLocks::new(wait));
        self
    }

    pub fn blob_store(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub fn metadata_index(&self) -> &Arc<dyn MetadataIndex> {
        &self.index
    }

    /// All records, in upload order. Takes no locks, so the result may
    /// include a file that is being deleted concurrently.
    pub async fn list(&self) -> FileResult<Vec<FileRecord>> {
        let index = &self.index;
        with_backoff(&self.retry, "list records", move || index.list())
            .await
            .map_err(FileError::MetadataRead)
    }

    /// Store a new file and return its generated id.
    pub async fn upload(&self, blob: NewBlob, metadata: Option<String>) -> FileResult<String> {
        let id = Uuid::new_v4().to_string();
        let _guard = self.lock(&id).await?;

        let file_name = blob.file_name.clone();
        let location = blob_location(&id, 0, &file_name);
        let size = self.write_blob(&location, blob.data).await?;

        let record = FileRecord {
            id: id.clone(),
            file_name,
            created_at: now_millis(),
            size,
            file_type: content_type_or_default(blob.content_type),
            file_path: location,
            metadata,
            revision: 0,
        };

        if let Err(err) = self.put_record(&record).await {
            self.discard_blob(&record.file_path).await;
            return Err(err);
        }

        info!(
            "stored file {} ({} bytes) at {}",
            record.id, record.size, record.file_path
        );
        Ok(id)
    }

    /// Look up a file and open its payload.
    ///
    /// The record read and the open happen under the file's lock; the bytes
    /// are streamed after it is released.
    pub async fn fetch(&self, id: &str) -> FileResult<FetchedFile> {
        let _guard = self.lock(id).await?;
        let record = self.get_record(id).await?;

        let blobs = &self.blobs;
        let location = record.file_path.as_str();
        let reader = match with_backoff(&self.retry, "open blob", move || blobs.open(location)).await {
            Ok(reader) => reader,
            Err(source) => {
                error!(
                    "file {} has a record but its blob {} cannot be opened: {}",
                    id, record.file_path, source
                );
                return Err(FileError::StorageRead {
                    id: id.to_string(),
                    source,
                });
            }
        };

        Ok(FetchedFile { record, reader })
    }

    /// Replace the payload and/or the user metadata of an existing file.
    ///
    /// Supplying neither is a successful no-op. `created_at` never changes.
    pub async fn replace(
        &self,
        id: &str,
        blob: Option<NewBlob>,
        metadata: Option<String>,
    ) -> FileResult<()> {
        let _guard = self.lock(id).await?;
        let current = self.get_record(id).await?;

        if blob.is_none() && metadata.is_none() {
            debug!("replace of {} carried no changes", id);
            return Ok(());
        }

        let mut updated = current.clone();
        if let Some(blob) = blob {
            let revision = current.revision + 1;
            let location = blob_location(id, revision, &blob.file_name);
            updated.size = self.write_blob(&location, blob.data).await?;
            updated.file_name = blob.file_name;
            updated.file_type = content_type_or_default(blob.content_type);
            updated.file_path = location;
            updated.revision = revision;
        }
        if let Some(metadata) = metadata {
            updated.metadata = Some(metadata);
        }

        let blob_replaced = updated.file_path != current.file_path;
        if let Err(err) = self.put_record(&updated).await {
            if blob_replaced {
                self.discard_blob(&updated.file_path).await;
            }
            return Err(err);
        }

        if blob_replaced {
            let blobs = &self.blobs;
            let old = current.file_path.as_str();
            if let Err(err) = with_backoff(&self.retry, "remove replaced blob", move || blobs.delete(old)).await {
                warn!(
                    "file {} replaced but old blob {} was not removed: {}",
                    id, current.file_path, err
                );
            }
            info!(
                "replaced payload of {} ({} bytes) at {}",
                id, updated.size, updated.file_path
            );
        } else {
            info!("updated metadata of {}", id);
        }
        Ok(())
    }

    /// Delete a file: blob first, then record.
    ///
    /// A blob that is already gone counts as removed, so a delete that failed
    /// after the blob step can simply be retried.
    pub async fn delete(&self, id: &str) -> FileResult<()> {
        let _guard = self.lock(id).await?;
        let record = self.get_record(id).await?;

        let blobs = &self.blobs;
        let location = record.file_path.as_str();
        let removed = with_backoff(&self.retry, "remove blob", move || blobs.delete(location))
            .await
            .map_err(|err| FileError::Delete(err.to_string()))?;
        if !removed {
            debug!("blob {} for {} was already absent", record.file_path, id);
        }

        let index = &self.index;
        with_backoff(&self.retry, "remove record", move || index.delete(id))
            .await
            .map_err(|err| {
                error!(
                    "blob of {} removed but its record was not: {}; retry the delete",
                    id, err
                );
                FileError::Delete(err.to_string())
            })?;

        info!("deleted file {}", id);
        Ok(())
    }

    /// Compare every record against the blob store and every stored blob
    /// against the records. Read-only.
    pub async fn reconcile(&self) -> FileResult<ReconcileReport> {
        let records = self.list().await?;
        let mut report = ReconcileReport::default();

        let mut referenced = HashSet::with_capacity(records.len());
        for record in &records {
            referenced.insert(record.file_path.as_str());
            let size = self.blobs.size(&record.file_path).await.map_err(|source| {
                FileError::StorageRead {
                    id: record.id.clone(),
                    source,
                }
            })?;
            match size {
                None => report.dangling_records.push(record.id.clone()),
                Some(actual) if actual as i64 != record.size => {
                    report
                        .size_mismatches
                        .push((record.id.clone(), record.size, actual));
                }
                Some(_) => {}
            }
        }

        let stored = self.blobs.list().await.map_err(|source| FileError::StorageRead {
            id: "*".into(),
            source,
        })?;
        report.orphan_blobs = stored
            .into_iter()
            .filter(|location| !referenced.contains(location.as_str()))
            .collect();

        Ok(report)
    }

    /// Delete the orphan blobs listed in `report`. Must not run while
    /// uploads are in flight: a blob written but not yet indexed looks like
    /// an orphan.
    pub async fn remove_orphans(&self, report: &ReconcileReport) -> usize {
        let mut removed = 0;
        for location in &report.orphan_blobs {
            match self.blobs.delete(location).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(err) => warn!("failed to remove orphan blob {}: {}", location, err),
            }
        }
        removed
    }

    async fn lock(&self, id: &str) -> FileResult<KeyGuard> {
        self.locks
            .lock(id)
            .await
            .map_err(|_| FileError::Busy(id.to_string()))
    }

    async fn get_record(&self, id: &str) -> FileResult<FileRecord> {
        let index = &self.index;
        with_backoff(&self.retry, "read record", move || index.get(id))
            .await
            .map_err(FileError::MetadataRead)?
            .ok_or_else(|| FileError::NotFound(id.to_string()))
    }

    async fn put_record(&self, record: &FileRecord) -> FileResult<()> {
        let index = &self.index;
        with_backoff(&self.retry, "write record", move || index.put(record))
            .await
            .map_err(|err| {
                error!("failed to write record for {}: {}", record.id, err);
                FileError::MetadataWrite(err)
            })
    }

    async fn write_blob(&self, location: &str, data: Bytes) -> FileResult<i64> {
        let blobs = &self.blobs;
        let written = with_backoff(&self.retry, "write blob", move || {
            blobs.write(location, data.clone())
        })
        .await
        .map_err(FileError::StorageWrite)?;
        Ok(written as i64)
    }

    /// Roll back a blob whose record was never written.
    async fn discard_blob(&self, location: &str) {
        let blobs = &self.blobs;
        match with_backoff(&self.retry, "roll back blob", move || blobs.delete(location)).await {
            Ok(_) => debug!("rolled back blob {}", location),
            Err(err) => warn!("orphan blob {} left behind: {}", location, err),
        }
    }
}

/// Blob location for `id` at `revision`.
///
/// `{aa}/{bb}/{id}_{name}` for the first upload and `{aa}/{bb}/{id}-r{n}_{name}`
/// after each replace; `aa`/`bb` are the first two bytes of MD5(id) so files
/// spread across directories.
pub fn blob_location(id: &str, revision: i64, file_name: &str) -> String {
    let digest = md5::compute(id.as_bytes());
    let name = sanitize_file_name(file_name);
    if revision == 0 {
        format!("{:02x}/{:02x}/{}_{}", digest[0], digest[1], id, name)
    } else {
        format!(
            "{:02x}/{:02x}/{}-r{}_{}",
            digest[0], digest[1], id, revision, name
        )
    }
}

/// Reduce an uploader-supplied name to a single safe path component.
fn sanitize_file_name(file_name: &str) -> String {
    let last = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();
    let cleaned: String = last
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim()
        .trim_start_matches('.')
        .to_string();
    let cleaned = truncate_at_char_boundary(&cleaned, MAX_NAME_BYTES).trim_end();
    if cleaned.is_empty() {
        FALLBACK_FILE_NAME.to_string()
    } else {
        cleaned.to_string()
    }
}

fn truncate_at_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn content_type_or_default(content_type: Option<String>) -> String {
    content_type
        .filter(|ct| !ct.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string())
}

fn now_millis() -> chrono::DateTime<Utc> {
    let now = Utc::now();
    now.duration_trunc(TimeDelta::milliseconds(1)).unwrap_or(now)
}
