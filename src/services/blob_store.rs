//! Blob store: durable payload bytes addressed by a location string.
//!
//! `FsBlobStore` keeps every payload as a plain file beneath a root
//! directory. Locations are relative paths such as `3f/a2/<id>_report.pdf`;
//! the sharding directories are chosen by the caller.

use async_trait::async_trait;
use bytes::Bytes;
use std::{
    io::{self, ErrorKind},
    path::{Component, Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::{AsyncRead, AsyncWriteExt},
};
use tracing::debug;
use uuid::Uuid;

/// Readable stream over a stored payload.
pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

const HIDDEN_PREFIX: char = '.';

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write `data` at `location`, replacing anything already there.
    /// Returns the number of bytes written.
    async fn write(&self, location: &str, data: Bytes) -> io::Result<u64>;

    /// Open the payload at `location` for reading.
    async fn open(&self, location: &str) -> io::Result<BlobReader>;

    /// Remove the payload at `location`.
    ///
    /// Returns `Ok(false)` if nothing was stored there.
    async fn delete(&self, location: &str) -> io::Result<bool>;

    /// Byte length of the payload, `None` if it does not exist.
    async fn size(&self, location: &str) -> io::Result<Option<u64>>;

    /// Every stored location.
    async fn list(&self) -> io::Result<Vec<String>>;

    /// Cheap write/read/delete round trip used by readiness checks.
    async fn probe(&self) -> io::Result<()>;
}

/// Filesystem-backed blob store rooted at `root`.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a location beneath the root.
    ///
    /// Rejects absolute paths, `..`, empty or hidden components, backslashes
    /// and control characters.
    fn resolve(&self, location: &str) -> io::Result<PathBuf> {
        let invalid = || {
            io::Error::new(
                ErrorKind::InvalidInput,
                format!("invalid blob location `{}`", location),
            )
        };

        if location.is_empty()
            || location
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'\\')
        {
            return Err(invalid());
        }

        let mut path = self.root.clone();
        for part in location.split('/') {
            if part.is_empty() || part.starts_with(HIDDEN_PREFIX) {
                return Err(invalid());
            }
            match Path::new(part).components().next() {
                Some(Component::Normal(_)) => path.push(part),
                _ => return Err(invalid()),
            }
        }
        Ok(path)
    }

    /// Remove empty directories from `start` up to, but not including, the
    /// root.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.root) && current != self.root {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }

    /// Remove leftover temp files from interrupted writes.
    pub async fn sweep_temp_files(&self) -> io::Result<usize> {
        let mut removed = 0;
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err),
            };
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                let name = entry.file_name();
                if file_type.is_dir() {
                    pending.push(entry.path());
                } else if name.to_string_lossy().starts_with(".tmp-") {
                    fs::remove_file(entry.path()).await?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    /// Streams into a hidden temp file beside the target, fsyncs it, then
    /// renames it into place. The temp file is removed on any failure.
    async fn write(&self, location: &str, data: Bytes) -> io::Result<u64> {
        let file_path = self.resolve(location)?;
        let parent = file_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| io::Error::other("blob path missing parent directory"))?;
        fs::create_dir_all(&parent).await?;

        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let result = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(&data).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&tmp_path, &file_path).await
        }
        .await;

        if let Err(err) = result {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        debug!("wrote {} bytes to {}", data.len(), file_path.display());
        Ok(data.len() as u64)
    }

    async fn open(&self, location: &str) -> io::Result<BlobReader> {
        let file = File::open(self.resolve(location)?).await?;
        Ok(Box::new(file))
    }

    async fn delete(&self, location: &str) -> io::Result<bool> {
        let file_path = self.resolve(location)?;
        let removed = match fs::remove_file(&file_path).await {
            Ok(_) => {
                debug!("removed blob {}", file_path.display());
                true
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("blob {} already missing", file_path.display());
                false
            }
            Err(err) => return Err(err),
        };

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(removed)
    }

    async fn size(&self, location: &str) -> io::Result<Option<u64>> {
        match fs::metadata(self.resolve(location)?).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn list(&self) -> io::Result<Vec<String>> {
        let mut locations = Vec::new();
        let mut pending = vec![(self.root.clone(), String::new())];
        while let Some((dir, prefix)) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err),
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with(HIDDEN_PREFIX) {
                    continue;
                }
                let location = if prefix.is_empty() {
                    name
                } else {
                    format!("{}/{}", prefix, name)
                };
                if entry.file_type().await?.is_dir() {
                    pending.push((entry.path(), location));
                } else {
                    locations.push(location);
                }
            }
        }
        locations.sort();
        Ok(locations)
    }

    async fn probe(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await?;
        let probe_path = self.root.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&probe_path, b"readyz").await?;
        let read_back = fs::read(&probe_path).await;
        let _ = fs::remove_file(&probe_path).await;
        if read_back? != b"readyz" {
            return Err(io::Error::other("probe file content mismatch"));
        }
        Ok(())
    }
}
