use std::fs::FileTimes;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::StreamExt;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::{relative_components, StorageBackend, StorageError};
use crate::icloud::photos::MediaEntry;
use crate::transfer::ByteSource;

/// Local directory tree rooted at `root`.
#[derive(Debug, Clone)]
pub struct FilesystemStorage {
    root: PathBuf,
}

impl FilesystemStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, entry: &MediaEntry) -> PathBuf {
        let mut path = self.root.clone();
        path.extend(relative_components(entry));
        path
    }
}

/// `photo.jpg` -> `photo.jpg.part`, in the same directory so the final
/// rename never crosses filesystems.
fn part_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}

async fn write_part(part: &Path, source: ByteSource) -> Result<u64, StorageError> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(part)
        .await
        .map_err(|e| StorageError::io(part, e))?;

    let mut written: u64 = 0;
    let mut stream = source.stream;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk)
            .await
            .map_err(|e| StorageError::io(part, e))?;
        written += chunk.len() as u64;
    }
    file.flush().await.map_err(|e| StorageError::io(part, e))?;
    Ok(written)
}

#[async_trait::async_trait]
impl StorageBackend for FilesystemStorage {
    fn location(&self, entry: &MediaEntry) -> String {
        self.path_for(entry).display().to_string()
    }

    async fn stored_size(&self, entry: &MediaEntry) -> Result<Option<u64>, StorageError> {
        let path = self.path_for(entry);
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    async fn persist(&self, entry: &MediaEntry, source: ByteSource) -> Result<u64, StorageError> {
        let path = self.path_for(entry);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(parent, e))?;
        }

        let part = part_path(&path);
        let written = match write_part(&part, source).await {
            Ok(n) => n,
            Err(e) => {
                let _ = fs::remove_file(&part).await;
                return Err(e);
            }
        };
        fs::rename(&part, &path)
            .await
            .map_err(|e| StorageError::io(&path, e))?;

        let mtime_path = path.clone();
        let timestamp = entry.created.timestamp();
        match tokio::task::spawn_blocking(move || set_file_mtime(&mtime_path, timestamp)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Could not set mtime on {}: {}", path.display(), e),
            Err(e) => tracing::warn!("mtime task failed for {}: {}", path.display(), e),
        }

        tracing::debug!(path = %path.display(), size_bytes = written, "Stored file");
        Ok(written)
    }

    async fn delete(&self, entry: &MediaEntry) -> Result<bool, StorageError> {
        let path = self.path_for(entry);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }
}

/// Set the modification and access times of a file to a Unix timestamp.
/// Dates before 1970 are handled by subtracting from the epoch.
fn set_file_mtime(path: &Path, timestamp: i64) -> std::io::Result<()> {
    let time = if timestamp >= 0 {
        UNIX_EPOCH + Duration::from_secs(timestamp as u64)
    } else {
        UNIX_EPOCH
            .checked_sub(Duration::from_secs(timestamp.unsigned_abs()))
            .unwrap_or(SystemTime::UNIX_EPOCH)
    };
    let times = FileTimes::new().set_modified(time).set_accessed(time);
    let file = std::fs::File::options().write(true).open(path)?;
    file.set_times(times)?;
    Ok(())
}
