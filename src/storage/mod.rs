//! Destinations for downloaded media.
//!
//! Every unit lands at `YYYY/MM/DD/<file name>` under the backend's root,
//! dated by the entry's creation time in UTC.

mod bucket;
mod error;
mod filesystem;

pub use bucket::{BucketSettings, BucketStorage};
pub use error::StorageError;
pub use filesystem::FilesystemStorage;

use chrono::Datelike;

use crate::icloud::photos::MediaEntry;
use crate::transfer::ByteSource;

/// Payloads above this size are spilled to a temp file before upload.
pub const DEFAULT_SPILL_THRESHOLD: u64 = 50 * 1024 * 1024;

/// Remove characters that are invalid on common filesystems or would split
/// the name into extra path segments.
pub fn clean_filename(filename: &str) -> String {
    filename
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .collect()
}

/// `[YYYY, MM, DD, name]` for an entry.
pub fn relative_components(entry: &MediaEntry) -> [String; 4] {
    let created = entry.created;
    [
        format!("{:04}", created.year()),
        format!("{:02}", created.month()),
        format!("{:02}", created.day()),
        clean_filename(&entry.name),
    ]
}

/// Where and how units are stored.
///
/// `location` is deterministic and depends only on the entry, so the same
/// entry always maps to the same destination.
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync {
    /// Human-readable destination, used in log lines.
    fn location(&self, entry: &MediaEntry) -> String;

    /// Size of what is currently stored for `entry`, or `None` if absent.
    async fn stored_size(&self, entry: &MediaEntry) -> Result<Option<u64>, StorageError>;

    /// Consume `source` and store it at the entry's destination, returning
    /// the number of bytes written. Parent containers are created as needed.
    async fn persist(&self, entry: &MediaEntry, source: ByteSource) -> Result<u64, StorageError>;

    /// Remove the entry's destination. `Ok(false)` if it was not there.
    async fn delete(&self, entry: &MediaEntry) -> Result<bool, StorageError>;

    /// True iff the destination exists with exactly the expected size.
    ///
    /// A size mismatch is logged and reported as absent so the unit is
    /// fetched again. Lookup errors also count as absent.
    async fn already_stored(&self, entry: &MediaEntry) -> bool {
        match self.stored_size(entry).await {
            Ok(Some(size)) if size == entry.expected_size => true,
            Ok(Some(size)) => {
                tracing::warn!(
                    "Re-downloading {} because sizes were different: {} & {}",
                    self.location(entry),
                    size,
                    entry.expected_size
                );
                false
            }
            Ok(None) => false,
            Err(e) => {
                tracing::warn!("Could not check {}: {}", self.location(entry), e);
                false
            }
        }
    }
}
