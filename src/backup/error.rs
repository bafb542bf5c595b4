use thiserror::Error;

use crate::storage::StorageError;
use crate::transfer::TransferError;

/// Failure of a single unit's retrieve-and-persist attempt.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl DownloadError {
    /// Only connectivity failures are retried, whether they surfaced while
    /// opening the source or midway through persisting it.
    pub fn is_retryable(&self) -> bool {
        match self {
            DownloadError::Transfer(t) => t.is_connectivity(),
            DownloadError::Storage(StorageError::Source(t)) => t.is_connectivity(),
            DownloadError::Storage(_) => false,
        }
    }
}
