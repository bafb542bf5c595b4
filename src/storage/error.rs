use std::path::PathBuf;

use thiserror::Error;

use crate::transfer::TransferError;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Object store error on {key}: {source}")]
    ObjectStore {
        key: String,
        #[source]
        source: object_store::Error,
    },

    #[error("Object store configuration error: {0}")]
    Config(#[source] object_store::Error),

    /// The byte source failed while the payload was being consumed.
    #[error(transparent)]
    Source(#[from] TransferError),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}
