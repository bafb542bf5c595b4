use thiserror::Error;

use crate::transfer::TransferError;

#[derive(Error, Debug)]
pub enum ICloudError {
    #[error("API response error: {reason} (code: {code})")]
    ApiResponse { reason: String, code: String },
    #[error("Photo library not finished indexing, try again in a few minutes")]
    IndexingNotFinished,
    #[error("Malformed record {record}: missing or invalid '{field}'")]
    MalformedRecord { record: String, field: String },
    #[error("Unexpected response shape: {0}")]
    UnexpectedResponse(String),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ICloudError {
    /// Whether the failure is a dropped connection or timeout, which is the
    /// only class of enumeration failure worth retrying.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, ICloudError::Transfer(t) if t.is_connectivity())
    }
}
