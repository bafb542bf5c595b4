//! Byte retrieval seam between "what to fetch" and "where it goes".
//!
//! A [`Retriever`] turns a media `source_ref` into a [`ByteSource`]; storage
//! backends consume the source chunk by chunk without knowing where it came
//! from.

use bytes::Bytes;
use futures_util::stream::{BoxStream, StreamExt};
use thiserror::Error;

/// Network-level failures while obtaining bytes.
///
/// Only [`TransferError::Connection`] and [`TransferError::Timeout`] count as
/// connectivity failures; everything else is permanent for the current unit.
#[derive(Debug, Clone, Error)]
pub enum TransferError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("HTTP error {status} fetching {url}")]
    HttpStatus { status: u16, url: String },

    #[error("request failed: {0}")]
    Request(String),
}

impl TransferError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, TransferError::Connection(_) | TransferError::Timeout(_))
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransferError::Timeout(e.to_string())
        } else if e.is_connect() || e.is_body() || e.is_request() {
            // Resets mid-body surface as body/request errors rather than connect errors.
            TransferError::Connection(e.to_string())
        } else if let Some(status) = e.status() {
            TransferError::HttpStatus {
                status: status.as_u16(),
                url: e.url().map(|u| u.to_string()).unwrap_or_default(),
            }
        } else {
            TransferError::Request(e.to_string())
        }
    }
}

/// A streaming body plus its advertised length, if any.
pub struct ByteSource {
    pub content_length: Option<u64>,
    pub stream: BoxStream<'static, Result<Bytes, TransferError>>,
}

impl ByteSource {
    pub fn new(
        content_length: Option<u64>,
        stream: BoxStream<'static, Result<Bytes, TransferError>>,
    ) -> Self {
        Self {
            content_length,
            stream,
        }
    }

    /// Wrap already-buffered chunks.
    #[cfg(test)]
    pub fn from_chunks(chunks: Vec<Bytes>) -> Self {
        let len = chunks.iter().map(|c| c.len() as u64).sum();
        Self {
            content_length: Some(len),
            stream: futures_util::stream::iter(chunks.into_iter().map(Ok)).boxed(),
        }
    }
}

impl std::fmt::Debug for ByteSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteSource")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Obtains a streaming byte source for a media locator.
#[async_trait::async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, source_ref: &str) -> Result<ByteSource, TransferError>;
}

#[async_trait::async_trait]
impl Retriever for reqwest::Client {
    async fn retrieve(&self, source_ref: &str) -> Result<ByteSource, TransferError> {
        let response = self.get(source_ref).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::HttpStatus {
                status: status.as_u16(),
                url: source_ref.to_string(),
            });
        }
        let content_length = response.content_length();
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(TransferError::from))
            .boxed();
        Ok(ByteSource::new(content_length, stream))
    }
}
