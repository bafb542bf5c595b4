use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_util::stream::{BoxStream, StreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{MultipartUpload, ObjectStore, PutPayload};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::task::JoinSet;

use super::{relative_components, StorageBackend, StorageError, DEFAULT_SPILL_THRESHOLD};
use crate::icloud::photos::MediaEntry;
use crate::transfer::{ByteSource, TransferError};

type ChunkStream = BoxStream<'static, Result<Bytes, TransferError>>;

/// Stand-in path for errors on the anonymous spill file.
const SPILL_FILE: &str = "<spill file>";

/// Part size used when uploading a spilled payload.
const UPLOAD_CHUNK_SIZE: usize = 8 * 1024 * 1024;
/// Parts in flight per multipart upload.
const UPLOAD_CONCURRENCY: usize = 4;

/// Connection settings for an S3-compatible bucket.
#[derive(Clone)]
pub struct BucketSettings {
    pub bucket: String,
    pub endpoint: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Key prefix every object is stored under; may be empty.
    pub prefix: String,
    pub spill_threshold: u64,
}

impl std::fmt::Debug for BucketSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketSettings")
            .field("bucket", &self.bucket)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("prefix", &self.prefix)
            .field("spill_threshold", &self.spill_threshold)
            .finish()
    }
}

/// Objects in a bucket, keyed `<prefix>/YYYY/MM/DD/<name>`.
pub struct BucketStorage {
    store: Arc<dyn ObjectStore>,
    prefix: Vec<String>,
    spill_threshold: u64,
}

impl BucketStorage {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: &str) -> Self {
        Self {
            store,
            prefix: prefix
                .split('/')
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
            spill_threshold: DEFAULT_SPILL_THRESHOLD,
        }
    }

    pub fn with_spill_threshold(mut self, threshold: u64) -> Self {
        self.spill_threshold = threshold;
        self
    }

    /// Connect to an S3-compatible endpoint.
    pub fn s3(settings: &BucketSettings) -> Result<Self, StorageError> {
        let store = AmazonS3Builder::new()
            .with_bucket_name(&settings.bucket)
            .with_endpoint(&settings.endpoint)
            .with_region(&settings.region)
            .with_access_key_id(&settings.access_key_id)
            .with_secret_access_key(&settings.secret_access_key)
            .build()
            .map_err(StorageError::Config)?;
        Ok(Self::new(Arc::new(store), &settings.prefix)
            .with_spill_threshold(settings.spill_threshold))
    }

    pub fn key_for(&self, entry: &MediaEntry) -> ObjectPath {
        ObjectPath::from_iter(
            self.prefix
                .iter()
                .cloned()
                .chain(relative_components(entry)),
        )
    }

    fn store_error(key: &ObjectPath, source: object_store::Error) -> StorageError {
        StorageError::ObjectStore {
            key: key.to_string(),
            source,
        }
    }

    /// Buffer the payload in memory and upload it in one request. A payload
    /// that grows past the spill threshold moves to [`Self::put_spilled`]
    /// with what has been buffered so far.
    async fn put_buffered(
        &self,
        key: &ObjectPath,
        source: ByteSource,
    ) -> Result<u64, StorageError> {
        let capacity = source
            .content_length
            .unwrap_or(0)
            .min(self.spill_threshold) as usize;
        let mut buffer = BytesMut::with_capacity(capacity);
        let mut stream = source.stream;
        while let Some(chunk) = stream.next().await {
            buffer.extend_from_slice(&chunk?);
            if buffer.len() as u64 > self.spill_threshold {
                tracing::debug!(key = %key, "Payload outgrew the memory buffer, spilling");
                return self.put_spilled(key, buffer.freeze(), stream).await;
            }
        }
        let written = buffer.len() as u64;
        self.store
            .put(key, PutPayload::from(buffer.freeze()))
            .await
            .map_err(|e| Self::store_error(key, e))?;
        Ok(written)
    }

    /// Write `head` and then the rest of `stream` to an anonymous temp file,
    /// and upload that as a multipart upload. The temp file is removed when
    /// dropped.
    async fn put_spilled(
        &self,
        key: &ObjectPath,
        head: Bytes,
        mut stream: ChunkStream,
    ) -> Result<u64, StorageError> {
        let temp = tempfile::tempfile().map_err(|e| StorageError::io(SPILL_FILE, e))?;
        let mut file = tokio::fs::File::from_std(temp);
        let spill_err = |e| StorageError::io(SPILL_FILE, e);

        file.write_all(&head).await.map_err(spill_err)?;
        let mut written = head.len() as u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await.map_err(spill_err)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(spill_err)?;
        file.rewind().await.map_err(spill_err)?;
        tracing::debug!(key = %key, size_bytes = written, "Spilled payload to temp file");

        let mut upload = self
            .store
            .put_multipart(key)
            .await
            .map_err(|e| Self::store_error(key, e))?;
        let result = match send_parts(upload.as_mut(), &mut file, key).await {
            Ok(()) => upload
                .complete()
                .await
                .map(|_| ())
                .map_err(|e| Self::store_error(key, e)),
            Err(e) => Err(e),
        };
        if result.is_err() {
            if let Err(e) = upload.abort().await {
                tracing::warn!(key = %key, "Could not abort multipart upload: {}", e);
            }
        }
        result.map(|()| written)
    }
}

/// Upload `file` in `UPLOAD_CHUNK_SIZE` parts, at most `UPLOAD_CONCURRENCY`
/// at a time. Completing or aborting the upload is left to the caller.
async fn send_parts(
    upload: &mut dyn MultipartUpload,
    file: &mut tokio::fs::File,
    key: &ObjectPath,
) -> Result<(), StorageError> {
    let mut in_flight = JoinSet::new();
    loop {
        let mut part = vec![0u8; UPLOAD_CHUNK_SIZE];
        let n = read_full(file, &mut part)
            .await
            .map_err(|e| StorageError::io(SPILL_FILE, e))?;
        if n == 0 {
            break;
        }
        part.truncate(n);
        in_flight.spawn(upload.put_part(PutPayload::from(part)));
        if in_flight.len() >= UPLOAD_CONCURRENCY {
            join_part(&mut in_flight, key).await?;
        }
        if n < UPLOAD_CHUNK_SIZE {
            break;
        }
    }
    while !in_flight.is_empty() {
        join_part(&mut in_flight, key).await?;
    }
    Ok(())
}

async fn join_part(
    in_flight: &mut JoinSet<object_store::Result<()>>,
    key: &ObjectPath,
) -> Result<(), StorageError> {
    match in_flight.join_next().await {
        None | Some(Ok(Ok(()))) => Ok(()),
        Some(Ok(Err(e))) => Err(BucketStorage::store_error(key, e)),
        Some(Err(e)) => Err(StorageError::io(SPILL_FILE, std::io::Error::from(e))),
    }
}

/// Fill `buf` unless the file ends first; every part but the last must be
/// full-sized.
async fn read_full(file: &mut tokio::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]).await? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

impl std::fmt::Debug for BucketStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketStorage")
            .field("store", &self.store.to_string())
            .field("prefix", &self.prefix)
            .field("spill_threshold", &self.spill_threshold)
            .finish()
    }
}

#[async_trait::async_trait]
impl StorageBackend for BucketStorage {
    fn location(&self, entry: &MediaEntry) -> String {
        self.key_for(entry).to_string()
    }

    async fn stored_size(&self, entry: &MediaEntry) -> Result<Option<u64>, StorageError> {
        let key = self.key_for(entry);
        match self.store.head(&key).await {
            Ok(meta) => Ok(Some(meta.size as u64)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(Self::store_error(&key, e)),
        }
    }

    async fn persist(&self, entry: &MediaEntry, source: ByteSource) -> Result<u64, StorageError> {
        let key = self.key_for(entry);
        let announced = source.content_length.unwrap_or(entry.expected_size);
        let written = if announced > self.spill_threshold {
            self.put_spilled(&key, Bytes::new(), source.stream).await?
        } else {
            self.put_buffered(&key, source).await?
        };
        tracing::debug!(key = %key, size_bytes = written, "Stored object");
        Ok(written)
    }

    async fn delete(&self, entry: &MediaEntry) -> Result<bool, StorageError> {
        let key = self.key_for(entry);
        match self.store.head(&key).await {
            Ok(_) => {}
            Err(object_store::Error::NotFound { .. }) => return Ok(false),
            Err(e) => return Err(Self::store_error(&key, e)),
        }
        self.store
            .delete(&key)
            .await
            .map_err(|e| Self::store_error(&key, e))?;
        Ok(true)
    }
}
