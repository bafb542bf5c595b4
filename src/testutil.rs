//! In-process fakes for the request executor, retriever and storage backend.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use base64::Engine;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use crate::icloud::error::ICloudError;
use crate::icloud::photos::{CatalogQuery, MediaEntry, RequestExecutor};
use crate::storage::{StorageBackend, StorageError};
use crate::transfer::{ByteSource, Retriever, TransferError};

pub const CREATED_MILLIS: u64 = 1736935200000; // 2025-01-15T10:00:00Z

pub fn download_url(name: &str) -> String {
    format!("https://cvws.example.com/{name}")
}

/// A `CPLMaster` record with an original resolution of `size` bytes.
pub fn master_record(name: &str, size: u64) -> Value {
    json!({
        "recordName": format!("M-{name}"),
        "recordType": "CPLMaster",
        "created": {"timestamp": CREATED_MILLIS},
        "fields": {
            "filenameEnc": {
                "value": base64::engine::general_purpose::STANDARD.encode(name),
                "type": "ENCRYPTED_BYTES"
            },
            "resOriginalRes": {"value": {"size": size, "downloadURL": download_url(name)}}
        }
    })
}

/// A live photo: the still plus a companion video of `video_size` bytes.
pub fn live_record(name: &str, size: u64, video_size: u64) -> Value {
    let mut record = master_record(name, size);
    let video = format!("{name}.video");
    record["fields"]["resOriginalVidComplRes"] =
        json!({"value": {"size": video_size, "downloadURL": download_url(&video)}});
    record
}

pub fn entry(name: &str, size: u64) -> MediaEntry {
    let created = Utc
        .timestamp_millis_opt(CREATED_MILLIS as i64)
        .single()
        .unwrap();
    MediaEntry::new(name, created, size, download_url(name))
}

/// Serves the photos database queries from in-memory record lists.
pub struct FakeLibrary {
    all_media: Vec<Value>,
    recently_deleted: Vec<Value>,
    page_size: usize,
    indexing_state: String,
    server_error: Option<String>,
    failures: Mutex<VecDeque<TransferError>>,
    offsets: Mutex<Vec<(CatalogQuery, u64)>>,
}

impl FakeLibrary {
    pub fn new() -> Self {
        Self {
            all_media: Vec::new(),
            recently_deleted: Vec::new(),
            page_size: 100,
            indexing_state: "FINISHED".to_string(),
            server_error: None,
            failures: Mutex::new(VecDeque::new()),
            offsets: Mutex::new(Vec::new()),
        }
    }

    pub fn with_all_media(mut self, records: Vec<Value>) -> Self {
        self.all_media = records;
        self
    }

    pub fn with_recently_deleted(mut self, records: Vec<Value>) -> Self {
        self.recently_deleted = records;
        self
    }

    /// Cap on masters per page, independent of what the request asks for.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_indexing_state(mut self, state: &str) -> Self {
        self.indexing_state = state.to_string();
        self
    }

    pub fn with_server_error(mut self, code: &str) -> Self {
        self.server_error = Some(code.to_string());
        self
    }

    /// Fail the next `n` requests with `error`.
    pub fn failing_first(self, n: usize, error: TransferError) -> Self {
        self.failures
            .lock()
            .unwrap()
            .extend(std::iter::repeat(error).take(n));
        self
    }

    pub fn requested_offsets(&self, query: CatalogQuery) -> Vec<u64> {
        self.offsets
            .lock()
            .unwrap()
            .iter()
            .filter(|(q, _)| *q == query)
            .map(|(_, offset)| *offset)
            .collect()
    }

    fn page(&self, query: CatalogQuery, body: &Value) -> Value {
        let records = match query {
            CatalogQuery::AllMedia => &self.all_media,
            CatalogQuery::RecentlyDeleted => &self.recently_deleted,
        };
        let offset = body["query"]["filterBy"][0]["fieldValue"]["value"]
            .as_u64()
            .unwrap();
        let limit = body["resultsLimit"].as_u64().unwrap() as usize / 2;
        self.offsets.lock().unwrap().push((query, offset));

        let page: Vec<Value> = records
            .iter()
            .skip(offset as usize)
            .take(limit.min(self.page_size))
            .flat_map(|master| {
                let asset = json!({
                    "recordName": format!("A-{}", master["recordName"].as_str().unwrap_or("")),
                    "recordType": "CPLAsset",
                    "fields": {"masterRef": {"value": {"recordName": master["recordName"]}}}
                });
                [asset, master.clone()]
            })
            .collect();
        json!({"records": page})
    }
}

#[async_trait::async_trait]
impl RequestExecutor for FakeLibrary {
    async fn post(
        &self,
        _path: &str,
        body: &str,
        _headers: &[(&str, &str)],
    ) -> Result<Value, ICloudError> {
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err.into());
        }
        if let Some(code) = &self.server_error {
            return Ok(json!({"serverErrorCode": code, "reason": "fake"}));
        }
        let body: Value = serde_json::from_str(body)?;
        if body.get("batch").is_some() {
            return Ok(json!({"batch": [{"records": [{
                "recordName": "count",
                "recordType": "HyperionIndexCountLookup",
                "fields": {"itemCount": {"value": self.all_media.len()}}
            }]}]}));
        }
        match body["query"]["recordType"].as_str().unwrap_or("") {
            "CheckIndexingState" => Ok(json!({"records": [{
                "recordName": "state",
                "recordType": "CheckIndexingState",
                "fields": {"state": {"value": self.indexing_state}}
            }]})),
            "CPLAssetAndMasterByAddedDate" => Ok(self.page(CatalogQuery::AllMedia, &body)),
            "CPLAssetAndMasterDeletedByExpungedDate" => {
                Ok(self.page(CatalogQuery::RecentlyDeleted, &body))
            }
            other => panic!("unexpected query {other}"),
        }
    }
}

/// Serves bodies by URL; unknown URLs answer 404.
#[derive(Default)]
pub struct FakeRetriever {
    bodies: HashMap<String, Bytes>,
    failures: Mutex<HashMap<String, (usize, TransferError)>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl FakeRetriever {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_body(mut self, url: &str, body: &[u8]) -> Self {
        self.bodies
            .insert(url.to_string(), Bytes::copy_from_slice(body));
        self
    }

    /// Serve `size` filler bytes for the named file's download URL.
    pub fn with_file(self, name: &str, size: usize) -> Self {
        self.with_body(&download_url(name), &vec![b'x'; size])
    }

    /// Fail the next `times` requests for `url` with `error`.
    pub fn failing(self, url: &str, times: usize, error: TransferError) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(url.to_string(), (times, error));
        self
    }

    pub fn calls_for(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait::async_trait]
impl Retriever for FakeRetriever {
    async fn retrieve(&self, source_ref: &str) -> Result<ByteSource, TransferError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(source_ref.to_string())
            .or_default() += 1;
        if let Some((remaining, err)) = self.failures.lock().unwrap().get_mut(source_ref) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(err.clone());
            }
        }
        match self.bodies.get(source_ref) {
            Some(body) => Ok(ByteSource::from_chunks(vec![body.clone()])),
            None => Err(TransferError::HttpStatus {
                status: 404,
                url: source_ref.to_string(),
            }),
        }
    }
}

/// In-memory backend that records what happens to it. An optional gate
/// holds every `persist` until a permit is released.
#[derive(Default)]
pub struct RecordingBackend {
    stored: Mutex<HashMap<String, u64>>,
    persists: AtomicUsize,
    deletes: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
    unreadable: HashSet<String>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn with_stored(self, name: &str, size: u64) -> Self {
        self.stored.lock().unwrap().insert(name.to_string(), size);
        self
    }

    /// Make the existence check for `name` fail.
    pub fn with_unreadable(mut self, name: &str) -> Self {
        self.unreadable.insert(name.to_string());
        self
    }

    pub fn stored(&self, name: &str) -> Option<u64> {
        self.stored.lock().unwrap().get(name).copied()
    }

    pub fn stored_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stored.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn persists(&self) -> usize {
        self.persists.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl StorageBackend for RecordingBackend {
    fn location(&self, entry: &MediaEntry) -> String {
        entry.name.clone()
    }

    async fn stored_size(&self, entry: &MediaEntry) -> Result<Option<u64>, StorageError> {
        if self.unreadable.contains(&entry.name) {
            return Err(StorageError::io(
                entry.name.as_str(),
                std::io::Error::new(std::io::ErrorKind::PermissionDenied, "stat denied"),
            ));
        }
        Ok(self.stored(&entry.name))
    }

    async fn persist(&self, entry: &MediaEntry, source: ByteSource) -> Result<u64, StorageError> {
        self.persists.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        let mut written = 0u64;
        let mut stream = source.stream;
        let result = loop {
            match stream.next().await {
                Some(Ok(chunk)) => written += chunk.len() as u64,
                Some(Err(e)) => break Err(StorageError::Source(e)),
                None => break Ok(written),
            }
        };
        if result.is_ok() {
            self.stored
                .lock()
                .unwrap()
                .insert(entry.name.clone(), written);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn delete(&self, entry: &MediaEntry) -> Result<bool, StorageError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(self.stored.lock().unwrap().remove(&entry.name).is_some())
    }
}
