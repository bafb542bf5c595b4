use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::cloudkit::{BatchQueryResponse, QueryResponse, ServerError};
use super::media::MediaEntry;
use super::queries::{self, CatalogQuery, MASTER_RECORD_TYPE, TEXT_PLAIN};
use super::session::RequestExecutor;
use crate::icloud::error::ICloudError;
use crate::retry::{self, RetryAction, RetryConfig};

pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Lazy stream of catalog entries; an `Err` item ends the stream.
pub type EntryStream = BoxStream<'static, Result<MediaEntry, ICloudError>>;

/// Server-side pagination position, advanced by the number of primary
/// (master) records each page returned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageCursor {
    pub offset: u64,
}

impl PageCursor {
    pub fn advance(self, masters: usize) -> Self {
        Self {
            offset: self.offset + masters as u64,
        }
    }
}

/// Shared request plumbing for every query against one zone.
#[derive(Clone)]
struct ZoneClient {
    executor: Arc<dyn RequestExecutor>,
    zone_id: Value,
    retry: RetryConfig,
    shutdown: CancellationToken,
}

impl ZoneClient {
    async fn post(&self, path: &str, body: &Value) -> Result<Value, ICloudError> {
        let body = body.to_string();
        let response = retry::retry_fixed(
            &self.retry,
            &self.shutdown,
            |e: &ICloudError| {
                if e.is_connectivity() {
                    RetryAction::Retry
                } else {
                    RetryAction::Abort
                }
            },
            || self.executor.post(path, &body, TEXT_PLAIN),
        )
        .await?;
        check_server_error(&response)?;
        Ok(response)
    }
}

fn check_server_error(response: &Value) -> Result<(), ICloudError> {
    if response.get("serverErrorCode").is_none() {
        return Ok(());
    }
    let err: ServerError = serde_json::from_value(response.clone())?;
    Err(ICloudError::ApiResponse {
        reason: err.reason,
        code: err.server_error_code,
    })
}

/// Retrieves one page of media entries at a time.
#[derive(Clone)]
pub struct PageFetcher {
    client: ZoneClient,
    query: CatalogQuery,
    page_size: usize,
}

impl PageFetcher {
    /// Fetch the page at `cursor`, returning the decoded masters and the
    /// cursor for the next page. Any undecodable master fails the page.
    pub async fn fetch(
        &self,
        cursor: PageCursor,
    ) -> Result<(Vec<MediaEntry>, PageCursor), ICloudError> {
        let body = queries::list_query(
            self.query,
            cursor.offset,
            self.page_size,
            &self.client.zone_id,
        );
        let response = self
            .client
            .post(queries::RECORDS_QUERY_PATH, &body)
            .await?;
        let page: QueryResponse = serde_json::from_value(response)?;

        let entries = page
            .records
            .iter()
            .filter(|r| r.record_type == MASTER_RECORD_TYPE)
            .map(MediaEntry::from_record)
            .collect::<Result<Vec<_>, _>>()?;
        debug!(
            query = ?self.query,
            offset = cursor.offset,
            masters = entries.len(),
            "Received master records"
        );
        let next = cursor.advance(entries.len());
        Ok((entries, next))
    }
}

/// Restartable view over one catalog query. Each call to [`entries`]
/// enumerates from offset 0; a single enumeration is forward-only.
///
/// [`entries`]: MediaCatalog::entries
#[derive(Clone)]
pub struct MediaCatalog {
    fetcher: PageFetcher,
}

impl MediaCatalog {
    pub fn new(fetcher: PageFetcher) -> Self {
        Self { fetcher }
    }

    /// Lazily page through the catalog until a page has no masters.
    pub fn entries(&self) -> EntryStream {
        let fetcher = self.fetcher.clone();
        stream::try_unfold(
            (fetcher, PageCursor::default(), VecDeque::new()),
            |(fetcher, mut cursor, mut buffered)| async move {
                loop {
                    if let Some(entry) = buffered.pop_front() {
                        return Ok(Some((entry, (fetcher, cursor, buffered))));
                    }
                    let (page, next) = fetcher.fetch(cursor).await?;
                    if page.is_empty() {
                        debug!(offset = cursor.offset, "No more master records");
                        return Ok(None);
                    }
                    buffered.extend(page);
                    cursor = next;
                }
            },
        )
        .boxed()
    }
}

/// The primary photo library zone.
pub struct PhotoLibrary {
    client: ZoneClient,
    page_size: usize,
}

impl PhotoLibrary {
    pub fn new(
        executor: Arc<dyn RequestExecutor>,
        page_size: usize,
        retry: RetryConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            client: ZoneClient {
                executor,
                zone_id: json!({"zoneName": "PrimarySync"}),
                retry,
                shutdown,
            },
            page_size: page_size.max(1),
        }
    }

    /// Fail unless the server reports the library as fully indexed.
    pub async fn check_indexing(&self) -> Result<(), ICloudError> {
        let body = queries::indexing_state_query(&self.client.zone_id);
        let response = self
            .client
            .post(queries::RECORDS_QUERY_PATH, &body)
            .await?;
        let query: QueryResponse = serde_json::from_value(response)?;
        let state = query
            .records
            .first()
            .and_then(|r| r.fields["state"]["value"].as_str())
            .unwrap_or("");
        if state != "FINISHED" {
            return Err(ICloudError::IndexingNotFinished);
        }
        Ok(())
    }

    /// Total number of items, via `HyperionIndexCountLookup`.
    pub async fn item_count(&self) -> Result<u64, ICloudError> {
        let body = queries::count_query(&self.client.zone_id);
        let response = self.client.post(queries::BATCH_QUERY_PATH, &body).await?;
        let batch: BatchQueryResponse = serde_json::from_value(response)?;
        batch
            .batch
            .first()
            .and_then(|q| q.records.first())
            .and_then(|r| r.fields["itemCount"]["value"].as_u64())
            .ok_or_else(|| ICloudError::UnexpectedResponse("missing itemCount".to_string()))
    }

    pub fn catalog(&self, query: CatalogQuery) -> MediaCatalog {
        MediaCatalog::new(PageFetcher {
            client: self.client.clone(),
            query,
            page_size: self.page_size,
        })
    }
}

impl std::fmt::Debug for PhotoLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhotoLibrary")
            .field("zone_id", &self.client.zone_id)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}
