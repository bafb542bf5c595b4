//! Bounded producer/consumer download pool.
//!
//! One producer pulls units off the (lazy) enumeration and feeds a bounded
//! channel; `workers` tasks take units one at a time, fetch the bytes and
//! hand them to the storage backend. The producer blocks while the channel
//! is full, so enumeration never runs more than `queue_capacity` units ahead
//! of the downloads.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::error::DownloadError;
use crate::icloud::error::ICloudError;
use crate::icloud::photos::{EntryStream, MediaEntry};
use crate::retry::{self, RetryAction, RetryConfig};
use crate::storage::StorageBackend;
use crate::transfer::Retriever;

#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub retry: RetryConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 4,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub downloaded: usize,
    pub failed: usize,
}

impl PipelineOutcome {
    fn merge(&mut self, other: PipelineOutcome) {
        self.downloaded += other.downloaded;
        self.failed += other.failed;
    }
}

/// Everything a worker needs, shared by all of them.
struct WorkerContext {
    queue: Mutex<mpsc::Receiver<MediaEntry>>,
    retriever: Arc<dyn Retriever>,
    backend: Arc<dyn StorageBackend>,
    retry: RetryConfig,
    shutdown: CancellationToken,
}

/// Download every unit of `units`, returning once all queued units are
/// processed and every worker has exited.
///
/// Per-unit failures are counted, never propagated. An enumeration error
/// stops the producer; units already queued still finish before the error
/// is returned.
pub async fn run_pipeline(
    mut units: EntryStream,
    retriever: Arc<dyn Retriever>,
    backend: Arc<dyn StorageBackend>,
    config: PipelineConfig,
    shutdown: CancellationToken,
) -> Result<PipelineOutcome, ICloudError> {
    let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
    let ctx = Arc::new(WorkerContext {
        queue: Mutex::new(rx),
        retriever,
        backend,
        retry: config.retry,
        shutdown: shutdown.clone(),
    });

    let mut workers = JoinSet::new();
    for id in 0..config.workers.max(1) {
        let ctx = Arc::clone(&ctx);
        workers.spawn(worker_loop(ctx).instrument(tracing::info_span!("worker", id)));
    }
    // Workers own the receiver from here on, so a send fails once they are all gone.
    drop(ctx);

    let mut enumeration_error = None;
    while let Some(item) = units.next().await {
        if shutdown.is_cancelled() {
            tracing::info!("Shutdown requested, not queueing further downloads");
            break;
        }
        let unit = match item {
            Ok(unit) => unit,
            Err(e) => {
                enumeration_error = Some(e);
                break;
            }
        };
        tokio::select! {
            sent = tx.send(unit) => {
                if sent.is_err() {
                    tracing::warn!("All download workers exited early");
                    break;
                }
            }
            _ = shutdown.cancelled() => {
                tracing::info!("Shutdown requested, not queueing further downloads");
                break;
            }
        }
    }
    drop(tx);

    tracing::info!("Waiting for all downloads to complete...");
    let mut outcome = PipelineOutcome::default();
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(tally) => outcome.merge(tally),
            Err(e) => tracing::error!("Download worker failed: {}", e),
        }
    }
    tracing::info!("...Done downloading");

    match enumeration_error {
        Some(e) => Err(e),
        None => Ok(outcome),
    }
}

async fn worker_loop(ctx: Arc<WorkerContext>) -> PipelineOutcome {
    let mut tally = PipelineOutcome::default();
    loop {
        let next = ctx.queue.lock().await.recv().await;
        let Some(unit) = next else { break };
        if ctx.shutdown.is_cancelled() {
            break;
        }

        let location = ctx.backend.location(&unit);
        tracing::info!("Downloading {}", location);
        match download_unit(&ctx, &unit).await {
            Ok(bytes) => {
                tracing::debug!(path = %location, size_bytes = bytes, "Downloaded");
                tally.downloaded += 1;
            }
            Err(e) => {
                tracing::error!("Could not download {}! {}", location, e);
                tally.failed += 1;
            }
        }
    }
    tally
}

/// Fetch and persist one unit, retrying connectivity failures in place.
async fn download_unit(ctx: &WorkerContext, unit: &MediaEntry) -> Result<u64, DownloadError> {
    let retriever = ctx.retriever.as_ref();
    let backend = ctx.backend.as_ref();
    retry::retry_fixed(
        &ctx.retry,
        &ctx.shutdown,
        |e: &DownloadError| {
            if e.is_retryable() {
                RetryAction::Retry
            } else {
                RetryAction::Abort
            }
        },
        || async move {
            let source = retriever.retrieve(&unit.source_ref).await?;
            Ok(backend.persist(unit, source).await?)
        },
    )
    .await
}
