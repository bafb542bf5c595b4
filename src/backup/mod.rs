//! Backup orchestration: catalog → skip filter → expander → download pool,
//! then the optional "recently deleted" pass.

mod deletion;
mod error;
mod filter;
mod pipeline;

use deletion::delete_removed;
use filter::{expand, skip_already_stored};
use pipeline::run_pipeline;
pub use pipeline::PipelineConfig;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::icloud::photos::{CatalogQuery, EntryStream, PhotoLibrary};
use crate::storage::StorageBackend;
use crate::transfer::Retriever;

#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    /// Only consider the first N catalog entries.
    pub recent: Option<usize>,
    /// Stop after this many consecutive already-stored entries.
    pub until_found: Option<u32>,
    /// Remove stored copies of items in "Recently Deleted".
    pub auto_delete: bool,
    /// Log what would be downloaded or deleted; touch nothing.
    pub only_print: bool,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupSummary {
    pub downloaded: usize,
    pub failed: usize,
    pub deleted: usize,
    pub delete_failed: usize,
    /// Units listed in only-print mode.
    pub printed: usize,
    pub elapsed: Duration,
}

impl BackupSummary {
    pub fn log(&self, only_print: bool) {
        tracing::info!("── Summary ──");
        if only_print {
            tracing::info!("  {} files would be processed", self.printed);
        } else {
            tracing::info!(
                "  {} downloaded, {} failed, {} total",
                self.downloaded,
                self.failed,
                self.downloaded + self.failed
            );
            if self.deleted > 0 || self.delete_failed > 0 {
                tracing::info!("  {} deleted, {} not deleted", self.deleted, self.delete_failed);
            }
        }
        tracing::info!("  elapsed: {}", format_duration(self.elapsed));
    }
}

/// Mirror the library into `backend`.
///
/// Unit-level failures are counted in the summary and do not fail the run;
/// only library checks and enumeration errors do. After a shutdown request
/// the deletion pass is skipped.
pub async fn run(
    library: &PhotoLibrary,
    retriever: Arc<dyn Retriever>,
    backend: Arc<dyn StorageBackend>,
    options: &BackupOptions,
    shutdown: CancellationToken,
) -> anyhow::Result<BackupSummary> {
    let started = Instant::now();

    library
        .check_indexing()
        .await
        .context("Photo library is not ready")?;
    match library.item_count().await {
        Ok(count) => tracing::info!("Number of photos and videos: {}", count),
        Err(e) => tracing::warn!("Could not count library items: {}", e),
    }

    let mut entries = library.catalog(CatalogQuery::AllMedia).entries();
    if let Some(recent) = options.recent {
        tracing::info!("Downloading {} recent items", recent);
        entries = entries.take(recent).boxed();
    }
    let units = expand(skip_already_stored(
        entries,
        Arc::clone(&backend),
        options.until_found,
    ));

    let mut summary = BackupSummary::default();
    if options.only_print {
        summary.printed += print_units(units).await?;
    } else {
        let outcome = run_pipeline(
            units,
            retriever,
            Arc::clone(&backend),
            options.pipeline,
            shutdown.clone(),
        )
        .await
        .context("Enumerating the photo library failed")?;
        summary.downloaded = outcome.downloaded;
        summary.failed = outcome.failed;
    }

    if options.auto_delete {
        if shutdown.is_cancelled() {
            tracing::info!("Shutdown requested, skipping deletion of removed items");
        } else {
            tracing::info!("Deleting any files found in 'Recently Deleted'...");
            let removed = expand(library.catalog(CatalogQuery::RecentlyDeleted).entries());
            if options.only_print {
                summary.printed += print_units(removed).await?;
            } else {
                let outcome = delete_removed(removed, backend.as_ref())
                    .await
                    .context("Enumerating recently deleted items failed")?;
                summary.deleted = outcome.deleted;
                summary.delete_failed = outcome.failed;
            }
        }
    }

    summary.elapsed = started.elapsed();
    Ok(summary)
}

/// One log line per unit name, in enumeration order.
async fn print_units(mut units: EntryStream) -> anyhow::Result<usize> {
    let mut count = 0;
    while let Some(unit) = units.next().await {
        let unit = unit.context("Enumerating the photo library failed")?;
        tracing::info!("{}", unit.name);
        count += 1;
    }
    Ok(count)
}

fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {:02}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}
