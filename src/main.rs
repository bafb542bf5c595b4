//! icloud-backup: incremental mirror of an iCloud Photos library.
//!
//! Pages through the library's CloudKit catalog, skips everything already
//! stored at the expected size, and downloads the rest with a bounded worker
//! pool into a local directory tree or an S3-compatible bucket. Optionally
//! removes stored copies of items that sit in "Recently Deleted".

#![warn(clippy::all)]

mod backup;
mod cli;
mod config;
mod icloud;
mod retry;
mod session;
mod shutdown;
mod storage;
#[cfg(test)]
mod testutil;
mod transfer;
mod types;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use config::{Config, StorageTarget};
use icloud::photos::PhotoLibrary;
use storage::{BucketStorage, FilesystemStorage, StorageBackend};
use transfer::Retriever;

fn build_backend(target: &StorageTarget) -> anyhow::Result<Arc<dyn StorageBackend>> {
    Ok(match target {
        StorageTarget::Filesystem { root } => {
            tracing::info!("Backing up to directory {}", root.display());
            Arc::new(FilesystemStorage::new(root.clone()))
        }
        StorageTarget::Bucket(settings) => {
            tracing::info!(
                "Backing up to bucket {} at {}",
                settings.bucket,
                settings.endpoint
            );
            Arc::new(BucketStorage::s3(settings).context("Failed to configure object store")?)
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter())),
        )
        .init();

    let config = Config::from_cli(cli)?;
    tracing::debug!(?config, "Loaded configuration");
    tracing::info!(
        concurrency = config.threads_num,
        domain = config.domain.as_str(),
        "Starting icloud-backup"
    );

    let backend = build_backend(&config.target)?;

    let session = session::Session::open(&config.session_settings())
        .await
        .context("Failed to load iCloud session")?;
    tracing::debug!("Photos endpoint {}", session.endpoint());
    let retriever: Arc<dyn Retriever> = Arc::new(session.download_client());

    let shutdown_token =
        shutdown::install_signal_handler().context("Failed to install signal handlers")?;

    let library = PhotoLibrary::new(
        Arc::new(session),
        config.page_size,
        config.retry(),
        shutdown_token.clone(),
    );

    let options = config.backup_options();
    let summary = backup::run(&library, retriever, backend, &options, shutdown_token).await?;
    summary.log(options.only_print);

    Ok(())
}
