use std::path::PathBuf;

use anyhow::{bail, Context};

use crate::backup::{BackupOptions, PipelineConfig};
use crate::retry::RetryConfig;
use crate::session::SessionSettings;
use crate::storage::BucketSettings;
use crate::types::Domain;

/// Where the backup lands.
#[derive(Debug, Clone)]
pub enum StorageTarget {
    Filesystem { root: PathBuf },
    Bucket(BucketSettings),
}

/// Validated application configuration.
pub struct Config {
    pub username: String,
    pub cookie_directory: PathBuf,
    pub service_root: Option<String>,
    pub dsid: Option<String>,
    pub target: StorageTarget,

    pub timeout_secs: u64,
    pub page_size: usize,
    pub recent: Option<usize>,
    pub until_found: Option<u32>,
    pub threads_num: usize,
    pub queue_capacity: usize,
    pub max_retries: u32,
    pub retry_delay_secs: u64,

    pub domain: Domain,

    pub auto_delete: bool,
    pub only_print: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("username", &self.username)
            .field("cookie_directory", &self.cookie_directory)
            .field("service_root", &self.service_root)
            .field("dsid", &self.dsid.as_ref().map(|_| "<redacted>"))
            .field("target", &self.target)
            .field("threads_num", &self.threads_num)
            .field("queue_capacity", &self.queue_capacity)
            .field("only_print", &self.only_print)
            .finish_non_exhaustive()
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

impl Config {
    pub fn from_cli(cli: crate::cli::Cli) -> anyhow::Result<Self> {
        if cli.threads_num == 0 {
            bail!("--threads-num must be at least 1");
        }
        if cli.queue_capacity == 0 {
            bail!("--queue-capacity must be at least 1");
        }
        if cli.max_retries == 0 {
            bail!("--max-retries must be at least 1");
        }
        if cli.page_size == 0 {
            bail!("--page-size must be at least 1");
        }

        let target = match cli.bucket {
            Some(bucket) => StorageTarget::Bucket(BucketSettings {
                bucket,
                endpoint: cli.endpoint,
                region: cli.region,
                access_key_id: cli
                    .access_key_id
                    .context("--bucket requires --access-key-id or AWS_ACCESS_KEY_ID")?,
                secret_access_key: cli
                    .secret_access_key
                    .context("--bucket requires --secret-access-key or AWS_SECRET_ACCESS_KEY")?,
                prefix: cli.destination,
                spill_threshold: cli.spill_threshold_mib.saturating_mul(1024 * 1024),
            }),
            None => StorageTarget::Filesystem {
                root: expand_tilde(&cli.destination),
            },
        };

        Ok(Self {
            username: cli.username,
            cookie_directory: expand_tilde(&cli.cookie_directory),
            service_root: cli.service_root,
            dsid: cli.dsid,
            target,
            timeout_secs: cli.timeout,
            page_size: cli.page_size,
            recent: cli.recent,
            until_found: cli.until_found,
            threads_num: cli.threads_num,
            queue_capacity: cli.queue_capacity,
            max_retries: cli.max_retries,
            retry_delay_secs: cli.retry_delay,
            domain: cli.domain,
            auto_delete: cli.auto_delete,
            only_print: cli.only_print,
        })
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_retries,
            wait_secs: self.retry_delay_secs,
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            cookie_dir: self.cookie_directory.clone(),
            username: self.username.clone(),
            domain: self.domain,
            service_root: self.service_root.clone(),
            dsid: self.dsid.clone(),
            timeout_secs: self.timeout_secs,
        }
    }

    pub fn backup_options(&self) -> BackupOptions {
        BackupOptions {
            recent: self.recent,
            until_found: self.until_found,
            auto_delete: self.auto_delete,
            only_print: self.only_print,
            pipeline: PipelineConfig {
                workers: self.threads_num,
                queue_capacity: self.queue_capacity,
                retry: self.retry(),
            },
        }
    }
}
