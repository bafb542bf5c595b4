use clap::Parser;

use crate::icloud::photos::catalog::DEFAULT_PAGE_SIZE;
use crate::types::{Domain, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "icloud-backup",
    about = "Incrementally back up iCloud photos and videos to a directory or S3-compatible bucket"
)]
pub struct Cli {
    /// Local directory, or key prefix when --bucket is set
    pub destination: String,

    /// Apple ID whose persisted session should be used
    #[arg(short = 'u', long)]
    pub username: String,

    /// Directory holding the cookie jar and session file
    #[arg(long, default_value = "~/.icloud-backup")]
    pub cookie_directory: String,

    /// iCloud domain (com or cn)
    #[arg(long, value_enum, default_value = "com")]
    pub domain: Domain,

    /// Photos database base URL (ckdatabasews); read from the session file if omitted
    #[arg(long, env = "ICLOUD_SERVICE_ROOT")]
    pub service_root: Option<String>,

    /// Account dsid; read from the session file if omitted
    #[arg(long, env = "ICLOUD_DSID")]
    pub dsid: Option<String>,

    /// Number of recent photos to consider
    #[arg(long)]
    pub recent: Option<usize>,

    /// Stop after finding X consecutive already-stored photos (0 behaves like 1)
    #[arg(long)]
    pub until_found: Option<u32>,

    /// Delete stored copies of items found in "Recently Deleted"
    #[arg(long)]
    pub auto_delete: bool,

    /// Only print file names; download and delete nothing
    #[arg(long)]
    pub only_print: bool,

    /// Number of concurrent download workers
    #[arg(long, default_value_t = 4)]
    pub threads_num: usize,

    /// Units buffered between enumeration and the workers
    #[arg(long, default_value_t = 4)]
    pub queue_capacity: usize,

    /// Attempts per download on connection failures
    #[arg(long, default_value_t = 5)]
    pub max_retries: u32,

    /// Seconds to wait between attempts
    #[arg(long, default_value_t = 5)]
    pub retry_delay: u64,

    /// Photos per catalog page
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    pub page_size: usize,

    /// Catalog request timeout; for downloads, the connect and idle-read timeout (seconds)
    #[arg(long, default_value_t = 30)]
    pub timeout: u64,

    /// Store into this S3-compatible bucket instead of the filesystem
    #[arg(long)]
    pub bucket: Option<String>,

    /// Object store endpoint
    #[arg(long, default_value = "https://s3.wasabisys.com")]
    pub endpoint: String,

    /// Object store region
    #[arg(long, default_value = "us-east-1")]
    pub region: String,

    #[arg(long, env = "AWS_ACCESS_KEY_ID")]
    pub access_key_id: Option<String>,

    /// WARNING: visible in process listings; prefer AWS_SECRET_ACCESS_KEY
    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    pub secret_access_key: Option<String>,

    /// Payloads larger than this many MiB are staged in a temp file before upload
    #[arg(long, default_value_t = 50)]
    pub spill_threshold_mib: u64,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: LogLevel,
}
