//! Persisted iCloud web session, loaded read-only from the cookie directory.
//!
//! Logging in is someone else's job: this module only picks up the cookie
//! jar and `.session` file a prior authentication left behind and uses them
//! to talk to the photos database.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fs4::fs_std::FileExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ORIGIN, REFERER, USER_AGENT};
use reqwest::Client;
use serde_json::Value;
use tokio::fs;

use crate::icloud::error::ICloudError;
use crate::icloud::photos::queries::encode_params;
use crate::icloud::photos::RequestExecutor;
use crate::transfer::TransferError;
use crate::types::Domain;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/138.0.0.0 Safari/537.36";

const CLIENT_BUILD_NUMBER: &str = "2522Project44";
const CLIENT_MASTERING_NUMBER: &str = "2522B2";

const PHOTOS_DATABASE_PATH: &str = "database/1/com.apple.photos.cloud/production/private";

/// Keep only word characters so the username is safe as a file name.
pub fn sanitize_username(username: &str) -> String {
    username
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .collect()
}

fn is_cookie_expired(cookie_str: &str, now: &chrono::DateTime<chrono::Utc>) -> bool {
    if let Ok(parsed) = cookie::Cookie::parse(cookie_str) {
        if let Some(expires) = parsed.expires_datetime() {
            let expires_utc =
                chrono::DateTime::<chrono::Utc>::from(std::time::SystemTime::from(expires));
            return expires_utc < *now;
        }
    }
    false
}

/// A single persisted cookie entry (URL + Set-Cookie header value).
#[derive(serde::Serialize, serde::Deserialize)]
struct CookieEntry {
    url: String,
    cookie: String,
}

/// Where to find the session on disk and which service to talk to.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub cookie_dir: PathBuf,
    pub username: String,
    pub domain: Domain,
    /// Overrides `service_root` from the session file when set.
    pub service_root: Option<String>,
    /// Overrides `dsid` from the session file when set.
    pub dsid: Option<String>,
    pub timeout_secs: u64,
}

/// Authenticated HTTP session against the photos database.
pub struct Session {
    client: Client,
    /// Shares the cookie jar and headers of `client`, but bounds only the
    /// connect and each read, never the whole transfer.
    media_client: Client,
    #[allow(dead_code)]
    cookie_jar: Arc<reqwest::cookie::Jar>,
    endpoint: String,
    params: HashMap<String, Value>,
    /// Exclusive advisory lock for this account, released on drop.
    #[allow(dead_code)]
    lock_file: std::fs::File,
}

impl Session {
    pub async fn open(settings: &SessionSettings) -> Result<Self> {
        let sanitized = sanitize_username(&settings.username);
        let cookie_dir = &settings.cookie_dir;

        fs::create_dir_all(cookie_dir).await.with_context(|| {
            format!(
                "Failed to create cookie directory: {}",
                cookie_dir.display()
            )
        })?;

        let lock_path = cookie_dir.join(format!("{}.lock", sanitized));
        let lock_file = tokio::task::spawn_blocking(move || {
            let file = std::fs::File::create(&lock_path).with_context(|| {
                format!("Failed to create lock file: {}", lock_path.display())
            })?;
            file.try_lock_exclusive().map_err(|_| {
                anyhow::anyhow!(
                    "Another icloud-backup instance is running for this account (lock: {})",
                    lock_path.display()
                )
            })?;
            Ok::<std::fs::File, anyhow::Error>(file)
        })
        .await??;

        let cookie_jar = Arc::new(reqwest::cookie::Jar::default());
        load_cookies(&cookie_dir.join(&sanitized), &cookie_jar).await;

        let session_data =
            load_session_data(&cookie_dir.join(format!("{}.session", sanitized))).await;

        let service_root = settings
            .service_root
            .clone()
            .or_else(|| session_data.get("service_root").cloned())
            .context("No photos service root; pass --service-root or authenticate first")?;
        let dsid = settings
            .dsid
            .clone()
            .or_else(|| session_data.get("dsid").cloned())
            .context("No dsid; pass --dsid or authenticate first")?;

        let mut params = HashMap::new();
        params.insert(
            "clientBuildNumber".to_string(),
            Value::String(CLIENT_BUILD_NUMBER.to_string()),
        );
        params.insert(
            "clientMasteringNumber".to_string(),
            Value::String(CLIENT_MASTERING_NUMBER.to_string()),
        );
        if let Some(client_id) = session_data.get("client_id") {
            params.insert("clientId".to_string(), Value::String(client_id.clone()));
        }
        params.insert("dsid".to_string(), Value::String(dsid));
        params.insert("remapEnums".to_string(), Value::Bool(true));
        params.insert("getCurrentSyncToken".to_string(), Value::Bool(true));

        let home = home_endpoint(settings.domain);
        let mut default_headers = HeaderMap::new();
        default_headers.insert(ORIGIN, HeaderValue::from_static(home));
        default_headers.insert(REFERER, HeaderValue::from_str(&format!("{}/", home))?);
        default_headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));

        let timeout = Duration::from_secs(settings.timeout_secs);
        let client = Client::builder()
            .cookie_provider(cookie_jar.clone())
            .default_headers(default_headers.clone())
            .timeout(timeout)
            .build()?;
        let media_client = Client::builder()
            .cookie_provider(cookie_jar.clone())
            .default_headers(default_headers)
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            media_client,
            cookie_jar,
            endpoint: photos_endpoint(&service_root),
            params,
            lock_file,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The cookie-carrying client used to fetch media bytes. A slow but
    /// steady body is never cut off; a stalled one times out per read.
    pub fn download_client(&self) -> Client {
        self.media_client.clone()
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}/{}?{}", self.endpoint, path, encode_params(&self.params))
    }
}

#[async_trait::async_trait]
impl RequestExecutor for Session {
    async fn post(
        &self,
        path: &str,
        body: &str,
        headers: &[(&str, &str)],
    ) -> Result<Value, ICloudError> {
        let url = self.url_for(path);
        let mut builder = self.client.post(&url).body(body.to_string());
        for &(name, value) in headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                builder = builder.header(name, value);
            }
        }

        tracing::debug!("POST {}", url);
        let response = builder.send().await.map_err(TransferError::from)?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::HttpStatus {
                status: status.as_u16(),
                url,
            }
            .into());
        }
        let text = response.text().await.map_err(TransferError::from)?;
        Ok(serde_json::from_str(&text)?)
    }
}

fn home_endpoint(domain: Domain) -> &'static str {
    match domain {
        Domain::Com => "https://www.icloud.com",
        Domain::Cn => "https://www.icloud.com.cn",
    }
}

fn photos_endpoint(service_root: &str) -> String {
    format!(
        "{}/{}",
        service_root.trim_end_matches('/'),
        PHOTOS_DATABASE_PATH
    )
}

/// Load persisted cookies (JSON entries or the legacy tab-separated format),
/// dropping any that have already expired.
async fn load_cookies(path: &Path, jar: &reqwest::cookie::Jar) {
    if !path.exists() {
        tracing::debug!("No cookie jar at {}", path.display());
        return;
    }
    let contents = match fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) => {
            tracing::warn!("Failed to read cookiejar {}: {}", path.display(), e);
            return;
        }
    };
    let now = chrono::Utc::now();
    let entries: Vec<(String, String)> =
        match serde_json::from_str::<Vec<CookieEntry>>(&contents) {
            Ok(entries) => entries.into_iter().map(|e| (e.url, e.cookie)).collect(),
            Err(_) => contents
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with("Set-Cookie3:"))
                .filter_map(|l| l.split_once('\t'))
                .map(|(u, c)| (u.to_string(), c.to_string()))
                .collect(),
        };
    let mut loaded = 0usize;
    for (url_str, cookie_str) in entries {
        if is_cookie_expired(&cookie_str, &now) {
            tracing::debug!("Pruning expired cookie from {}", url_str);
            continue;
        }
        if let Ok(url) = url_str.parse::<url::Url>() {
            jar.add_cookie_str(&cookie_str, &url);
            loaded += 1;
        }
    }
    tracing::debug!(count = loaded, "Read cookies from {}", path.display());
}

async fn load_session_data(path: &Path) -> HashMap<String, String> {
    let contents = match fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(_) => {
            tracing::info!("Session file does not exist");
            return HashMap::new();
        }
    };
    match serde_json::from_str::<HashMap<String, Value>>(&contents) {
        Ok(map) => {
            tracing::debug!("Loaded session data from {}", path.display());
            map.into_iter()
                .map(|(k, v)| match v {
                    Value::String(s) => (k, s),
                    other => (k, other.to_string()),
                })
                .collect()
        }
        Err(_) => {
            tracing::warn!("Session file {} is corrupt, ignoring it", path.display());
            HashMap::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn settings(dir: &Path, username: &str) -> SessionSettings {
        SessionSettings {
            cookie_dir: dir.to_path_buf(),
            username: username.to_string(),
            domain: Domain::Com,
            service_root: Some("https://p42-ckdatabasews.icloud.com:443".to_string()),
            dsid: Some("12345".to_string()),
            timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn test_lock_file_prevents_concurrent_sessions() {
        let dir = TempDir::new().unwrap();
        let _s1 = Session::open(&settings(dir.path(), "user@test.com"))
            .await
            .unwrap();
        let err = Session::open(&settings(dir.path(), "user@test.com"))
            .await
            .err()
            .expect("second session should fail");
        assert!(
            err.to_string().contains("Another icloud-backup instance"),
            "unexpected error: {err}"
        );
    }

    #[tokio::test]
    async fn test_lock_released_on_drop() {
        let dir = TempDir::new().unwrap();
        {
            let _s = Session::open(&settings(dir.path(), "user@test.com"))
                .await
                .unwrap();
        }
        Session::open(&settings(dir.path(), "user@test.com"))
            .await
            .expect("lock should be released after drop");
    }

    #[tokio::test]
    async fn test_url_carries_sorted_params() {
        let dir = TempDir::new().unwrap();
        let session = Session::open(&settings(dir.path(), "user@test.com"))
            .await
            .unwrap();
        assert_eq!(
            session.endpoint(),
            "https://p42-ckdatabasews.icloud.com:443/database/1/com.apple.photos.cloud/production/private"
        );
        let url = session.url_for("records/query");
        assert!(url.contains("/private/records/query?clientBuildNumber=2522Project44&"));
        assert!(url.contains("dsid=12345"));
        assert!(url.ends_with("remapEnums=true"));
    }

    #[tokio::test]
    async fn test_session_file_supplies_missing_settings() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("usertestcom.session"),
            r#"{"client_id": "auth-abc", "dsid": "999", "service_root": "https://example.com/"}"#,
        )
        .unwrap();
        let mut s = settings(dir.path(), "user@test.com");
        s.service_root = None;
        s.dsid = None;
        let session = Session::open(&s).await.unwrap();
        let url = session.url_for("records/query");
        assert!(url.starts_with("https://example.com/database/1/"));
        assert!(url.contains("clientId=auth-abc"));
        assert!(url.contains("dsid=999"));
    }

    #[tokio::test]
    async fn test_missing_dsid_is_error() {
        let dir = TempDir::new().unwrap();
        let mut s = settings(dir.path(), "user@test.com");
        s.dsid = None;
        assert!(Session::open(&s).await.is_err());
    }

    #[tokio::test]
    async fn test_expired_cookies_pruned_on_load() {
        let dir = TempDir::new().unwrap();
        let expired = "https://example.com\texpired_cookie=val; Expires=Thu, 01 Jan 2020 00:00:00 GMT";
        let valid = "https://example.com\tvalid_cookie=val; Expires=Thu, 01 Jan 2099 00:00:00 GMT";
        std::fs::write(
            dir.path().join("usertestcom"),
            format!("{}\n{}", expired, valid),
        )
        .unwrap();
        let session = Session::open(&settings(dir.path(), "user@test.com"))
            .await
            .unwrap();
        let url: url::Url = "https://example.com".parse().unwrap();
        use reqwest::cookie::CookieStore;
        let header = session.cookie_jar.cookies(&url).unwrap();
        let header = header.to_str().unwrap();
        assert!(header.contains("valid_cookie=val"));
        assert!(!header.contains("expired_cookie"));
    }

    #[tokio::test]
    async fn test_unreachable_service_is_connectivity_error() {
        let dir = TempDir::new().unwrap();
        let mut s = settings(dir.path(), "user@test.com");
        s.service_root = Some("http://127.0.0.1:1".to_string());
        let session = Session::open(&s).await.unwrap();
        let err = session
            .post("records/query", "{}", &[("Content-type", "text/plain")])
            .await
            .unwrap_err();
        assert!(err.is_connectivity(), "unexpected error: {err:?}");
    }

    /// Serve one response whose body trickles out a byte at a time.
    async fn trickle_server(body: &'static [u8], gap: Duration) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await.unwrap();
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n",
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            for byte in body {
                tokio::time::sleep(gap).await;
                socket.write_all(std::slice::from_ref(byte)).await.unwrap();
                socket.flush().await.unwrap();
            }
        });
        format!("http://{addr}/media")
    }

    #[tokio::test]
    async fn test_slow_download_outlasts_request_timeout() {
        use crate::transfer::Retriever;
        use futures_util::StreamExt;

        let dir = TempDir::new().unwrap();
        let mut s = settings(dir.path(), "user@test.com");
        s.timeout_secs = 1;
        let session = Session::open(&s).await.unwrap();
        let url = trickle_server(b"abc", Duration::from_millis(700)).await;

        let mut source = session.download_client().retrieve(&url).await.unwrap();
        let mut body = Vec::new();
        while let Some(chunk) = source.stream.next().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(body, b"abc");
    }

    #[test]
    fn test_is_cookie_expired() {
        let now = chrono::Utc::now();
        assert!(is_cookie_expired(
            "foo=bar; Expires=Thu, 01 Jan 2020 00:00:00 GMT",
            &now
        ));
        assert!(!is_cookie_expired(
            "foo=bar; Expires=Thu, 01 Jan 2099 00:00:00 GMT",
            &now
        ));
        assert!(!is_cookie_expired("foo=bar", &now));
    }

    #[test]
    fn test_sanitize_username() {
        assert_eq!(sanitize_username("user@example.com"), "userexamplecom");
        assert_eq!(sanitize_username("a.b-c@d"), "abcd");
    }
}
