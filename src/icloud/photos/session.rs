use serde_json::Value;

use crate::icloud::error::ICloudError;

/// Authenticated request executor used by the photos catalog.
///
/// `path` is relative to the photos database endpoint; implementations add
/// the endpoint, query params and whatever session state they carry.
/// Connectivity failures surface as [`ICloudError::Transfer`], undecodable
/// bodies as [`ICloudError::Json`].
/// The concrete implementation lives in `crate::session`.
#[async_trait::async_trait]
pub trait RequestExecutor: Send + Sync {
    async fn post(
        &self,
        path: &str,
        body: &str,
        headers: &[(&str, &str)],
    ) -> Result<Value, ICloudError>;
}
