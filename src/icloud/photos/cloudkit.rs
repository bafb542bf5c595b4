use serde::Deserialize;
use serde_json::Value;

/// Response from `/records/query`.
///
/// `records` is required: a page without it means the remote contract
/// changed or the session was rejected, and must not look like an empty page.
#[derive(Debug, Deserialize)]
pub struct QueryResponse {
    pub records: Vec<Record>,
}

/// Response from `/internal/records/query/batch`.
#[derive(Debug, Deserialize)]
pub struct BatchQueryResponse {
    #[serde(default)]
    pub batch: Vec<QueryResponse>,
}

/// Error envelope CloudKit returns in place of a normal body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerError {
    pub server_error_code: String,
    #[serde(default)]
    pub reason: String,
}

/// A CloudKit record. Fields are kept as dynamic JSON because Apple's schema
/// varies by record type and changes without notice.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    #[serde(default)]
    pub record_name: String,
    #[serde(default)]
    pub record_type: String,
    #[serde(default)]
    pub fields: Value,
    /// System creation stamp, `{"timestamp": <epoch millis>, ...}`.
    #[serde(default)]
    pub created: Value,
}
