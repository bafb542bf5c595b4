use std::collections::HashMap;

use serde_json::{json, Value};

/// Path of the paginated record query, relative to the photos database endpoint.
pub(crate) const RECORDS_QUERY_PATH: &str = "records/query";
/// Path of the batch query used for index counters.
pub(crate) const BATCH_QUERY_PATH: &str = "internal/records/query/batch";

pub(crate) const TEXT_PLAIN: &[(&str, &str)] = &[("Content-type", "text/plain")];

/// Record type that carries the decodable file name, size and URL.
pub(crate) const MASTER_RECORD_TYPE: &str = "CPLMaster";

/// CloudKit field names requested in every list query.
pub(crate) const DESIRED_KEYS: &[&str] = &[
    "resOriginalRes",
    "resOriginalVidComplRes",
    "filenameEnc",
    "masterRef",
];

/// The server returns one asset and one master record per item, so each page
/// asks for twice the nominal page size.
const RECORDS_PER_ITEM: usize = 2;

/// Both catalogs are walked oldest first so that offset 0 is a stable start.
const SORT_DIRECTION: &str = "ASCENDING";

/// The two catalog views the backup enumerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogQuery {
    /// Every item in the library, by date added.
    AllMedia,
    /// Items in "Recently Deleted", by expunge date.
    RecentlyDeleted,
}

impl CatalogQuery {
    pub fn list_type(self) -> &'static str {
        match self {
            CatalogQuery::AllMedia => "CPLAssetAndMasterByAddedDate",
            CatalogQuery::RecentlyDeleted => "CPLAssetAndMasterDeletedByExpungedDate",
        }
    }
}

/// Body of one page request starting at `offset`.
pub(crate) fn list_query(
    query: CatalogQuery,
    offset: u64,
    page_size: usize,
    zone_id: &Value,
) -> Value {
    json!({
        "query": {
            "filterBy": [
                {
                    "fieldName": "startRank",
                    "fieldValue": {"type": "INT64", "value": offset},
                    "comparator": "EQUALS",
                },
                {
                    "fieldName": "direction",
                    "fieldValue": {"type": "STRING", "value": SORT_DIRECTION},
                    "comparator": "EQUALS",
                },
            ],
            "recordType": query.list_type(),
        },
        "resultsLimit": page_size * RECORDS_PER_ITEM,
        "desiredKeys": DESIRED_KEYS,
        "zoneID": zone_id,
    })
}

/// Body of the `HyperionIndexCountLookup` request for the whole library.
pub(crate) fn count_query(zone_id: &Value) -> Value {
    json!({
        "batch": [{
            "resultsLimit": 1,
            "query": {
                "filterBy": {
                    "fieldName": "indexCountID",
                    "fieldValue": {
                        "type": "STRING_LIST",
                        "value": ["CPLAssetByAddedDate"]
                    },
                    "comparator": "IN",
                },
                "recordType": "HyperionIndexCountLookup",
            },
            "zoneWide": true,
            "zoneID": zone_id,
        }]
    })
}

pub(crate) fn indexing_state_query(zone_id: &Value) -> Value {
    json!({
        "query": {"recordType": "CheckIndexingState"},
        "zoneID": zone_id,
    })
}

pub(crate) fn encode_params(params: &HashMap<String, Value>) -> String {
    use std::borrow::Cow;
    let mut pairs: Vec<String> = params
        .iter()
        .map(|(k, v)| {
            let val: Cow<'_, str> = match v {
                Value::String(s) => Cow::Borrowed(s.as_str()),
                Value::Bool(b) => Cow::Owned(b.to_string()),
                Value::Number(n) => Cow::Owned(n.to_string()),
                other => Cow::Owned(other.to_string()),
            };
            format!("{}={}", urlencoding::encode(k), urlencoding::encode(&val))
        })
        .collect();
    pairs.sort();
    pairs.join("&")
}
