use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};

use super::cloudkit::Record;
use crate::icloud::error::ICloudError;

/// Resolution key holding the full-size original.
pub(crate) const ORIGINAL_RES: &str = "resOriginalRes";
/// Resolution key holding the motion component of a live photo.
pub(crate) const LIVE_VIDEO_RES: &str = "resOriginalVidComplRes";

const LIVE_VIDEO_EXTENSION: &str = "mov";

/// One remote asset, immutable once decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaEntry {
    pub name: String,
    pub created: DateTime<Utc>,
    pub expected_size: u64,
    pub source_ref: String,
    /// Paired asset (live photo video). Never itself carries a companion.
    pub companion: Option<Box<MediaEntry>>,
}

impl MediaEntry {
    pub fn new(
        name: impl Into<String>,
        created: DateTime<Utc>,
        expected_size: u64,
        source_ref: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            created,
            expected_size,
            source_ref: source_ref.into(),
            companion: None,
        }
    }

    /// Attach a companion, flattening away anything it carried itself.
    pub fn with_companion(mut self, mut companion: MediaEntry) -> Self {
        companion.companion = None;
        self.companion = Some(Box::new(companion));
        self
    }

    /// Decode a `CPLMaster` record. A record with a live-photo resolution is
    /// decoded a second time into the companion.
    pub fn from_record(record: &Record) -> Result<Self, ICloudError> {
        let entry = decode(record, ORIGINAL_RES)?;
        if record.fields[LIVE_VIDEO_RES].is_null() {
            return Ok(entry);
        }
        let mut companion = decode(record, LIVE_VIDEO_RES)?;
        companion.name = companion_file_name(&companion.name);
        Ok(entry.with_companion(companion))
    }

    /// Split into independently downloadable units: self first, then the
    /// companion if any.
    pub fn into_units(mut self) -> Vec<MediaEntry> {
        match self.companion.take() {
            Some(companion) => vec![self, *companion],
            None => vec![self],
        }
    }
}

impl std::fmt::Display for MediaEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

fn decode(record: &Record, resolution: &str) -> Result<MediaEntry, ICloudError> {
    let malformed = |field: &str| ICloudError::MalformedRecord {
        record: record.record_name.clone(),
        field: field.to_string(),
    };

    let enc = &record.fields["filenameEnc"];
    let name = enc["value"]
        .as_str()
        .and_then(|value| decode_file_name(value, enc["type"].as_str()))
        .ok_or_else(|| malformed("filenameEnc"))?;

    let created = record.created["timestamp"]
        .as_f64()
        .and_then(|ms| Utc.timestamp_millis_opt(ms as i64).single())
        .ok_or_else(|| malformed("created.timestamp"))?;

    let res = &record.fields[resolution]["value"];
    let expected_size = res["size"]
        .as_u64()
        .ok_or_else(|| malformed(&format!("{resolution}.size")))?;
    let source_ref = res["downloadURL"]
        .as_str()
        .ok_or_else(|| malformed(&format!("{resolution}.downloadURL")))?;

    Ok(MediaEntry::new(name, created, expected_size, source_ref))
}

/// Plain `STRING` names are taken as-is; everything else is base64.
fn decode_file_name(value: &str, enc_type: Option<&str>) -> Option<String> {
    if enc_type == Some("STRING") {
        return Some(value.to_string());
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(value)
        .ok()?;
    String::from_utf8(decoded).ok()
}

/// `IMG_0001.HEIC` -> `IMG_0001.mov`; a name without extension gains one.
pub(crate) fn companion_file_name(name: &str) -> String {
    let stem = name.rsplit_once('.').map_or(name, |(stem, _)| stem);
    format!("{stem}.{LIVE_VIDEO_EXTENSION}")
}
