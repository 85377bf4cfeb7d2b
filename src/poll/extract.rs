//! Reading status responses.
//!
//! Response shapes differ between endpoints and job kinds, so every lookup is
//! an ordered list of probes tried until one answers.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

use crate::error::{JimengError, Result};
use crate::job::JobKind;

/// Status of a finished record
pub const STATUS_COMPLETE: i64 = 10;
/// Status of a running record
pub const STATUS_PROCESSING: i64 = 20;
/// Status of a failed record
pub const STATUS_FAILED: i64 = 30;
/// Alternate status of a finished record
pub const STATUS_COMPLETE_ALT: i64 = 50;

/// Failure code for content moderation
pub const FAIL_CODE_FILTERED: &str = "2038";

lazy_static! {
    /// Video CDN URL anywhere in a raw response
    pub static ref VIDEO_URL: Regex =
        Regex::new(r#"https://v[0-9]+-artist\.vlabvod\.com/[^"\s]+"#).expect("video url pattern");
}

/// Finds the history record inside a status response.
pub type RecordLocator = for<'a> fn(&'a Value, &str) -> Option<&'a Value>;

/// Finds an asset URL inside one result item.
pub type AssetExtractor = fn(&Value) -> Option<&str>;

fn by_id<'a>(data: &'a Value, id: &str) -> Option<&'a Value> {
    data.get(id).filter(|v| v.is_object())
}

fn first_history_list<'a>(data: &'a Value, _id: &str) -> Option<&'a Value> {
    data.pointer("/history_list/0")
}

fn first_history_record<'a>(data: &'a Value, _id: &str) -> Option<&'a Value> {
    data.pointer("/history_records/0")
}

/// Record locators, in priority order.
pub const RECORD_LOCATORS: &[RecordLocator] = &[by_id, first_history_list, first_history_record];

fn text_at<'a>(item: &'a Value, pointer: &str) -> Option<&'a str> {
    item.pointer(pointer)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

fn large_image(item: &Value) -> Option<&str> {
    text_at(item, "/image/large_images/0/image_url")
}

fn cover(item: &Value) -> Option<&str> {
    text_at(item, "/common_attr/cover_url")
}

fn transcoded_origin(item: &Value) -> Option<&str> {
    text_at(item, "/video/transcoded_video/origin/video_url")
}

fn play_url(item: &Value) -> Option<&str> {
    text_at(item, "/video/play_url")
}

fn download_url(item: &Value) -> Option<&str> {
    text_at(item, "/video/download_url")
}

fn plain_url(item: &Value) -> Option<&str> {
    text_at(item, "/video/url")
}

/// Image URL probes, in priority order.
pub const IMAGE_EXTRACTORS: &[AssetExtractor] = &[large_image, cover];

/// Video URL probes, in priority order.
pub const VIDEO_EXTRACTORS: &[AssetExtractor] =
    &[transcoded_origin, play_url, download_url, plain_url];

/// Probes for a job kind.
pub fn extractors_for(kind: JobKind) -> &'static [AssetExtractor] {
    if kind.is_image() {
        IMAGE_EXTRACTORS
    } else {
        VIDEO_EXTRACTORS
    }
}

/// Locate the record for `id`.
pub fn locate_record<'a>(data: &'a Value, id: &str) -> Option<&'a Value> {
    RECORD_LOCATORS.iter().find_map(|locate| locate(data, id))
}

/// First video CDN URL in a raw response.
pub fn scan_raw(raw: &str) -> Option<String> {
    VIDEO_URL.find(raw).map(|m| m.as_str().to_string())
}

/// One URL per item, skipping items no probe understands.
pub fn extract_assets(items: &[Value], kind: JobKind) -> Vec<String> {
    let extractors = extractors_for(kind);
    items
        .iter()
        .filter_map(|item| extractors.iter().find_map(|extract| extract(item)))
        .map(str::to_string)
        .collect()
}

/// Read a field that may arrive as a number or a numeric string.
fn loose_int(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Read `fail_code` as text. Empty and zero codes mean "no failure".
pub fn fail_code(record: &Value) -> Option<String> {
    let code = match record.get("fail_code")? {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        _ => return None,
    };
    (!code.is_empty() && code != "0").then_some(code)
}

/// What one status query says about the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// No record in the response
    Missing,
    /// Record still running; carries the assets seen so far
    Processing {
        /// Raw status code
        status: i64,
        /// Items in the record
        items: usize,
    },
    /// Finished with these assets
    Done(Vec<String>),
}

/// Classify a located record.
///
/// Failures become typed errors carrying `correlation_id`. A finished record
/// with no items is treated as still processing; one whose items yield no URL
/// is an [`JimengError::AssetExtractionFailed`].
pub fn classify(
    record: &Value,
    kind: JobKind,
    expected_assets: Option<usize>,
    correlation_id: &str,
) -> Result<Observation> {
    let status = loose_int(record.get("status")).unwrap_or(STATUS_PROCESSING);
    let items: &[Value] = record
        .get("item_list")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    if status == STATUS_FAILED {
        let code = fail_code(record);
        return Err(match code.as_deref() {
            Some(FAIL_CODE_FILTERED) => JimengError::ContentFiltered {
                correlation_id: correlation_id.to_string(),
            },
            _ => JimengError::GenerationFailed {
                correlation_id: correlation_id.to_string(),
                fail_code: code.unwrap_or_else(|| "unknown".to_string()),
            },
        });
    }

    let finished = status == STATUS_COMPLETE || status == STATUS_COMPLETE_ALT;
    let enough = expected_assets.is_some_and(|min| min > 0 && items.len() >= min);

    if items.is_empty() || !(finished || enough) {
        return Ok(Observation::Processing {
            status,
            items: items.len(),
        });
    }

    let assets = extract_assets(items, kind);
    if assets.is_empty() {
        return Err(JimengError::AssetExtractionFailed {
            correlation_id: correlation_id.to_string(),
        });
    }
    Ok(Observation::Done(assets))
}
