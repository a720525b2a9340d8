//! Request header names and accessors.

use axum::http::HeaderMap;
use axum::http::header::{ACCEPT, IF_MODIFIED_SINCE};
use chrono::{DateTime, Utc};

/// Pool API key.
pub const API_KEY: &str = "x-api-key";

/// Replay-checked request id of status updates.
pub const REQUEST_ID: &str = "x-request-id";

/// Key making reference reservations retry-safe.
pub const IDEMPOTENCY_KEY: &str = "idempotency-key";

/// Media type of served status list tokens.
pub const STATUS_LIST_JWT: &str = "application/statuslist+jwt";

/// Returns the trimmed value of `name`, if present, valid text and not
/// empty.
#[must_use]
pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// `true` if an `If-None-Match` header matches `etag`.
#[must_use]
pub fn if_none_match(headers: &HeaderMap, etag: &str) -> bool {
    headers
        .get_all(axum::http::header::IF_NONE_MATCH)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|tag| tag.trim().trim_start_matches("W/"))
        .any(|tag| tag == "*" || tag == etag)
}

/// `true` unless an `Accept` header is present and none of its ranges
/// admits [`STATUS_LIST_JWT`]. Ranges with `q=0` admit nothing.
#[must_use]
pub fn accepts_status_list(headers: &HeaderMap) -> bool {
    let values: Vec<&str> = headers
        .get_all(ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();
    if values.iter().all(|value| value.trim().is_empty()) {
        return true;
    }
    values
        .iter()
        .flat_map(|value| value.split(','))
        .filter_map(|range| {
            let mut parts = range.split(';').map(str::trim);
            let media = parts.next()?.to_ascii_lowercase();
            let refused = parts.any(|param| {
                param
                    .strip_prefix("q=")
                    .and_then(|q| q.parse::<f32>().ok())
                    .is_some_and(|q| q <= 0.0)
            });
            (!refused).then_some(media)
        })
        .any(|media| media == STATUS_LIST_JWT || media == "application/*" || media == "*/*")
}

/// `true` if an `If-Modified-Since` header is present and `modified` is not
/// later than it, at the one-second resolution of HTTP dates.
#[must_use]
pub fn not_modified_since(headers: &HeaderMap, modified: DateTime<Utc>) -> bool {
    headers
        .get(IF_MODIFIED_SINCE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| DateTime::parse_from_rfc2822(value.trim()).ok())
        .is_some_and(|since| modified.timestamp() <= since.timestamp())
}

/// Formats `at` as an HTTP date.
#[must_use]
pub fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
