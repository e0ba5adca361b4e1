//! Conditional GET evaluation.
//!
//! An unconditional request is never fresh. `If-None-Match` takes
//! precedence when present: fresh only on an exact etag match or a
//! wildcard. Otherwise `If-Modified-Since` marks the request fresh when
//! the resolved modification time is at or before the requested time;
//! unparseable dates are ignored.

use std::time::SystemTime;

use axum::http::{HeaderMap, header};

/// Whether the request carries any conditional header.
pub fn is_conditional(headers: &HeaderMap) -> bool {
    headers.contains_key(header::IF_NONE_MATCH) || headers.contains_key(header::IF_MODIFIED_SINCE)
}

/// Whether the client's cached copy is still fresh against the resource's
/// current etag and modification time.
pub fn is_fresh(
    request: &HeaderMap,
    etag: Option<&str>,
    last_modified: Option<SystemTime>,
) -> bool {
    if let Some(none_match) = request
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
    {
        return none_match
            .split(',')
            .map(str::trim)
            .any(|candidate| candidate == "*" || Some(candidate) == etag);
    }

    if let Some(since) = request
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| httpdate::parse_http_date(v).ok())
    {
        if let Some(modified) = last_modified {
            // HTTP dates have whole-second precision; compare at that
            // granularity so a just-served Last-Modified round-trips.
            return as_secs(modified) <= as_secs(since);
        }
    }

    false
}

fn as_secs(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
