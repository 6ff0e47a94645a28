//! `304 Not Modified` evaluation against a stored response.

use crate::cache_control::{split_list, valid_http_date};
use http::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, IF_UNMODIFIED_SINCE, LAST_MODIFIED};
use http::HeaderMap;
use std::time::SystemTime;

/// An entity tag with its weakness flag split off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityTag<'a> {
    pub weak: bool,
    pub opaque: &'a str,
}

impl<'a> EntityTag<'a> {
    pub fn parse(s: &'a str) -> Option<Self> {
        let s = s.trim();
        let (weak, rest) = match s.strip_prefix("W/").or_else(|| s.strip_prefix("w/")) {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let opaque = rest.strip_prefix('"')?.strip_suffix('"')?;
        if opaque.contains('"') {
            return None;
        }
        Some(Self { weak, opaque })
    }

    /// Weak comparison: opaque tags match regardless of either side's weakness.
    pub fn weak_eq(&self, other: &EntityTag<'_>) -> bool {
        self.opaque == other.opaque
    }
}

/// Whether the client's validators show it already holds the stored representation.
///
/// `If-None-Match` wins outright when present; otherwise `If-Modified-Since`
/// (or `If-Unmodified-Since`) is compared against the stored `Last-Modified`,
/// falling back to `created` when the response carried none.
pub fn content_is_not_modified(
    cached_headers: &HeaderMap,
    created: SystemTime,
    request_headers: &HeaderMap,
) -> bool {
    if request_headers.contains_key(IF_NONE_MATCH) {
        let cached_etag = cached_headers
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .and_then(EntityTag::parse);

        for value in request_headers.get_all(IF_NONE_MATCH) {
            let Ok(value) = value.to_str() else {
                continue;
            };
            for candidate in split_list(value) {
                if candidate == "*" {
                    return true;
                }
                let tag = EntityTag::parse(candidate);
                if let (Some(cached), Some(tag)) = (cached_etag.as_ref(), tag) {
                    if cached.weak_eq(&tag) {
                        return true;
                    }
                }
            }
        }
        return false;
    }

    let since = valid_http_date(request_headers, &IF_MODIFIED_SINCE)
        .or_else(|| valid_http_date(request_headers, &IF_UNMODIFIED_SINCE));
    let Some(since) = since else {
        return false;
    };
    let modified = valid_http_date(cached_headers, &LAST_MODIFIED).unwrap_or(created);
    modified <= since
}
