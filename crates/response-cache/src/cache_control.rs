//! `Cache-Control` / `Pragma` parsing and small header helpers shared by the policy,
//! key and conditional modules.

use http::header::{HeaderName, CACHE_CONTROL, PRAGMA};
use http::HeaderMap;
use std::time::{Duration, SystemTime};

/// `max-stale` may be given with or without a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxStale {
    Unlimited,
    Limit(Duration),
}

impl MaxStale {
    /// Whether a response `overage` past its freshness lifetime is acceptable.
    pub fn covers(&self, overage: Duration) -> bool {
        match self {
            MaxStale::Unlimited => true,
            MaxStale::Limit(limit) => overage <= *limit,
        }
    }
}

/// Directives from every `Cache-Control` header line, merged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    pub public: bool,
    pub private: bool,
    pub no_cache: bool,
    pub no_store: bool,
    pub must_revalidate: bool,
    pub proxy_revalidate: bool,
    pub only_if_cached: bool,
    pub max_age: Option<Duration>,
    pub s_maxage: Option<Duration>,
    pub min_fresh: Option<Duration>,
    pub max_stale: Option<MaxStale>,
}

impl CacheControl {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut cc = CacheControl::default();

        for value in headers.get_all(CACHE_CONTROL) {
            let Ok(s) = value.to_str() else {
                continue;
            };
            for part in split_list(s) {
                let (name, arg) = match part.split_once('=') {
                    Some((name, arg)) => (name.trim(), Some(unquote(arg.trim()))),
                    None => (part, None),
                };

                if name.eq_ignore_ascii_case("public") {
                    cc.public = true;
                } else if name.eq_ignore_ascii_case("private") {
                    cc.private = true;
                } else if name.eq_ignore_ascii_case("no-cache") {
                    cc.no_cache = true;
                } else if name.eq_ignore_ascii_case("no-store") {
                    cc.no_store = true;
                } else if name.eq_ignore_ascii_case("must-revalidate") {
                    cc.must_revalidate = true;
                } else if name.eq_ignore_ascii_case("proxy-revalidate") {
                    cc.proxy_revalidate = true;
                } else if name.eq_ignore_ascii_case("only-if-cached") {
                    cc.only_if_cached = true;
                } else if name.eq_ignore_ascii_case("max-age") {
                    cc.max_age = arg.and_then(parse_seconds).or(cc.max_age);
                } else if name.eq_ignore_ascii_case("s-maxage") {
                    cc.s_maxage = arg.and_then(parse_seconds).or(cc.s_maxage);
                } else if name.eq_ignore_ascii_case("min-fresh") {
                    cc.min_fresh = arg.and_then(parse_seconds).or(cc.min_fresh);
                } else if name.eq_ignore_ascii_case("max-stale") {
                    cc.max_stale = match arg {
                        None => Some(MaxStale::Unlimited),
                        Some(arg) => parse_seconds(arg).map(MaxStale::Limit).or(cc.max_stale),
                    };
                }
            }
        }
        cc
    }
}

/// Legacy `Pragma: no-cache` from HTTP/1.0 clients.
pub fn pragma_no_cache(headers: &HeaderMap) -> bool {
    headers
        .get_all(PRAGMA)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(split_list)
        .any(|d| d.eq_ignore_ascii_case("no-cache"))
}

/// Every comma-separated element of every `name` header, trimmed, empties dropped.
pub fn header_list(headers: &HeaderMap, name: &HeaderName) -> Vec<String> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(split_list)
        .map(str::to_owned)
        .collect()
}

/// Parse an HTTP-date header: `None` when absent, `Some(None)` when present but malformed.
pub fn http_date(headers: &HeaderMap, name: &HeaderName) -> Option<Option<SystemTime>> {
    let value = headers.get(name)?;
    Some(
        value
            .to_str()
            .ok()
            .and_then(|s| httpdate::parse_http_date(s.trim()).ok()),
    )
}

/// Parse an HTTP-date header, treating malformed values as absent.
pub fn valid_http_date(headers: &HeaderMap, name: &HeaderName) -> Option<SystemTime> {
    http_date(headers, name).flatten()
}

/// Non-negative delta-seconds; values too large for a `u64` saturate.
fn parse_seconds(s: &str) -> Option<Duration> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(Duration::from_secs(s.parse::<u64>().unwrap_or(u64::MAX)))
}

fn unquote(s: &str) -> &str {
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s)
}

/// Split on commas that are not inside a quoted string.
pub(crate) fn split_list(s: &str) -> impl Iterator<Item = &str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts.into_iter().map(str::trim).filter(|p| !p.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{EXPIRES, VARY};
    use http::HeaderValue;

    fn headers(name: HeaderName, values: &[&'static str]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for v in values {
            h.append(name.clone(), HeaderValue::from_static(v));
        }
        h
    }

    #[test]
    fn parses_response_directives() {
        let cc = CacheControl::from_headers(&headers(
            CACHE_CONTROL,
            &["Public, max-age=3600", "s-maxage=\"60\", must-revalidate"],
        ));
        assert!(cc.public);
        assert!(cc.must_revalidate);
        assert!(!cc.private);
        assert_eq!(cc.max_age, Some(Duration::from_secs(3600)));
        assert_eq!(cc.s_maxage, Some(Duration::from_secs(60)));
    }

    #[test]
    fn parses_request_directives() {
        let cc = CacheControl::from_headers(&headers(
            CACHE_CONTROL,
            &["max-stale, min-fresh=5, only-if-cached"],
        ));
        assert_eq!(cc.max_stale, Some(MaxStale::Unlimited));
        assert_eq!(cc.min_fresh, Some(Duration::from_secs(5)));
        assert!(cc.only_if_cached);

        let cc = CacheControl::from_headers(&headers(CACHE_CONTROL, &["max-stale=10"]));
        assert_eq!(cc.max_stale, Some(MaxStale::Limit(Duration::from_secs(10))));
    }

    #[test]
    fn quoted_field_lists_do_not_split_directives() {
        let cc = CacheControl::from_headers(&headers(
            CACHE_CONTROL,
            &["private=\"set-cookie, x-user\", max-age=5"],
        ));
        assert!(cc.private);
        assert_eq!(cc.max_age, Some(Duration::from_secs(5)));
    }

    #[test]
    fn malformed_numbers_are_ignored() {
        let cc = CacheControl::from_headers(&headers(CACHE_CONTROL, &["max-age=-1, s-maxage=abc"]));
        assert_eq!(cc.max_age, None);
        assert_eq!(cc.s_maxage, None);
    }

    #[test]
    fn max_stale_limit_is_inclusive() {
        let limit = MaxStale::Limit(Duration::from_secs(10));
        assert!(limit.covers(Duration::from_secs(10)));
        assert!(!limit.covers(Duration::from_secs(11)));
        assert!(MaxStale::Unlimited.covers(Duration::MAX));
    }

    #[test]
    fn pragma_and_lists() {
        assert!(pragma_no_cache(&headers(PRAGMA, &["No-Cache"])));
        assert!(!pragma_no_cache(&headers(PRAGMA, &["foo"])));
        assert_eq!(
            header_list(&headers(VARY, &["Accept-Encoding, ,Accept-Language", "X-A"]), &VARY),
            vec!["Accept-Encoding", "Accept-Language", "X-A"]
        );
    }

    #[test]
    fn http_dates() {
        let h = headers(EXPIRES, &["Thu, 01 Jan 1970 00:00:10 GMT"]);
        assert_eq!(
            valid_http_date(&h, &EXPIRES),
            Some(SystemTime::UNIX_EPOCH + Duration::from_secs(10))
        );
        let bad = headers(EXPIRES, &["0"]);
        assert_eq!(http_date(&bad, &EXPIRES), Some(None));
        assert_eq!(valid_http_date(&bad, &EXPIRES), None);
        assert_eq!(http_date(&HeaderMap::new(), &EXPIRES), None);
    }
}
