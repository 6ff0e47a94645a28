use crate::buffer::ShardedBody;
use http::{HeaderMap, StatusCode};
use std::time::SystemTime;

/// Query-key sentinel meaning "vary by every query parameter present on the request".
pub const ALL_QUERY_KEYS: &str = "*";

/// A stored response. Built once at commit time and never mutated afterwards; a newer
/// response for the same key replaces it wholesale.
///
/// `headers` never carries `Date`, `Age` or `Content-Length`: those are regenerated from
/// `created` and `body` whenever the entry is served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub created: SystemTime,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ShardedBody,
}

/// Marker stored under a base key whose responses vary by request headers and/or query
/// parameters. The actual responses live under vary keys derived from `key_prefix`.
///
/// Header and query-key names are stored upper-cased and ordinally sorted, so two rule
/// sets that differ only in declared casing or order compare equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedVaryByRules {
    pub key_prefix: String,
    pub headers: Vec<String>,
    pub query_keys: Vec<String>,
}

impl CachedVaryByRules {
    /// Rules with a freshly generated key prefix. Names are normalized.
    pub fn new<H, Q>(headers: H, query_keys: Q) -> Self
    where
        H: IntoIterator,
        H::Item: AsRef<str>,
        Q: IntoIterator,
        Q::Item: AsRef<str>,
    {
        Self {
            key_prefix: uuid::Uuid::new_v4().simple().to_string(),
            headers: normalize_names(headers),
            query_keys: normalize_names(query_keys),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty() && self.query_keys.is_empty()
    }

    /// Whether these rules partition by the same names as `headers` / `query_keys`
    /// (which must already be normalized).
    pub fn same_rules(&self, headers: &[String], query_keys: &[String]) -> bool {
        self.headers == headers && self.query_keys == query_keys
    }

    pub fn varies_by_all_query_keys(&self) -> bool {
        self.query_keys.iter().any(|k| k == ALL_QUERY_KEYS)
    }
}

/// Upper-case, sort ordinally and de-duplicate.
pub fn normalize_names<I>(names: I) -> Vec<String>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut out: Vec<String> = names
        .into_iter()
        .map(|n| n.as_ref().trim().to_ascii_uppercase())
        .filter(|n| !n.is_empty())
        .collect();
    out.sort_unstable();
    out.dedup();
    out
}

/// Everything a storage collaborator may hold under a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEntry {
    Response(CachedResponse),
    VaryByRules(CachedVaryByRules),
}

impl CacheEntry {
    pub fn kind(&self) -> &'static str {
        match self {
            CacheEntry::Response(_) => "response",
            CacheEntry::VaryByRules(_) => "vary-rules",
        }
    }
}

impl From<CachedResponse> for CacheEntry {
    fn from(r: CachedResponse) -> Self {
        CacheEntry::Response(r)
    }
}

impl From<CachedVaryByRules> for CacheEntry {
    fn from(r: CachedVaryByRules) -> Self {
        CacheEntry::VaryByRules(r)
    }
}
