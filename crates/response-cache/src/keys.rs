//! Cache key derivation.
//!
//! Base keys are `METHOD␟PATH`. Vary keys hang off a vary-rules prefix:
//! `PREFIX␟H␟Name=Value␟...␟Q␟Name=Value␟...`, where `␟` is [`KEY_DELIMITER`].
//! Scheme, host, port and query string never take part in a base key.

use crate::entry::CachedVaryByRules;
use crate::error::CacheError;
use http::Request;

/// ASCII unit separator. Never legal in a header value, path or query parameter name.
pub const KEY_DELIMITER: char = '\x1f';

#[derive(Debug, Clone, Default)]
pub struct KeyProvider {
    case_sensitive_paths: bool,
}

impl KeyProvider {
    pub fn new(case_sensitive_paths: bool) -> Self {
        Self {
            case_sensitive_paths,
        }
    }

    pub fn base_key<B>(&self, req: &Request<B>) -> String {
        let method = req.method().as_str();
        let path = req.uri().path();
        let mut key = String::with_capacity(method.len() + 1 + path.len());
        key.push_str(&method.to_ascii_uppercase());
        key.push(KEY_DELIMITER);
        if self.case_sensitive_paths {
            key.push_str(path);
        } else {
            key.push_str(&path.to_ascii_uppercase());
        }
        key
    }

    /// Key under which the response for `req` lives once `rules` partition its base key.
    ///
    /// Rule names are emitted as declared; matching against the request ignores case.
    /// A missing header or query parameter contributes `Name=` rather than being skipped.
    pub fn vary_key<B>(
        &self,
        req: &Request<B>,
        rules: Option<&CachedVaryByRules>,
    ) -> Result<String, CacheError> {
        let rules = rules.ok_or(CacheError::MissingVaryRules)?;
        let mut key = rules.key_prefix.clone();

        if !rules.headers.is_empty() {
            key.push(KEY_DELIMITER);
            key.push('H');
            for name in &rules.headers {
                let value = joined_header(req, name);
                push_pair(&mut key, name, &value);
            }
        }

        if !rules.query_keys.is_empty() {
            let query = query_pairs(req);
            key.push(KEY_DELIMITER);
            key.push('Q');
            if rules.varies_by_all_query_keys() {
                let mut names: Vec<String> =
                    query.iter().map(|(k, _)| k.to_ascii_uppercase()).collect();
                names.sort_unstable();
                names.dedup();
                for name in &names {
                    push_pair(&mut key, name, &joined_query(&query, name));
                }
            } else {
                for name in &rules.query_keys {
                    push_pair(&mut key, name, &joined_query(&query, name));
                }
            }
        }

        Ok(key)
    }

    /// Vary keys to try, in order, when the base key holds vary rules.
    pub fn lookup_vary_keys<B>(
        &self,
        req: &Request<B>,
        rules: &CachedVaryByRules,
    ) -> Result<Vec<String>, CacheError> {
        Ok(vec![self.vary_key(req, Some(rules))?])
    }
}

fn push_pair(key: &mut String, name: &str, value: &str) {
    key.push(KEY_DELIMITER);
    key.push_str(name);
    key.push('=');
    key.push_str(value);
}

fn joined_header<B>(req: &Request<B>, name: &str) -> String {
    let values: Vec<&str> = req
        .headers()
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    values.join(",")
}

fn query_pairs<B>(req: &Request<B>) -> Vec<(String, String)> {
    req.uri()
        .query()
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default()
}

fn joined_query(query: &[(String, String)], name: &str) -> String {
    let values: Vec<&str> = query
        .iter()
        .filter(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
        .collect();
    values.join(",")
}
