//! Cacheability and freshness rules.
//!
//! Everything here is a pure function of the request/response heads handed in; the only
//! state a [`CachePolicy`] carries is the pair of optional override hooks.

use crate::cache_control::{header_list, http_date, pragma_no_cache, CacheControl};
use http::header::{AUTHORIZATION, CACHE_CONTROL, DATE, EXPIRES, VARY};
use http::{HeaderMap, Method, StatusCode};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// What an override hook wants done with a request or response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideDecision {
    Allow,
    Deny,
    /// Fall through to the built-in rules.
    Default,
}

type RequestHook = dyn Fn(&Method, &HeaderMap) -> OverrideDecision + Send + Sync;
type ResponseHook = dyn Fn(StatusCode, &HeaderMap) -> OverrideDecision + Send + Sync;

#[derive(Clone, Default)]
pub struct CachePolicy {
    request_override: Option<Arc<RequestHook>>,
    response_override: Option<Arc<ResponseHook>>,
}

impl fmt::Debug for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachePolicy")
            .field("request_override", &self.request_override.is_some())
            .field("response_override", &self.response_override.is_some())
            .finish()
    }
}

impl CachePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hook consulted before the built-in request rules, e.g. to cache extra verbs.
    pub fn with_request_override<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Method, &HeaderMap) -> OverrideDecision + Send + Sync + 'static,
    {
        self.request_override = Some(Arc::new(hook));
        self
    }

    /// Hook consulted before the built-in response rules.
    pub fn with_response_override<F>(mut self, hook: F) -> Self
    where
        F: Fn(StatusCode, &HeaderMap) -> OverrideDecision + Send + Sync + 'static,
    {
        self.response_override = Some(Arc::new(hook));
        self
    }

    pub fn request_is_cacheable(&self, method: &Method, headers: &HeaderMap) -> bool {
        if let Some(hook) = &self.request_override {
            match hook(method, headers) {
                OverrideDecision::Allow => return true,
                OverrideDecision::Deny => return false,
                OverrideDecision::Default => {}
            }
        }

        if method != Method::GET && method != Method::HEAD {
            return false;
        }
        if headers.contains_key(AUTHORIZATION) {
            return false;
        }
        if headers.contains_key(CACHE_CONTROL) {
            !CacheControl::from_headers(headers).no_cache
        } else {
            !pragma_no_cache(headers)
        }
    }

    /// Whether a response may be stored. `response_time` is when the response was
    /// produced; a response that is already stale by then is not worth storing.
    pub fn response_is_cacheable(
        &self,
        request_headers: &HeaderMap,
        status: StatusCode,
        response_headers: &HeaderMap,
        response_time: SystemTime,
    ) -> bool {
        if let Some(hook) = &self.response_override {
            match hook(status, response_headers) {
                OverrideDecision::Allow => return true,
                OverrideDecision::Deny => return false,
                OverrideDecision::Default => {}
            }
        }

        let response = CacheControl::from_headers(response_headers);
        if !response.public || response.no_store || response.no_cache || response.private {
            return false;
        }
        if CacheControl::from_headers(request_headers).no_store {
            return false;
        }
        if header_list(response_headers, &VARY).iter().any(|v| v == "*") {
            return false;
        }
        if status != StatusCode::OK {
            return false;
        }

        !already_expired(&response, response_headers, response_time)
    }
}

fn already_expired(cc: &CacheControl, headers: &HeaderMap, response_time: SystemTime) -> bool {
    let expires = http_date(headers, &EXPIRES);
    match http_date(headers, &DATE).flatten() {
        None => {
            if cc.s_maxage.is_some() || cc.max_age.is_some() {
                return false;
            }
            match expires {
                Some(Some(expires)) => response_time >= expires,
                Some(None) => true,
                None => false,
            }
        }
        Some(date) => {
            let age = response_time.duration_since(date).unwrap_or(Duration::ZERO);
            if let Some(s_maxage) = cc.s_maxage {
                return age > s_maxage;
            }
            if let Some(max_age) = cc.max_age {
                return age > max_age;
            }
            match expires {
                Some(Some(expires)) => {
                    age >= expires.duration_since(date).unwrap_or(Duration::ZERO)
                }
                Some(None) => true,
                None => false,
            }
        }
    }
}

/// Whether a stored response of `age` may be served without revalidation.
///
/// With `request` present its `min-fresh`, `max-age` and `max-stale` directives take part;
/// without it only the response's own directives count. `now` is compared against
/// `Expires` when no max-age directive applies.
pub fn is_fresh(
    response_headers: &HeaderMap,
    age: Duration,
    now: SystemTime,
    request: Option<&HeaderMap>,
) -> bool {
    let response = CacheControl::from_headers(response_headers);
    let request = request.map(CacheControl::from_headers);

    let mut age = age;
    if let Some(min_fresh) = request.as_ref().and_then(|r| r.min_fresh) {
        age = age.saturating_add(min_fresh);
    }

    if let Some(s_maxage) = response.s_maxage {
        return age <= s_maxage;
    }

    let max_age = match (response.max_age, request.as_ref().and_then(|r| r.max_age)) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };

    if let Some(max_age) = max_age {
        if age <= max_age {
            return true;
        }
        if response.must_revalidate || response.proxy_revalidate {
            return false;
        }
        return request
            .and_then(|r| r.max_stale)
            .is_some_and(|stale| stale.covers(age - max_age));
    }

    match http_date(response_headers, &EXPIRES) {
        None => true,
        Some(Some(expires)) => now < expires,
        Some(None) => false,
    }
}
