//! Versioned binary format for [`CacheEntry`] values.
//!
//! ```text
//! version        i32
//! discriminator  u8     'R' response | 'V' vary rules
//!
//! 'R'  created        i64   nanoseconds since the Unix epoch
//!      status         u16
//!      header count   u32
//!        name         str
//!        value count  u32
//!          value      bytes
//!      body layout    u8    'I' inline | 'S' detached
//!        'I' shard size u32, body length u64, body bytes
//!        'S' shard key prefix str, shard count u32, shard size u32, body length u64
//!
//! 'V'  key prefix     str
//!      header count   u32, names str...
//!      query count    u32, names str...
//! ```
//!
//! Integers are little-endian; `str`/`bytes` are a `u32` length followed by the payload.
//! Anything that doesn't parse cleanly, including a version mismatch, an unknown
//! discriminator or trailing garbage, decodes to `None` and is treated as a miss.

use crate::buffer::ShardedBody;
use crate::entry::{CacheEntry, CachedResponse, CachedVaryByRules};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub const FORMAT_VERSION: i32 = 1;

const RESPONSE: u8 = b'R';
const VARY_RULES: u8 = b'V';
const BODY_INLINE: u8 = b'I';
const BODY_DETACHED: u8 = b'S';

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("input truncated")]
    Truncated,
    #[error("unsupported format version {0}")]
    UnsupportedVersion(i32),
    #[error("unknown entry discriminator {0:#04x}")]
    UnknownDiscriminator(u8),
    #[error("invalid {0}")]
    Invalid(&'static str),
    #[error("{0} trailing bytes")]
    TrailingBytes(usize),
}

/// A response whose body shards are stored under separate keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachedResponse {
    pub created: SystemTime,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub shard_key_prefix: String,
    pub shard_count: u32,
    pub shard_size: usize,
    pub body_len: u64,
}

impl DetachedResponse {
    pub fn shard_key(prefix: &str, index: u32) -> String {
        format!("{prefix}{index}")
    }

    pub fn shard_keys(&self) -> impl Iterator<Item = String> + '_ {
        (0..self.shard_count).map(|i| Self::shard_key(&self.shard_key_prefix, i))
    }

    /// Rebuild the full response once the shards are fetched. `None` if they don't add
    /// up to the recorded layout.
    pub fn attach(self, shards: Vec<Bytes>) -> Option<CachedResponse> {
        let body = ShardedBody::from_shards(shards, self.shard_size, self.body_len)?;
        Some(CachedResponse {
            created: self.created,
            status: self.status,
            headers: self.headers,
            body,
        })
    }
}

/// Result of decoding any record the format can hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Entry(CacheEntry),
    Detached(DetachedResponse),
}

/// Encode an entry with the body inline.
pub fn encode(entry: &CacheEntry) -> Bytes {
    let mut out = BytesMut::new();
    out.put_i32_le(FORMAT_VERSION);
    match entry {
        CacheEntry::Response(response) => {
            out.put_u8(RESPONSE);
            put_response_head(&mut out, response.created, response.status, &response.headers);
            out.put_u8(BODY_INLINE);
            out.put_u32_le(response.body.shard_size() as u32);
            out.put_u64_le(response.body.len());
            out.reserve(response.body.len() as usize);
            for shard in response.body.shards() {
                out.put_slice(shard);
            }
        }
        CacheEntry::VaryByRules(rules) => {
            out.put_u8(VARY_RULES);
            put_str(&mut out, &rules.key_prefix);
            put_str_list(&mut out, &rules.headers);
            put_str_list(&mut out, &rules.query_keys);
        }
    }
    out.freeze()
}

/// Encode a response header record that points at body shards stored under
/// `shard_key_prefix + index`.
pub fn encode_detached(response: &CachedResponse, shard_key_prefix: &str) -> Bytes {
    let mut out = BytesMut::new();
    out.put_i32_le(FORMAT_VERSION);
    out.put_u8(RESPONSE);
    put_response_head(&mut out, response.created, response.status, &response.headers);
    out.put_u8(BODY_DETACHED);
    put_str(&mut out, shard_key_prefix);
    out.put_u32_le(response.body.shards().len() as u32);
    out.put_u32_le(response.body.shard_size() as u32);
    out.put_u64_le(response.body.len());
    out.freeze()
}

/// Decode a self-contained entry. Detached responses can't be materialized without
/// their shards and decode to `None` here; use [`decode_any`] for those.
pub fn decode(bytes: Bytes) -> Option<CacheEntry> {
    match decode_any(bytes)? {
        Decoded::Entry(entry) => Some(entry),
        Decoded::Detached(_) => None,
    }
}

pub fn decode_any(bytes: Bytes) -> Option<Decoded> {
    match try_decode(bytes) {
        Ok(decoded) => Some(decoded),
        Err(err) => {
            tracing::debug!(error = %err, "discarding undecodable cache entry");
            None
        }
    }
}

fn try_decode(bytes: Bytes) -> Result<Decoded, DecodeError> {
    let mut r = Reader(bytes);
    let version = r.i32()?;
    if version != FORMAT_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    let decoded = match r.u8()? {
        RESPONSE => read_response(&mut r)?,
        VARY_RULES => Decoded::Entry(CacheEntry::VaryByRules(CachedVaryByRules {
            key_prefix: r.string()?,
            headers: r.string_list()?,
            query_keys: r.string_list()?,
        })),
        other => return Err(DecodeError::UnknownDiscriminator(other)),
    };
    if r.0.has_remaining() {
        return Err(DecodeError::TrailingBytes(r.0.remaining()));
    }
    Ok(decoded)
}

fn read_response(r: &mut Reader) -> Result<Decoded, DecodeError> {
    let created = from_unix_nanos(r.i64()?).ok_or(DecodeError::Invalid("creation time"))?;
    let status = StatusCode::from_u16(r.u16()?).map_err(|_| DecodeError::Invalid("status code"))?;

    let mut headers = HeaderMap::new();
    for _ in 0..r.u32()? {
        let name = HeaderName::from_bytes(&r.bytes()?)
            .map_err(|_| DecodeError::Invalid("header name"))?;
        for _ in 0..r.u32()? {
            let value = HeaderValue::from_maybe_shared(r.bytes()?)
                .map_err(|_| DecodeError::Invalid("header value"))?;
            headers.append(name.clone(), value);
        }
    }

    match r.u8()? {
        BODY_INLINE => {
            let shard_size = r.shard_size()?;
            let len = usize::try_from(r.u64()?).map_err(|_| DecodeError::Invalid("body length"))?;
            let body = ShardedBody::from_bytes(r.take(len)?, shard_size);
            Ok(Decoded::Entry(CacheEntry::Response(CachedResponse {
                created,
                status,
                headers,
                body,
            })))
        }
        BODY_DETACHED => {
            let shard_key_prefix = r.string()?;
            let shard_count = r.u32()?;
            let shard_size = r.shard_size()?;
            let body_len = r.u64()?;
            if u64::from(shard_count) != body_len.div_ceil(shard_size as u64) {
                return Err(DecodeError::Invalid("shard count"));
            }
            Ok(Decoded::Detached(DetachedResponse {
                created,
                status,
                headers,
                shard_key_prefix,
                shard_count,
                shard_size,
                body_len,
            }))
        }
        _ => Err(DecodeError::Invalid("body layout")),
    }
}

fn put_response_head(
    out: &mut BytesMut,
    created: SystemTime,
    status: StatusCode,
    headers: &HeaderMap,
) {
    out.put_i64_le(to_unix_nanos(created));
    out.put_u16_le(status.as_u16());
    out.put_u32_le(headers.keys_len() as u32);
    for name in headers.keys() {
        put_bytes(out, name.as_str().as_bytes());
        let values = headers.get_all(name);
        out.put_u32_le(values.iter().count() as u32);
        for value in values {
            put_bytes(out, value.as_bytes());
        }
    }
}

fn put_bytes(out: &mut BytesMut, b: &[u8]) {
    out.put_u32_le(b.len() as u32);
    out.put_slice(b);
}

fn put_str(out: &mut BytesMut, s: &str) {
    put_bytes(out, s.as_bytes());
}

fn put_str_list(out: &mut BytesMut, list: &[String]) {
    out.put_u32_le(list.len() as u32);
    for s in list {
        put_str(out, s);
    }
}

fn to_unix_nanos(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_nanos()).unwrap_or(i64::MAX),
        Err(e) => i64::try_from(e.duration().as_nanos()).map_or(i64::MIN, |n| -n),
    }
}

fn from_unix_nanos(n: i64) -> Option<SystemTime> {
    if n >= 0 {
        UNIX_EPOCH.checked_add(Duration::from_nanos(n as u64))
    } else {
        UNIX_EPOCH.checked_sub(Duration::from_nanos(n.unsigned_abs()))
    }
}

struct Reader(Bytes);

impl Reader {
    fn need(&self, n: usize) -> Result<(), DecodeError> {
        if self.0.remaining() < n {
            Err(DecodeError::Truncated)
        } else {
            Ok(())
        }
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        self.need(1)?;
        Ok(self.0.get_u8())
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        self.need(2)?;
        Ok(self.0.get_u16_le())
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        self.need(4)?;
        Ok(self.0.get_u32_le())
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        self.need(4)?;
        Ok(self.0.get_i32_le())
    }

    fn i64(&mut self) -> Result<i64, DecodeError> {
        self.need(8)?;
        Ok(self.0.get_i64_le())
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        self.need(8)?;
        Ok(self.0.get_u64_le())
    }

    fn take(&mut self, n: usize) -> Result<Bytes, DecodeError> {
        self.need(n)?;
        Ok(self.0.split_to(n))
    }

    fn bytes(&mut self) -> Result<Bytes, DecodeError> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn string(&mut self) -> Result<String, DecodeError> {
        String::from_utf8(self.bytes()?.to_vec()).map_err(|_| DecodeError::Invalid("utf-8 string"))
    }

    fn string_list(&mut self) -> Result<Vec<String>, DecodeError> {
        let count = self.u32()?;
        let mut out = Vec::new();
        for _ in 0..count {
            out.push(self.string()?);
        }
        Ok(out)
    }

    fn shard_size(&mut self) -> Result<usize, DecodeError> {
        match self.u32()? {
            0 => Err(DecodeError::Invalid("shard size")),
            n => Ok(n as usize),
        }
    }
}
