pub mod middleware;
pub mod store;

use std::{
    collections::BTreeMap,
    hash::Hasher,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use axum::response::Response;
use fnv::FnvHasher;
use http::Uri;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, IntoStaticStr};

pub use middleware::{Cache, CacheBuilder, Opts};
pub use store::{CacheStore, MemoryStore, RedisStore};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unable to encode cached response: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("unable to decode cached response: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("unable to read body: {0}")]
    ReadBody(String),
    #[error("malformed request URI: {0}")]
    Uri(String),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, Display, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum CacheBypassReason {
    MethodNotCacheable,
    UnableToReadBody,
    SizeUnknown,
    BodyTooBig,
    HttpError,
}

#[derive(Debug, Clone, Display, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheStatus {
    Bypass(CacheBypassReason),
    Hit,
    Miss,
    Refresh,
}

// Injects itself into a given response to be accessible by outer middleware
impl CacheStatus {
    pub fn with_response<T>(self, mut resp: Response<T>) -> Response<T> {
        resp.extensions_mut().insert(self);
        resp
    }
}

/// The cached response record. Encoded as self-describing MessagePack,
/// the sole codec contract is that encode/decode round-trip exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    /// Response body bytes
    pub body: Vec<u8>,
    /// Response header multimap, insertion-ordered
    pub header: Vec<(String, Vec<String>)>,
    /// Absolute expiration instant, unix milliseconds
    pub expiration: i64,
    /// Last time this record was served, unix milliseconds
    pub last_access: i64,
    /// How many times this record was served, 1 after the first write
    pub frequency: u64,
}

impl CachedResponse {
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn from_bytes(b: &[u8]) -> Result<Self, Error> {
        Ok(rmp_serde::from_slice(b)?)
    }

    pub fn expires_at(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.expiration.max(0) as u64)
    }

    pub fn is_fresh(&self, now: SystemTime) -> bool {
        self.expires_at() > now
    }
}

pub fn unix_millis(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Canonical form of the request path+query: every parameter's value list is
/// sorted, keys are emitted in sorted order and re-encoded. The refresh
/// parameter is always removed so that refresh and non-refresh requests for
/// the same resource produce the same fingerprint. Returns the canonical
/// string and whether the refresh parameter was present.
pub fn canonicalize_uri(uri: &Uri, refresh_param: &str) -> (String, bool) {
    let path = uri.path();
    let Some(query) = uri.query() else {
        return (path.to_string(), false);
    };

    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
        params.entry(k.into_owned()).or_default().push(v.into_owned());
    }

    let refresh = params.remove(refresh_param).is_some();

    for values in params.values_mut() {
        values.sort();
    }

    if params.is_empty() {
        return (path.to_string(), refresh);
    }

    let mut encoded = url::form_urlencoded::Serializer::new(String::new());
    for (k, values) in &params {
        for v in values {
            encoded.append_pair(k, v);
        }
    }

    (format!("{path}?{}", encoded.finish()), refresh)
}

/// Rebuilds the request URI around a canonical path+query so that downstream
/// handlers (and the upstream) observe the stripped, sorted form.
pub fn rebuild_uri(uri: &Uri, canonical: &str) -> Result<Uri, Error> {
    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(
        canonical
            .parse()
            .map_err(|e: http::uri::InvalidUri| Error::Uri(e.to_string()))?,
    );
    Uri::from_parts(parts).map_err(|e| Error::Uri(e.to_string()))
}

/// Derives the 64-bit cache key with FNV-1a over the canonical URL bytes,
/// followed by the body bytes for body-carrying methods.
pub fn fingerprint(canonical: &str, body: Option<&[u8]>) -> u64 {
    let mut hash = FnvHasher::default();
    hash.write(canonical.as_bytes());
    if let Some(body) = body {
        hash.write(body);
    }
    hash.finish()
}

/// Renders the key the way it is stored in Redis (base-36)
pub fn key_as_string(mut key: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    if key == 0 {
        return "0".into();
    }

    let mut buf = [0u8; 13];
    let mut i = buf.len();
    while key > 0 {
        i -= 1;
        buf[i] = DIGITS[(key % 36) as usize];
        key /= 36;
    }

    String::from_utf8_lossy(&buf[i..]).into_owned()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_canonicalize_uri() {
        // Key order and multi-value order are normalised
        let u1 = Uri::from_static("/r/foo?b=2&a=1&b=1");
        let u2 = Uri::from_static("/r/foo?a=1&b=1&b=2");
        assert_eq!(canonicalize_uri(&u1, "refresh"), canonicalize_uri(&u2, "refresh"));
        assert_eq!(canonicalize_uri(&u1, "refresh").0, "/r/foo?a=1&b=1&b=2");

        // Refresh param is stripped and reported
        let u3 = Uri::from_static("/r/foo?a=1&b=1&b=2&refresh=1");
        let (canonical, refresh) = canonicalize_uri(&u3, "refresh");
        assert!(refresh);
        assert_eq!(canonical, "/r/foo?a=1&b=1&b=2");

        // Refresh as the only param leaves a bare path
        let u4 = Uri::from_static("/r/foo?refresh=1");
        assert_eq!(canonicalize_uri(&u4, "refresh"), ("/r/foo".to_string(), true));

        // No query at all
        let u5 = Uri::from_static("/r/foo");
        assert_eq!(canonicalize_uri(&u5, "refresh"), ("/r/foo".to_string(), false));
    }

    #[test]
    fn test_fingerprint() {
        // Canonical-equal requests hash equal
        let (c1, _) = canonicalize_uri(&Uri::from_static("/r/foo?b=2&a=1"), "refresh");
        let (c2, _) = canonicalize_uri(&Uri::from_static("/r/foo?a=1&b=2"), "refresh");
        assert_eq!(fingerprint(&c1, None), fingerprint(&c2, None));

        // Refresh and non-refresh requests hash equal
        let (c3, _) = canonicalize_uri(&Uri::from_static("/r/foo?a=1&b=2&refresh=1"), "refresh");
        assert_eq!(fingerprint(&c1, None), fingerprint(&c3, None));

        // Body participates for body-carrying methods
        assert_ne!(fingerprint(&c1, Some(b"x")), fingerprint(&c1, None));
        assert_ne!(fingerprint(&c1, Some(b"x")), fingerprint(&c1, Some(b"y")));

        // Different resources differ
        let (c4, _) = canonicalize_uri(&Uri::from_static("/r/bar?a=1&b=2"), "refresh");
        assert_ne!(fingerprint(&c1, None), fingerprint(&c4, None));
    }

    #[test]
    fn test_cached_response_roundtrip() {
        let r = CachedResponse {
            body: b"hello world".to_vec(),
            header: vec![
                ("content-type".into(), vec!["text/plain".into()]),
                ("x-multi".into(), vec!["a".into(), "b".into()]),
            ],
            expiration: 1_700_000_000_123,
            last_access: 1_700_000_000_000,
            frequency: 3,
        };

        let encoded = r.to_bytes().unwrap();
        let decoded = CachedResponse::from_bytes(&encoded).unwrap();
        assert_eq!(r, decoded);

        // Garbage fails to decode
        assert!(CachedResponse::from_bytes(b"\x00\xffgarbage").is_err());
    }

    #[test]
    fn test_key_as_string() {
        assert_eq!(key_as_string(0), "0");
        assert_eq!(key_as_string(35), "z");
        assert_eq!(key_as_string(36), "10");
        assert_eq!(key_as_string(u64::MAX), "3w5e11264sgsf");
    }
}
