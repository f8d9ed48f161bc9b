use std::{
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};

use axum::{
    body::Body,
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{
    HeaderMap, Method, StatusCode,
    header::{EXPIRES, HeaderName, HeaderValue},
};
use http_body::Body as _;
use prometheus::{
    CounterVec, HistogramVec, Registry, register_counter_vec_with_registry,
    register_histogram_vec_with_registry,
};
use tracing::{debug, warn};

use super::{
    CacheBypassReason, CacheStatus, CachedResponse, Error, canonicalize_uri, fingerprint,
    rebuild_uri, store::CacheStore, unix_millis,
};
use crate::http::{Error as HttpError, body::buffer_body};

enum ResponseType {
    Fetched(Response<Bytes>),
    Streamed(Response, CacheBypassReason),
}

#[derive(Clone)]
pub struct Metrics {
    requests_count: CounterVec,
    requests_duration: HistogramVec,
}

impl Metrics {
    pub fn new(registry: &Registry) -> Self {
        let lbls = &["cache_status", "cache_bypass_reason"];

        Self {
            requests_count: register_counter_vec_with_registry!(
                "cache_requests_count",
                "Cache requests count",
                lbls,
                registry,
            )
            .unwrap(),

            requests_duration: register_histogram_vec_with_registry!(
                "cache_requests_duration",
                "Time it took to execute the request",
                lbls,
                registry,
            )
            .unwrap(),
        }
    }
}

pub struct Opts {
    pub ttl: Duration,
    pub methods: Vec<Method>,
    pub refresh_param: String,
    pub expires_header: bool,
    pub max_item_size: usize,
    pub body_timeout: Duration,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(86400),
            methods: vec![Method::GET],
            refresh_param: "refresh".into(),
            expires_header: false,
            max_item_size: 16 * 1024 * 1024,
            body_timeout: Duration::from_secs(60),
        }
    }
}

/// Builds a cache middleware using some overridable defaults
pub struct CacheBuilder {
    store: Arc<dyn CacheStore>,
    opts: Opts,
    registry: Registry,
}

impl CacheBuilder {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            opts: Opts::default(),
            registry: Registry::new(),
        }
    }

    /// Sets how long each response is going to be cached. Default 24h.
    pub const fn ttl(mut self, v: Duration) -> Self {
        self.opts.ttl = v;
        self
    }

    /// Sets cacheable methods. Defaults to only GET.
    pub fn methods(mut self, v: &[Method]) -> Self {
        self.opts.methods = v.into();
        self
    }

    /// Sets the query parameter that invalidates the matched entry.
    /// Default "refresh".
    pub fn refresh_param(mut self, v: &str) -> Self {
        self.opts.refresh_param = v.into();
        self
    }

    /// Whether to add an `Expires` header when serving from cache.
    /// Default false.
    pub const fn expires_header(mut self, v: bool) -> Self {
        self.opts.expires_header = v;
        self
    }

    /// Sets the maximum size of a response that is still cached. Default 16MB.
    pub const fn max_item_size(mut self, v: usize) -> Self {
        self.opts.max_item_size = v;
        self
    }

    /// Sets the body reading timeout. Default 1 min.
    pub const fn body_timeout(mut self, v: Duration) -> Self {
        self.opts.body_timeout = v;
        self
    }

    /// Sets the metrics registry to use.
    pub fn registry(mut self, v: &Registry) -> Self {
        self.registry = v.clone();
        self
    }

    pub fn build(self) -> Result<Cache, Error> {
        if self.opts.ttl < Duration::from_secs(1) {
            return Err(Error::Other("TTL should be at least 1s".into()));
        }

        for m in &self.opts.methods {
            if m != Method::GET && m != Method::POST {
                return Err(Error::Other(format!("method {m} is not cacheable")));
            }
        }

        Ok(Cache {
            store: self.store,
            metrics: Metrics::new(&self.registry),
            opts: self.opts,
        })
    }
}

/// HTTP response cache middleware.
///
/// Requests with a cacheable method are fingerprinted over the canonicalised
/// URL (plus body for POST) and served from the store when a fresh entry
/// exists. Concurrent misses for the same fingerprint independently reach
/// the upstream, the last writer wins.
pub struct Cache {
    store: Arc<dyn CacheStore>,
    metrics: Metrics,
    opts: Opts,
}

impl Cache {
    pub async fn process_request(&self, request: Request, next: Next) -> Result<Response, Error> {
        let now = Instant::now();
        let (cache_status, response) = self.process_inner(request, next).await?;

        let cache_status_str: &'static str = (&cache_status).into();
        let cache_bypass_reason_str: &'static str = match &cache_status {
            CacheStatus::Bypass(v) => v.into(),
            _ => "none",
        };

        let labels = &[cache_status_str, cache_bypass_reason_str];

        self.metrics.requests_count.with_label_values(labels).inc();
        self.metrics
            .requests_duration
            .with_label_values(labels)
            .observe(now.elapsed().as_secs_f64());

        Ok(cache_status.with_response(response))
    }

    async fn process_inner(
        &self,
        mut request: Request,
        next: Next,
    ) -> Result<(CacheStatus, Response), Error> {
        // Check the method
        if !self.opts.methods.contains(request.method()) {
            return Ok((
                CacheStatus::Bypass(CacheBypassReason::MethodNotCacheable),
                next.run(request).await,
            ));
        }

        // Canonicalise the query and strip the refresh parameter so that the
        // downstream (and the fingerprint) never see it
        let (canonical, refresh) = canonicalize_uri(request.uri(), &self.opts.refresh_param);
        *request.uri_mut() = rebuild_uri(request.uri(), &canonical)?;

        // Body-carrying methods fingerprint over URL+body.
        // The body is restored for downstream handlers.
        let mut body = None;
        if request.method() == Method::POST {
            let (parts, request_body) = request.into_parts();
            match buffer_body(request_body, self.opts.max_item_size, self.opts.body_timeout).await {
                Ok(v) => {
                    request = Request::from_parts(parts, Body::from(v.clone()));
                    body = Some(v);
                }
                Err(e) => {
                    warn!(error = %e, "unable to read request body, bypassing cache");
                    let request = Request::from_parts(parts, Body::empty());
                    return Ok((
                        CacheStatus::Bypass(CacheBypassReason::UnableToReadBody),
                        next.run(request).await,
                    ));
                }
            }
        }

        let key = fingerprint(&canonical, body.as_deref());

        if refresh {
            debug!(key, url = %canonical, "cache refresh requested");
            self.store.release(key).await;
            return self.fetch(key, CacheStatus::Refresh, request, next).await;
        }

        if let Some(raw) = self.store.get(key).await {
            match CachedResponse::from_bytes(&raw) {
                Ok(mut cached) => {
                    let now = SystemTime::now();

                    if cached.is_fresh(now) {
                        cached.frequency += 1;
                        cached.last_access = unix_millis(now);

                        // Re-store the updated record preserving the original expiration
                        match cached.to_bytes() {
                            Ok(v) => self.store.set(key, v.into(), cached.expires_at()).await,
                            Err(e) => warn!(key, error = %e, "unable to re-encode cached response"),
                        }

                        debug!(key, url = %canonical, frequency = cached.frequency, "cache hit");
                        return Ok((CacheStatus::Hit, self.serve_cached(&cached)));
                    }

                    debug!(key, expiration = cached.expiration, "cache entry expired");
                    self.store.release(key).await;
                }
                Err(e) => {
                    // Not purged eagerly, the entry will be overwritten or expire
                    warn!(key, error = %e, "unable to decode cached response, treating as miss");
                }
            }
        }

        self.fetch(key, CacheStatus::Miss, request, next).await
    }

    /// Invokes the downstream and conditionally stores the result
    async fn fetch(
        &self,
        key: u64,
        status: CacheStatus,
        request: Request,
        next: Next,
    ) -> Result<(CacheStatus, Response), Error> {
        Ok(match self.pass_request(request, next).await? {
            ResponseType::Fetched(v) => {
                let now = SystemTime::now();
                let expiration = now + self.opts.ttl;

                let cached = CachedResponse {
                    body: v.body().to_vec(),
                    header: snapshot_headers(v.headers()),
                    expiration: unix_millis(expiration),
                    last_access: unix_millis(now),
                    frequency: 1,
                };

                match cached.to_bytes() {
                    Ok(encoded) => self.store.set(key, encoded.into(), expiration).await,
                    Err(e) => warn!(key, error = %e, "unable to encode response for caching"),
                }

                let (parts, body) = v.into_parts();
                (status, Response::from_parts(parts, Body::from(body)))
            }

            ResponseType::Streamed(v, reason) => (CacheStatus::Bypass(reason), v),
        })
    }

    // Passes the request down the line and conditionally fetches the response body
    async fn pass_request(&self, request: Request, next: Next) -> Result<ResponseType, Error> {
        let response = next.run(request).await;

        // Never cache 4xx/5xx
        if response.status() >= StatusCode::BAD_REQUEST {
            return Ok(ResponseType::Streamed(
                response,
                CacheBypassReason::HttpError,
            ));
        }

        // Do not cache responses that have no known size (streaming etc)
        let body_size = response.body().size_hint().exact().map(|x| x as usize);
        let Some(body_size) = body_size else {
            return Ok(ResponseType::Streamed(
                response,
                CacheBypassReason::SizeUnknown,
            ));
        };

        // Do not cache items larger than configured
        if body_size > self.opts.max_item_size {
            return Ok(ResponseType::Streamed(
                response,
                CacheBypassReason::BodyTooBig,
            ));
        }

        let (parts, body) = response.into_parts();
        let body = buffer_body(body, self.opts.max_item_size, self.opts.body_timeout)
            .await
            .map_err(|e| match e {
                HttpError::BodyTimedOut => Error::ReadBody("timed out".into()),
                e => Error::ReadBody(e.to_string()),
            })?;

        Ok(ResponseType::Fetched(Response::from_parts(parts, body)))
    }

    /// Materialises a response from the stored record: multi-value headers
    /// are comma-joined, optionally an `Expires` header is added
    fn serve_cached(&self, cached: &CachedResponse) -> Response {
        let mut response = Response::new(Body::from(cached.body.clone()));

        for (name, values) in &cached.header {
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            let Ok(value) = HeaderValue::from_str(&values.join(",")) else {
                continue;
            };
            response.headers_mut().insert(name, value);
        }

        if self.opts.expires_header {
            let value = DateTime::<Utc>::from_timestamp_millis(cached.expiration)
                .map(|dt| dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string())
                .and_then(|v| HeaderValue::from_str(&v).ok());

            if let Some(value) = value {
                response.headers_mut().insert(EXPIRES, value);
            }
        }

        response
    }
}

fn snapshot_headers(headers: &HeaderMap) -> Vec<(String, Vec<String>)> {
    headers
        .keys()
        .map(|name| {
            let values = headers
                .get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok().map(String::from))
                .collect();
            (name.as_str().to_string(), values)
        })
        .collect()
}

pub async fn middleware(
    State(cache): State<Arc<Cache>>,
    request: Request,
    next: Next,
) -> Response {
    cache.process_request(request, next).await.unwrap_or_else(|e| {
        warn!(error = %e, "cache middleware failed");
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    })
}

#[cfg(test)]
mod test {
    use super::*;

    use axum::{
        Router,
        body::to_bytes,
        middleware::from_fn_with_state,
        routing::{get, post},
    };
    use tokio::time::sleep;
    use tower::Service;

    use crate::cache::store::MemoryStore;

    async fn handler(_request: Request<Body>) -> impl IntoResponse {
        ([("x-upstream", "yes")], "test_body")
    }

    async fn handler_error(_request: Request<Body>) -> impl IntoResponse {
        (StatusCode::INTERNAL_SERVER_ERROR, "boom")
    }

    async fn handler_echo(request: Request<Body>) -> impl IntoResponse {
        to_bytes(request.into_body(), usize::MAX).await.unwrap()
    }

    fn cache_with(opts_setup: impl FnOnce(CacheBuilder) -> CacheBuilder) -> Arc<Cache> {
        let store = Arc::new(MemoryStore::new(1000));
        Arc::new(opts_setup(CacheBuilder::new(store)).build().unwrap())
    }

    fn router(cache: &Arc<Cache>) -> Router {
        Router::new()
            .route("/r/{*rest}", get(handler))
            .route("/r/{*rest}", post(handler))
            .route("/echo", post(handler_echo))
            .route("/error", get(handler_error))
            .layer(from_fn_with_state(Arc::clone(cache), middleware))
    }

    async fn dispatch(app: &mut Router, req: Request) -> (Response, CacheStatus) {
        let result = app.call(req).await.unwrap();
        let status = result.extensions().get::<CacheStatus>().cloned().unwrap();
        (result, status)
    }

    fn get_req(uri: &str) -> Request {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    #[test]
    fn test_builder_validation() {
        let store = Arc::new(MemoryStore::new(10));

        assert!(
            CacheBuilder::new(store.clone())
                .ttl(Duration::from_millis(1))
                .build()
                .is_err()
        );

        assert!(
            CacheBuilder::new(store)
                .methods(&[Method::DELETE])
                .build()
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let cache = cache_with(|b| b);
        let mut app = router(&cache);

        let (result, status) = dispatch(&mut app, get_req("/r/foo?b=2&a=1")).await;
        assert_eq!(status, CacheStatus::Miss);
        assert_eq!(result.status(), StatusCode::OK);

        // Same request with reordered params hits
        let (result, status) = dispatch(&mut app, get_req("/r/foo?a=1&b=2")).await;
        assert_eq!(status, CacheStatus::Hit);
        assert_eq!(result.headers().get("x-upstream").unwrap(), "yes");
        let body = to_bytes(result.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), b"test_body");

        // Different resource misses
        let (_, status) = dispatch(&mut app, get_req("/r/bar?a=1")).await;
        assert_eq!(status, CacheStatus::Miss);
    }

    #[tokio::test]
    async fn test_method_bypass() {
        let cache = cache_with(|b| b);
        let mut app = router(&cache);

        let req = Request::post("/r/foo").body(Body::from("x")).unwrap();
        let (_, status) = dispatch(&mut app, req).await;
        assert_eq!(
            status,
            CacheStatus::Bypass(CacheBypassReason::MethodNotCacheable)
        );
    }

    #[tokio::test]
    async fn test_post_cacheable_keyed_by_body() {
        let cache = cache_with(|b| b.methods(&[Method::GET, Method::POST]));
        let mut app = router(&cache);

        let req = Request::post("/echo").body(Body::from("payload-1")).unwrap();
        let (result, status) = dispatch(&mut app, req).await;
        assert_eq!(status, CacheStatus::Miss);
        // The body was restored for the downstream handler
        let body = to_bytes(result.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), b"payload-1");

        // Same body hits
        let req = Request::post("/echo").body(Body::from("payload-1")).unwrap();
        let (_, status) = dispatch(&mut app, req).await;
        assert_eq!(status, CacheStatus::Hit);

        // Different body misses
        let req = Request::post("/echo").body(Body::from("payload-2")).unwrap();
        let (_, status) = dispatch(&mut app, req).await;
        assert_eq!(status, CacheStatus::Miss);
    }

    #[tokio::test]
    async fn test_refresh_releases_and_repopulates() {
        let cache = cache_with(|b| b);
        let mut app = router(&cache);

        let (_, status) = dispatch(&mut app, get_req("/r/foo")).await;
        assert_eq!(status, CacheStatus::Miss);
        let (_, status) = dispatch(&mut app, get_req("/r/foo")).await;
        assert_eq!(status, CacheStatus::Hit);

        // Refresh skips lookup, invalidates and refetches
        let (_, status) = dispatch(&mut app, get_req("/r/foo?refresh=1")).await;
        assert_eq!(status, CacheStatus::Refresh);

        // The refreshed entry landed under the stripped fingerprint
        let (_, status) = dispatch(&mut app, get_req("/r/foo")).await;
        assert_eq!(status, CacheStatus::Hit);
    }

    #[tokio::test]
    async fn test_error_responses_not_cached() {
        let cache = cache_with(|b| b);
        let mut app = router(&cache);

        let (result, status) = dispatch(&mut app, get_req("/error")).await;
        assert_eq!(result.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(status, CacheStatus::Bypass(CacheBypassReason::HttpError));

        // Still a miss afterwards
        let (_, status) = dispatch(&mut app, get_req("/error")).await;
        assert_eq!(status, CacheStatus::Bypass(CacheBypassReason::HttpError));
    }

    #[tokio::test]
    async fn test_expiration() {
        let cache = cache_with(|b| b.ttl(Duration::from_secs(1)));
        let mut app = router(&cache);

        let (_, status) = dispatch(&mut app, get_req("/r/foo")).await;
        assert_eq!(status, CacheStatus::Miss);
        let (_, status) = dispatch(&mut app, get_req("/r/foo")).await;
        assert_eq!(status, CacheStatus::Hit);

        sleep(Duration::from_millis(1300)).await;

        let (_, status) = dispatch(&mut app, get_req("/r/foo")).await;
        assert_eq!(status, CacheStatus::Miss);
    }

    #[tokio::test]
    async fn test_frequency_increments() {
        let store = Arc::new(MemoryStore::new(1000));
        let cache = Arc::new(CacheBuilder::new(store.clone()).build().unwrap());
        let mut app = router(&cache);

        dispatch(&mut app, get_req("/r/foo")).await;
        dispatch(&mut app, get_req("/r/foo")).await;
        dispatch(&mut app, get_req("/r/foo")).await;

        let (canonical, _) = canonicalize_uri(&"/r/foo".parse().unwrap(), "refresh");
        let key = fingerprint(&canonical, None);
        let raw = store.get(key).await.unwrap();
        let cached = CachedResponse::from_bytes(&raw).unwrap();

        // First write is 1, two hits served since
        assert_eq!(cached.frequency, 3);
        assert!(cached.last_access <= unix_millis(SystemTime::now()));
        assert!(cached.expiration > unix_millis(SystemTime::now()));
    }

    #[tokio::test]
    async fn test_expires_header() {
        let cache = cache_with(|b| b.expires_header(true));
        let mut app = router(&cache);

        let (result, _) = dispatch(&mut app, get_req("/r/foo")).await;
        assert!(result.headers().get(EXPIRES).is_none());

        let (result, status) = dispatch(&mut app, get_req("/r/foo")).await;
        assert_eq!(status, CacheStatus::Hit);
        let expires = result.headers().get(EXPIRES).unwrap().to_str().unwrap();
        assert!(expires.ends_with("GMT"));
    }

    #[tokio::test]
    async fn test_corrupt_entry_treated_as_miss() {
        let store = Arc::new(MemoryStore::new(1000));
        let cache = Arc::new(CacheBuilder::new(store.clone()).build().unwrap());
        let mut app = router(&cache);

        let (canonical, _) = canonicalize_uri(&"/r/foo".parse().unwrap(), "refresh");
        let key = fingerprint(&canonical, None);
        store
            .set(
                key,
                Bytes::from_static(b"\x00\xffgarbage"),
                SystemTime::now() + Duration::from_secs(60),
            )
            .await;

        let (result, status) = dispatch(&mut app, get_req("/r/foo")).await;
        assert_eq!(status, CacheStatus::Miss);
        assert_eq!(result.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_multi_value_headers_joined() {
        async fn handler_multi(_req: Request<Body>) -> impl IntoResponse {
            let mut response = Response::new(Body::from("x"));
            response.headers_mut().append("x-multi", "a".parse().unwrap());
            response.headers_mut().append("x-multi", "b".parse().unwrap());
            response
        }

        let cache = cache_with(|b| b);
        let mut app = Router::new()
            .route("/multi", get(handler_multi))
            .layer(from_fn_with_state(Arc::clone(&cache), middleware));

        let (_, status) = dispatch(&mut app, get_req("/multi")).await;
        assert_eq!(status, CacheStatus::Miss);

        let (result, status) = dispatch(&mut app, get_req("/multi")).await;
        assert_eq!(status, CacheStatus::Hit);
        assert_eq!(result.headers().get("x-multi").unwrap(), "a,b");
    }
}
