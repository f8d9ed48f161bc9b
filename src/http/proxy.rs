use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    extract::{Request, State},
    response::{IntoResponse, Response},
};
use http::{HeaderMap, StatusCode, Uri, header::AUTHORIZATION, header::HOST};
use rand::Rng;
use tracing::warn;
use url::Url;

use super::{Error, body::buffer_body, headers::strip_connection_headers};
use crate::http::Client;

/// Substitutes the tenant credential with a key drawn from the upstream pool.
/// A random pool member is picked per request.
#[derive(Debug, Clone)]
pub enum KeyRewrite {
    /// `Authorization: Bearer <key>`
    Bearer(Vec<String>),
    /// A named header, e.g. `X-API-KEY: <key>`
    Header(http::HeaderName, Vec<String>),
}

impl KeyRewrite {
    fn pick(keys: &[String]) -> Option<&String> {
        if keys.is_empty() {
            return None;
        }
        Some(&keys[rand::thread_rng().gen_range(0..keys.len())])
    }

    pub fn apply(&self, headers: &mut HeaderMap) {
        match self {
            Self::Bearer(keys) => {
                let Some(key) = Self::pick(keys) else { return };
                if let Ok(v) = format!("Bearer {key}").parse() {
                    headers.insert(AUTHORIZATION, v);
                }
            }
            Self::Header(name, keys) => {
                let Some(key) = Self::pick(keys) else { return };
                if let Ok(v) = key.parse() {
                    headers.insert(name.clone(), v);
                }
            }
        }
    }
}

/// Forwards requests to a single upstream, stripping the route prefix and
/// rewriting the credential. The response body is fully materialised.
pub struct UpstreamProxy {
    base: Url,
    prefix: String,
    rewrite: Option<KeyRewrite>,
    client: Arc<dyn Client>,
    max_body_size: usize,
    body_timeout: Duration,
}

impl UpstreamProxy {
    pub fn new(
        base: Url,
        prefix: &str,
        rewrite: Option<KeyRewrite>,
        client: Arc<dyn Client>,
        max_body_size: usize,
        body_timeout: Duration,
    ) -> Self {
        Self {
            base,
            prefix: prefix.into(),
            rewrite,
            client,
            max_body_size,
            body_timeout,
        }
    }

    fn target_url(&self, uri: &Uri) -> Url {
        let path = uri.path();
        let rest = path.strip_prefix(self.prefix.as_str()).unwrap_or(path);

        let mut url = self.base.clone();
        let base_path = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{base_path}{rest}"));
        url.set_query(uri.query());
        url
    }

    pub async fn handle(&self, request: Request) -> Result<Response, Error> {
        let (mut parts, body) = request.into_parts();
        let url = self.target_url(&parts.uri);

        // The inbound Host is meaningless upstream, the client derives it from the URL
        strip_connection_headers(&mut parts.headers);
        parts.headers.remove(HOST);

        if let Some(rewrite) = &self.rewrite {
            rewrite.apply(&mut parts.headers);
        }

        let body = buffer_body(body, self.max_body_size, self.body_timeout).await?;

        let mut req = reqwest::Request::new(parts.method.clone(), url);
        *req.headers_mut() = parts.headers;
        *req.body_mut() = Some(reqwest::Body::from(body));

        let resp = self.client.execute(req).await?;

        let status = resp.status();
        let mut headers = resp.headers().clone();
        let body = resp.bytes().await?;

        // The body is sized now, chunked framing no longer applies
        headers.remove(http::header::TRANSFER_ENCODING);

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

pub async fn handler(State(proxy): State<Arc<UpstreamProxy>>, request: Request) -> Response {
    proxy.handle(request).await.unwrap_or_else(|e| {
        warn!(error = %e, "upstream request failed");
        (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
    })
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::{
        hname, hval,
        http::client::MockClient,
    };

    fn proxy(rewrite: Option<KeyRewrite>, client: MockClient) -> UpstreamProxy {
        UpstreamProxy::new(
            Url::parse("https://upstream.example").unwrap(),
            "/reader",
            rewrite,
            Arc::new(client),
            1024 * 1024,
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_target_url() {
        let p = proxy(None, MockClient::new());

        let uri = Uri::from_static("/reader/https://example.com?foo=bar");
        assert_eq!(
            p.target_url(&uri).as_str(),
            "https://upstream.example/https://example.com?foo=bar"
        );

        // Unknown prefix passes through unchanged
        let uri = Uri::from_static("/other/path");
        assert_eq!(p.target_url(&uri).as_str(), "https://upstream.example/other/path");
    }

    #[test]
    fn test_key_rewrite() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, hval!("Bearer tenant-key"));

        KeyRewrite::Bearer(vec!["pool-key".into()]).apply(&mut headers);
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer pool-key");

        KeyRewrite::Header(hname!("x-api-key"), vec!["pool-key-2".into()]).apply(&mut headers);
        assert_eq!(headers.get("x-api-key").unwrap(), "pool-key-2");

        // An empty pool leaves headers alone
        KeyRewrite::Bearer(vec![]).apply(&mut headers);
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer pool-key");
    }

    #[tokio::test]
    async fn test_handle_rewrites_and_materialises() {
        let mut client = MockClient::new();
        client
            .expect_execute()
            .withf(|req| {
                req.url().as_str() == "https://upstream.example/https://example.com"
                    && req.headers().get(AUTHORIZATION).unwrap() == "Bearer pool-key"
            })
            .returning(|_| {
                Ok(reqwest::Response::from(
                    http::Response::builder()
                        .status(200)
                        .body(reqwest::Body::from("hello"))
                        .unwrap(),
                ))
            });

        let p = proxy(Some(KeyRewrite::Bearer(vec!["pool-key".into()])), client);

        let request = Request::builder()
            .uri("/reader/https://example.com")
            .header(AUTHORIZATION, "Bearer tenant-key")
            .body(Body::empty())
            .unwrap();

        let response = p.handle(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), b"hello");
    }
}
