pub mod archiver;
pub mod keyvalue;
pub mod kv;
pub mod metastore;
pub mod postgres;
pub mod quota;

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use http::{StatusCode, header::AUTHORIZATION};
use prometheus::{
    IntCounterVec, Registry, register_int_counter_vec_with_registry,
};
use tracing::{debug, error, warn};

use crate::http::headers::X_API_KEY;

pub use archiver::UsageArchiver;
pub use keyvalue::KeyValueGate;
pub use kv::{KvStore, RedisKv};
pub use metastore::{KeyMetadata, KeyStatus, MetaStore, RedisMetaStore, ServiceMetadata};
pub use postgres::PostgresGate;
pub use quota::{QuotaManager, RedisScripts};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unable to extract tenant key: {0}")]
    ExtractKey(String),
    #[error("invalid key")]
    InvalidKey,
    #[error("api key not found")]
    KeyNotFound,
    #[error("service not found")]
    ServiceNotFound,
    #[error("quota not found")]
    QuotaNotFound,
    #[error("redis operation failed: {0}")]
    Kv(String),
    #[error("redis operation timed out")]
    KvTimeout,
    #[error("durable store failure: {0}")]
    Durable(crate::store::Error),
    #[error("database operation failed: {0}")]
    Sql(#[from] sqlx::Error),
    #[error("unexpected quota script status: {0}")]
    UnknownStatus(String),
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Self::Kv(e.to_string())
    }
}

impl Error {
    /// Whether this error means the tenant failed to authenticate
    /// rather than the infrastructure failing us
    pub const fn is_auth(&self) -> bool {
        matches!(self, Self::InvalidKey | Self::KeyNotFound | Self::QuotaNotFound)
    }
}

/// Quota management seam of the tollgate.
///
/// `reserve` returning `Ok(false)` is a denial, not an error.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Gate: Send + Sync {
    async fn reserve(&self, key: &str, amount: i64) -> Result<bool, Error>;
    async fn refund(&self, key: &str, amount: i64) -> Result<bool, Error>;
}

/// Trait to extract the tenant key from the given HTTP request.
/// An absent credential yields an empty key which then fails reservation.
pub trait KeyExtractor: Clone + Send + Sync + Debug + 'static {
    fn extract<T>(&self, req: &Request<T>) -> Result<String, Error>;
}

/// The configurable extractors the proxy ships with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantKeyExtractor {
    /// `Authorization: Bearer <key>`
    Bearer,
    /// `X-API-KEY: <key>`
    ApiKeyHeader,
    /// `?api_key=<key>`
    ApiKeyQuery,
}

impl KeyExtractor for TenantKeyExtractor {
    fn extract<T>(&self, req: &Request<T>) -> Result<String, Error> {
        match self {
            Self::Bearer => {
                let Some(value) = req.headers().get(AUTHORIZATION) else {
                    return Ok(String::new());
                };

                let value = value
                    .to_str()
                    .map_err(|e| Error::ExtractKey(e.to_string()))?;

                Ok(value
                    .strip_prefix("Bearer ")
                    .map(|x| x.trim().to_string())
                    .unwrap_or_default())
            }

            Self::ApiKeyHeader => {
                let Some(value) = req.headers().get(X_API_KEY) else {
                    return Ok(String::new());
                };

                value
                    .to_str()
                    .map(|x| x.to_string())
                    .map_err(|e| Error::ExtractKey(e.to_string()))
            }

            Self::ApiKeyQuery => {
                let Some(query) = req.uri().query() else {
                    return Ok(String::new());
                };

                Ok(url::form_urlencoded::parse(query.as_bytes())
                    .find(|(k, _)| k == "api_key")
                    .map(|(_, v)| v.into_owned())
                    .unwrap_or_default())
            }
        }
    }
}

#[derive(Clone)]
pub struct Metrics {
    decisions: IntCounterVec,
}

impl Metrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            decisions: register_int_counter_vec_with_registry!(
                "tollgate_decisions",
                "Counts tollgate outcomes",
                &["decision"],
                registry,
            )
            .unwrap(),
        }
    }
}

/// Quota middleware: reserves one unit before forwarding and refunds it
/// when the downstream answers with status >= 400.
///
/// Sits inside the cache middleware, so cache hits never consume quota.
pub struct Tollgate<K: KeyExtractor> {
    gate: Arc<dyn Gate>,
    extractor: K,
    metrics: Metrics,
}

impl<K: KeyExtractor> Tollgate<K> {
    /// Metrics are shared between tollgate instances,
    /// the registry only admits the counters once
    pub fn new(gate: Arc<dyn Gate>, extractor: K, metrics: Metrics) -> Self {
        Self {
            gate,
            extractor,
            metrics,
        }
    }

    pub async fn process_request(&self, request: Request, next: Next) -> Response {
        let key = match self.extractor.extract(&request) {
            Ok(v) => v,
            Err(e) => {
                self.metrics.decisions.with_label_values(&["failed"]).inc();
                return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
            }
        };

        match self.gate.reserve(&key, 1).await {
            Err(e) if e.is_auth() => {
                debug!(error = %e, "tenant key rejected");
                self.metrics.decisions.with_label_values(&["denied"]).inc();
                return (StatusCode::PAYMENT_REQUIRED, "Insufficient balance").into_response();
            }

            Err(e) => {
                // Fail closed: never forward without accounting
                error!(error = %e, "quota reservation failed");
                self.metrics.decisions.with_label_values(&["failed"]).inc();
                return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
            }

            Ok(false) => {
                self.metrics.decisions.with_label_values(&["denied"]).inc();
                return (StatusCode::PAYMENT_REQUIRED, "Insufficient balance").into_response();
            }

            Ok(true) => self.metrics.decisions.with_label_values(&["reserved"]).inc(),
        }

        let response = next.run(request).await;

        // The request has already been processed, refund failures are
        // logged but never surface
        if response.status() >= StatusCode::BAD_REQUEST {
            match self.gate.refund(&key, 1).await {
                Ok(_) => self.metrics.decisions.with_label_values(&["refunded"]).inc(),
                Err(e) => {
                    warn!(error = %e, "quota refund failed");
                    self.metrics
                        .decisions
                        .with_label_values(&["refund_failed"])
                        .inc();
                }
            }
        }

        response
    }
}

pub async fn middleware<K: KeyExtractor>(
    State(tollgate): State<Arc<Tollgate<K>>>,
    request: Request,
    next: Next,
) -> Response {
    tollgate.process_request(request, next).await
}

/// Compare-equal gate for a single internal key, no quota attached
pub struct SecretKeyGate {
    secret: String,
}

impl SecretKeyGate {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

#[async_trait]
impl Gate for SecretKeyGate {
    async fn reserve(&self, key: &str, _amount: i64) -> Result<bool, Error> {
        if key != self.secret {
            return Err(Error::InvalidKey);
        }
        Ok(true)
    }

    async fn refund(&self, key: &str, _amount: i64) -> Result<bool, Error> {
        if key != self.secret {
            return Err(Error::InvalidKey);
        }
        Ok(true)
    }
}
