use std::{str::FromStr, sync::Arc, time::Duration};

use ahash::RandomState;
use async_trait::async_trait;
use moka::sync::{Cache as MokaCache, CacheBuilder as MokaCacheBuilder};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use tokio::sync::Mutex;
use tracing::warn;

use super::{Error, kv::KvStore};
use crate::store::{DurableStore, Error as StoreError};

/// Key and service metadata live in Redis for an hour,
/// the quota view is shorter because it changes frequently
const META_TTL: Duration = Duration::from_secs(3600);
const QUOTA_TTL: Duration = Duration::from_secs(300);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    #[default]
    Unassigned,
    Assigned,
    Exhausted,
    Revoked,
}

/// Cached metadata for an API key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMetadata {
    pub key_id: i64,
    pub key_string: String,
    pub has_quota: bool,
    pub status: KeyStatus,
}

/// Cached metadata for a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMetadata {
    pub service_id: i64,
    pub service_name: String,
    pub default_quota: i64,
}

/// Read-through cache of key, service and quota metadata.
///
/// A lookup that misses everywhere surfaces as an error, callers map it to
/// 402/401 at their layer.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn get_key(&self, key_string: &str) -> Result<KeyMetadata, Error>;
    async fn get_service(&self, service_name: &str) -> Result<ServiceMetadata, Error>;
    async fn get_quota(&self, service_name: &str, key_string: &str) -> Result<i64, Error>;
    async fn reset_key(&self, key_string: &str) -> Result<(), Error>;
    async fn reset_service(&self, service_name: &str) -> Result<(), Error>;
    async fn reset_quota(&self, service_name: &str, key_string: &str) -> Result<(), Error>;
}

/// MetaStore over Redis with the durable store behind it.
///
/// Cold misses for the same logical key are coalesced: a per-key lock
/// admits one durable load, the waiters re-check the cache after acquiring
/// it and observe the loaded value.
pub struct RedisMetaStore {
    kv: Arc<dyn KvStore>,
    db: Arc<dyn DurableStore>,
    locks: MokaCache<String, Arc<Mutex<()>>, RandomState>,
}

impl RedisMetaStore {
    pub fn new(kv: Arc<dyn KvStore>, db: Arc<dyn DurableStore>) -> Self {
        Self {
            kv,
            db,
            locks: MokaCacheBuilder::new(16384)
                .time_to_idle(Duration::from_secs(60))
                .build_with_hasher(RandomState::default()),
        }
    }

    fn lock_for(&self, logical: &str) -> Arc<Mutex<()>> {
        self.locks
            .get_with_by_ref(logical, || Arc::new(Mutex::new(())))
    }

    async fn cached<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Option<T> {
        let raw = self.kv.get(key).await.ok()??;
        serde_json::from_str(&raw).ok()
    }

    async fn fill(&self, key: &str, value: &impl Serialize, ttl: Duration) {
        match serde_json::to_string(value) {
            Ok(raw) => {
                if let Err(e) = self.kv.set_ex(key, &raw, ttl).await {
                    warn!(key, error = %e, "unable to fill metadata cache");
                }
            }
            Err(e) => warn!(key, error = %e, "unable to encode metadata"),
        }
    }
}

#[async_trait]
impl MetaStore for RedisMetaStore {
    async fn get_key(&self, key_string: &str) -> Result<KeyMetadata, Error> {
        let meta_key = format!("key_meta:{key_string}");

        if let Some(meta) = self.cached(&meta_key).await {
            return Ok(meta);
        }

        let lock = self.lock_for(&format!("key_db:{key_string}"));
        let _guard = lock.lock().await;

        // Another waiter may have filled the cache while we were queued
        if let Some(meta) = self.cached(&meta_key).await {
            return Ok(meta);
        }

        let rec = self.db.get_api_key(key_string).await.map_err(|e| match e {
            StoreError::NotFound => Error::KeyNotFound,
            e => Error::Durable(e),
        })?;

        let meta = KeyMetadata {
            key_id: rec.id,
            key_string: rec.key_string,
            has_quota: rec.has_quota,
            status: KeyStatus::from_str(&rec.status).unwrap_or_default(),
        };

        self.fill(&meta_key, &meta, META_TTL).await;
        Ok(meta)
    }

    async fn get_service(&self, service_name: &str) -> Result<ServiceMetadata, Error> {
        let meta_key = format!("service_meta:{service_name}");

        if let Some(meta) = self.cached(&meta_key).await {
            return Ok(meta);
        }

        let lock = self.lock_for(&format!("service_db:{service_name}"));
        let _guard = lock.lock().await;

        if let Some(meta) = self.cached(&meta_key).await {
            return Ok(meta);
        }

        let rec = self.db.get_service(service_name).await.map_err(|e| match e {
            StoreError::NotFound => Error::ServiceNotFound,
            e => Error::Durable(e),
        })?;

        let meta = ServiceMetadata {
            service_id: rec.id,
            service_name: rec.name,
            default_quota: rec.default_quota,
        };

        self.fill(&meta_key, &meta, META_TTL).await;
        Ok(meta)
    }

    async fn get_quota(&self, service_name: &str, key_string: &str) -> Result<i64, Error> {
        let quota_key = format!("quota:{service_name}:{key_string}");

        if let Some(quota) = self.cached(&quota_key).await {
            return Ok(quota);
        }

        let lock = self.lock_for(&format!("quota_db:{service_name}:{key_string}"));
        let _guard = lock.lock().await;

        if let Some(quota) = self.cached(&quota_key).await {
            return Ok(quota);
        }

        let quota = self
            .db
            .get_quota(service_name, key_string)
            .await
            .map_err(|e| match e {
                StoreError::NotFound => Error::QuotaNotFound,
                e => Error::Durable(e),
            })?;

        self.fill(&quota_key, &quota, QUOTA_TTL).await;
        Ok(quota)
    }

    async fn reset_key(&self, key_string: &str) -> Result<(), Error> {
        self.kv.del(&format!("key_meta:{key_string}")).await
    }

    async fn reset_service(&self, service_name: &str) -> Result<(), Error> {
        self.kv.del(&format!("service_meta:{service_name}")).await
    }

    async fn reset_quota(&self, service_name: &str, key_string: &str) -> Result<(), Error> {
        self.kv.del(&format!("quota:{service_name}:{key_string}")).await
    }
}
