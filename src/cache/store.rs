use std::{
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};

use ahash::RandomState;
use async_trait::async_trait;
use bytes::Bytes;
use moka::{
    Expiry,
    sync::{Cache as MokaCache, CacheBuilder as MokaCacheBuilder},
};
use redis::{AsyncCommands, aio::ConnectionManager};
use tracing::warn;

use super::key_as_string;

/// Redis call budget, separate from the request deadline so that a slow
/// Redis cannot starve the hot path
const OP_TIMEOUT: Duration = Duration::from_secs(2);

/// Entries in the in-process tier
const LOCAL_ENTRIES: u64 = 1000;
/// Idle TTL of the in-process tier. Writes bypass it, so this bounds how
/// long a process can serve a locally stale record.
const LOCAL_TTI: Duration = Duration::from_secs(600);

/// Storage for encoded cache records keyed by fingerprint.
///
/// `set` is best-effort: failures are logged and never surfaced.
/// `release` is idempotent, removing a missing entry is not an error.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: u64) -> Option<Bytes>;
    async fn set(&self, key: u64, value: Bytes, expires_at: SystemTime);
    async fn release(&self, key: u64);
}

#[derive(Clone)]
struct Entry {
    value: Bytes,
    expires: Instant,
}

/// Extracts TTL from the Entry
struct Expirer;

impl Expiry<u64, Arc<Entry>> for Expirer {
    fn expire_after_create(
        &self,
        _key: &u64,
        value: &Arc<Entry>,
        created_at: Instant,
    ) -> Option<Duration> {
        Some(value.expires.saturating_duration_since(created_at))
    }
}

/// Single-tier in-process store with per-entry expiration
pub struct MemoryStore {
    store: MokaCache<u64, Arc<Entry>, RandomState>,
}

impl MemoryStore {
    pub fn new(capacity: u64) -> Self {
        Self {
            store: MokaCacheBuilder::new(capacity)
                .expire_after(Expirer)
                .build_with_hasher(RandomState::default()),
        }
    }

    #[cfg(test)]
    pub fn housekeep(&self) {
        self.store.run_pending_tasks();
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: u64) -> Option<Bytes> {
        self.store.get(&key).map(|e| e.value.clone())
    }

    async fn set(&self, key: u64, value: Bytes, expires_at: SystemTime) {
        let Ok(ttl) = expires_at.duration_since(SystemTime::now()) else {
            return;
        };

        self.store.insert(
            key,
            Arc::new(Entry {
                value,
                expires: Instant::now() + ttl,
            }),
        );
    }

    async fn release(&self, key: u64) {
        self.store.invalidate(&key);
    }
}

/// Two-tier store: a small in-process LFU in front of Redis.
///
/// Reads fill the local tier, writes bypass it and rely on its short idle
/// TTL for convergence. There is no read-your-writes guarantee from a
/// different process.
pub struct RedisStore {
    conn: ConnectionManager,
    local: MokaCache<u64, Bytes, RandomState>,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            local: MokaCacheBuilder::new(LOCAL_ENTRIES)
                .time_to_idle(LOCAL_TTI)
                .build_with_hasher(RandomState::default()),
        }
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: u64) -> Option<Bytes> {
        if let Some(v) = self.local.get(&key) {
            return Some(v);
        }

        let mut conn = self.conn.clone();
        let res = tokio::time::timeout(
            OP_TIMEOUT,
            conn.get::<_, Option<Vec<u8>>>(key_as_string(key)),
        )
        .await;

        match res {
            Ok(Ok(Some(v))) => {
                let v = Bytes::from(v);
                self.local.insert(key, v.clone());
                Some(v)
            }
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                warn!(key, error = %e, "cache get failed");
                None
            }
            Err(_) => {
                warn!(key, "cache get timed out");
                None
            }
        }
    }

    async fn set(&self, key: u64, value: Bytes, expires_at: SystemTime) {
        let Ok(ttl) = expires_at.duration_since(SystemTime::now()) else {
            return;
        };

        let mut conn = self.conn.clone();
        let res = tokio::time::timeout(
            OP_TIMEOUT,
            conn.set_ex::<_, _, ()>(key_as_string(key), value.as_ref(), ttl.as_secs().max(1)),
        )
        .await;

        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(key, error = %e, "cache set failed"),
            Err(_) => warn!(key, "cache set timed out"),
        }
    }

    async fn release(&self, key: u64) {
        self.local.invalidate(&key);

        let mut conn = self.conn.clone();
        let res = tokio::time::timeout(OP_TIMEOUT, conn.del::<_, ()>(key_as_string(key))).await;

        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(key, error = %e, "cache release failed"),
            Err(_) => warn!(key, "cache release timed out"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use tokio::time::sleep;

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStore::new(100);

        // Missing key
        assert_eq!(store.get(1).await, None);

        // Set and read back
        let expires = SystemTime::now() + Duration::from_secs(60);
        store.set(1, Bytes::from_static(b"foo"), expires).await;
        assert_eq!(store.get(1).await, Some(Bytes::from_static(b"foo")));

        // Release is idempotent
        store.release(1).await;
        store.release(1).await;
        store.housekeep();
        assert_eq!(store.get(1).await, None);

        // Entries already expired at write time are not stored
        store
            .set(2, Bytes::from_static(b"bar"), SystemTime::now() - Duration::from_secs(1))
            .await;
        assert_eq!(store.get(2).await, None);
    }

    #[tokio::test]
    async fn test_memory_store_expiry() {
        let store = MemoryStore::new(100);

        let expires = SystemTime::now() + Duration::from_millis(50);
        store.set(1, Bytes::from_static(b"foo"), expires).await;
        assert!(store.get(1).await.is_some());

        sleep(Duration::from_millis(100)).await;
        store.housekeep();
        assert_eq!(store.get(1).await, None);
    }
}
