use std::time::Duration;

use async_trait::async_trait;
use redis::{AsyncCommands, aio::ConnectionManager};

use super::Error;

/// Redis call budget, separate from the request deadline
pub const OP_TIMEOUT: Duration = Duration::from_secs(2);

/// The slice of Redis the tollgate depends on: plain reads/writes with TTL,
/// deletes, atomic read-and-delete and cursor-driven scans. Lua execution
/// lives behind its own seam in the quota manager.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, Error>;
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), Error>;
    async fn del(&self, key: &str) -> Result<(), Error>;
    async fn get_del(&self, key: &str) -> Result<Option<i64>, Error>;
    async fn scan_page(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), Error>;
}

#[derive(Clone)]
pub struct RedisKv {
    conn: ConnectionManager,
}

impl RedisKv {
    pub const fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    async fn budget<T>(
        fut: impl Future<Output = Result<T, redis::RedisError>> + Send,
    ) -> Result<T, Error> {
        tokio::time::timeout(OP_TIMEOUT, fut)
            .await
            .map_err(|_| Error::KvTimeout)?
            .map_err(Into::into)
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let mut conn = self.conn.clone();
        Self::budget(conn.get::<_, Option<String>>(key)).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        Self::budget(conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))).await
    }

    async fn del(&self, key: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        Self::budget(conn.del::<_, ()>(key)).await
    }

    async fn get_del(&self, key: &str) -> Result<Option<i64>, Error> {
        let mut conn = self.conn.clone();
        Self::budget(async move {
            redis::cmd("GETDEL")
                .arg(key)
                .query_async::<Option<i64>>(&mut conn)
                .await
        })
        .await
    }

    async fn scan_page(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), Error> {
        let mut conn = self.conn.clone();
        Self::budget(async move {
            redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(count)
                .query_async::<(u64, Vec<String>)>(&mut conn)
                .await
        })
        .await
    }
}
