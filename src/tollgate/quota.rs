use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use redis::{Script, aio::ConnectionManager};

use super::{
    Error,
    kv::OP_TIMEOUT,
    metastore::{KeyMetadata, MetaStore, ServiceMetadata},
};

const STATUS_OK: &str = "OK";
const STATUS_EXHAUSTED: &str = "EXHAUSTED";
const STATUS_LOAD_REQUIRED: &str = "LOAD_REQUIRED";
const STATUS_NO_QUOTA: &str = "NO_QUOTA";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaScript {
    Reserve,
    SetAndReserve,
    Refund,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptReply {
    pub remaining: i64,
    pub status: String,
}

/// Seam over atomic script execution so the reservation protocol can be
/// exercised without a Redis server
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    async fn invoke(
        &self,
        script: QuotaScript,
        keys: Vec<String>,
        args: Vec<String>,
    ) -> Result<ScriptReply, Error>;
}

/// The embedded Lua scripts running against Redis.
/// EVALSHA with automatic script loading is handled by the client.
pub struct RedisScripts {
    conn: ConnectionManager,
    reserve: Script,
    set_and_reserve: Script,
    refund: Script,
}

impl RedisScripts {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            reserve: Script::new(include_str!("scripts/reserve.lua")),
            set_and_reserve: Script::new(include_str!("scripts/set_and_reserve.lua")),
            refund: Script::new(include_str!("scripts/refund.lua")),
        }
    }
}

#[async_trait]
impl ScriptExecutor for RedisScripts {
    async fn invoke(
        &self,
        script: QuotaScript,
        keys: Vec<String>,
        args: Vec<String>,
    ) -> Result<ScriptReply, Error> {
        let script = match script {
            QuotaScript::Reserve => &self.reserve,
            QuotaScript::SetAndReserve => &self.set_and_reserve,
            QuotaScript::Refund => &self.refund,
        };

        let mut invocation = script.prepare_invoke();
        for key in &keys {
            invocation.key(key.as_str());
        }
        for arg in &args {
            invocation.arg(arg.as_str());
        }

        let mut conn = self.conn.clone();
        let (remaining, status): (i64, String) =
            tokio::time::timeout(OP_TIMEOUT, invocation.invoke_async(&mut conn))
                .await
                .map_err(|_| Error::KvTimeout)??;

        Ok(ScriptReply { remaining, status })
    }
}

/// Redis-resident quota accounting for a single service.
///
/// The hot path is a single atomic script; a cold cell is hydrated from
/// the durable balance through the metastore and seeded atomically, so the
/// invariant `remaining >= 0` holds under any interleaving.
pub struct QuotaManager {
    service: ServiceMetadata,
    meta: Arc<dyn MetaStore>,
    scripts: Arc<dyn ScriptExecutor>,
}

impl QuotaManager {
    pub async fn new(
        scripts: Arc<dyn ScriptExecutor>,
        meta: Arc<dyn MetaStore>,
        service_name: &str,
    ) -> Result<Self, Error> {
        let service = meta.get_service(service_name).await?;

        Ok(Self {
            service,
            meta,
            scripts,
        })
    }

    pub fn service(&self) -> &ServiceMetadata {
        &self.service
    }

    /// Keys are constructed client-side for Redis clustering compatibility
    fn keys(&self, key_string: &str, now_unix: i64) -> Vec<String> {
        let minute = now_unix - now_unix % 60;

        vec![
            format!("quota:{key_string}"),
            format!("service_{}", self.service.service_name),
            format!(
                "usage:{}:{}:{}",
                key_string, self.service.service_name, minute
            ),
        ]
    }

    pub async fn reserve(&self, key_meta: &KeyMetadata, amount: i64) -> Result<bool, Error> {
        let now = Utc::now().timestamp();

        let reply = self
            .scripts
            .invoke(
                QuotaScript::Reserve,
                self.keys(&key_meta.key_string, now),
                vec![
                    key_meta.has_quota.to_string(),
                    amount.to_string(),
                    now.to_string(),
                ],
            )
            .await?;

        match reply.status.as_str() {
            STATUS_LOAD_REQUIRED => self.set_and_reserve(key_meta, amount).await,
            STATUS_EXHAUSTED => Ok(false), // not an error, just insufficient quota
            STATUS_OK => Ok(true),
            other => Err(Error::UnknownStatus(other.into())),
        }
    }

    /// Loads the durable balance (single-flight guarded by the metastore)
    /// and seeds the cold cell atomically
    async fn set_and_reserve(&self, key_meta: &KeyMetadata, amount: i64) -> Result<bool, Error> {
        let initial = self
            .meta
            .get_quota(&self.service.service_name, &key_meta.key_string)
            .await?;

        let now = Utc::now().timestamp();

        let reply = self
            .scripts
            .invoke(
                QuotaScript::SetAndReserve,
                self.keys(&key_meta.key_string, now),
                vec![initial.to_string(), amount.to_string(), now.to_string()],
            )
            .await?;

        match reply.status.as_str() {
            STATUS_EXHAUSTED => Ok(false),
            STATUS_OK => Ok(true),
            other => Err(Error::UnknownStatus(other.into())),
        }
    }

    pub async fn refund(&self, key_meta: &KeyMetadata, amount: i64) -> Result<bool, Error> {
        // Unlimited keys have nothing to refund
        if !key_meta.has_quota {
            return Ok(true);
        }

        let now = Utc::now().timestamp();
        let minute = now - now % 60;

        let keys = vec![
            format!("quota:{}", key_meta.key_string),
            format!(
                "usage:{}:{}:{}",
                key_meta.key_string, self.service.service_name, minute
            ),
        ];

        let args = vec![
            format!("service_{}", self.service.service_name),
            amount.to_string(),
            now.to_string(),
        ];

        let reply = self.scripts.invoke(QuotaScript::Refund, keys, args).await?;

        match reply.status.as_str() {
            // No cell in Redis means nothing to give back
            STATUS_NO_QUOTA => Ok(true),
            STATUS_OK => Ok(true),
            other => Err(Error::UnknownStatus(other.into())),
        }
    }
}
