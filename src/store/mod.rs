use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, postgres::PgPoolOptions};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("not found")]
    NotFound,
    #[error("database operation failed: {0}")]
    Db(#[from] sqlx::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ApiKeyRecord {
    pub id: i64,
    pub key_string: String,
    pub has_quota: bool,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ServiceRecord {
    pub id: i64,
    pub name: String,
    pub default_quota: i64,
}

/// Authoritative storage for key/service metadata and quota balances.
/// Redis only ever holds cached views of what lives here.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get_api_key(&self, key_string: &str) -> Result<ApiKeyRecord, Error>;
    async fn get_service(&self, name: &str) -> Result<ServiceRecord, Error>;
    async fn get_quota(&self, service_name: &str, key_string: &str) -> Result<i64, Error>;
    /// Additive upsert on (key_id, service_id, minute_ts)
    async fn upsert_minute_usage(
        &self,
        key_id: i64,
        service_id: i64,
        amount: i64,
        minute_ts: DateTime<Utc>,
    ) -> Result<(), Error>;
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DurableStore for PgStore {
    async fn get_api_key(&self, key_string: &str) -> Result<ApiKeyRecord, Error> {
        sqlx::query_as::<_, ApiKeyRecord>(
            "SELECT id, key_string, has_quota, status FROM api_keys WHERE key_string = $1",
        )
        .bind(key_string)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(Error::NotFound)
    }

    async fn get_service(&self, name: &str) -> Result<ServiceRecord, Error> {
        sqlx::query_as::<_, ServiceRecord>(
            "SELECT id, name, default_quota FROM services WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(Error::NotFound)
    }

    async fn get_quota(&self, service_name: &str, key_string: &str) -> Result<i64, Error> {
        sqlx::query_scalar::<_, i64>(
            r"SELECT q.remaining_quota
              FROM quotas q
              JOIN api_keys k ON q.api_key_id = k.id
              JOIN services s ON q.service_id = s.id
              WHERE s.name = $1 AND k.key_string = $2",
        )
        .bind(service_name)
        .bind(key_string)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(Error::NotFound)
    }

    async fn upsert_minute_usage(
        &self,
        key_id: i64,
        service_id: i64,
        amount: i64,
        minute_ts: DateTime<Utc>,
    ) -> Result<(), Error> {
        sqlx::query(
            r"INSERT INTO minute_usage (api_key_id, service_id, consumption_amount, minute_timestamp)
              VALUES ($1, $2, $3, $4)
              ON CONFLICT (api_key_id, service_id, minute_timestamp)
              DO UPDATE SET consumption_amount = minute_usage.consumption_amount + EXCLUDED.consumption_amount",
        )
        .bind(key_id)
        .bind(service_id)
        .bind(amount)
        .bind(minute_ts)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
