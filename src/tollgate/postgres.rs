use async_trait::async_trait;
use sqlx::PgPool;

use super::{Error, Gate};

/// Gate running directly against the durable quota table.
/// Both operations are single atomic statements.
pub struct PostgresGate {
    pool: PgPool,
    service_name: String,
}

impl PostgresGate {
    pub fn new(pool: PgPool, service_name: &str) -> Self {
        Self {
            pool,
            service_name: service_name.into(),
        }
    }
}

#[async_trait]
impl Gate for PostgresGate {
    async fn reserve(&self, key: &str, amount: i64) -> Result<bool, Error> {
        // No row updated means insufficient quota, not an error
        let row: Option<(i64,)> = sqlx::query_as(
            r"UPDATE quotas q
              SET remaining_quota = q.remaining_quota - $3, updated_at = now()
              FROM api_keys k, services s
              WHERE q.api_key_id = k.id AND q.service_id = s.id
                AND k.key_string = $1 AND s.name = $2
                AND q.remaining_quota >= $3
              RETURNING q.remaining_quota",
        )
        .bind(key)
        .bind(&self.service_name)
        .bind(amount)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    async fn refund(&self, key: &str, amount: i64) -> Result<bool, Error> {
        let row: Option<(i64,)> = sqlx::query_as(
            r"UPDATE quotas q
              SET remaining_quota = q.remaining_quota + $3, updated_at = now()
              FROM api_keys k, services s
              WHERE q.api_key_id = k.id AND q.service_id = s.id
                AND k.key_string = $1 AND s.name = $2
              RETURNING q.remaining_quota",
        )
        .bind(key)
        .bind(&self.service_name)
        .bind(amount)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }
}
