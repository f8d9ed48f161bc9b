use std::{sync::Arc, time::Duration};

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prometheus::{IntCounter, Registry, register_int_counter_with_registry};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{Error, kv::KvStore, metastore::MetaStore};
use crate::{store::DurableStore, tasks::Run};

const SCAN_PATTERN: &str = "usage:*";
const SCAN_PAGE: usize = 100;

/// TTL for counters re-deposited after a failed upsert, wide enough for the
/// next archive pass to retry them
const RETRY_TTL: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct Metrics {
    flushed: IntCounter,
}

impl Metrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            flushed: register_int_counter_with_registry!(
                "usage_archiver_flushed",
                "Counts usage counters flushed to the durable store",
                registry,
            )
            .unwrap(),
        }
    }
}

/// Drains per-minute usage counters from Redis into the durable store.
///
/// Counters carry key and service as strings; the numeric ids the usage
/// table wants are resolved through the metastore's cached metadata.
/// GETDEL makes each observed value archive at-least-once: a failed upsert
/// re-deposits the residual for the next pass.
pub struct UsageArchiver {
    kv: Arc<dyn KvStore>,
    db: Arc<dyn DurableStore>,
    meta: Arc<dyn MetaStore>,
    interval: Duration,
    metrics: Metrics,
}

impl UsageArchiver {
    pub fn new(
        kv: Arc<dyn KvStore>,
        db: Arc<dyn DurableStore>,
        meta: Arc<dyn MetaStore>,
        interval: Duration,
        registry: &Registry,
    ) -> Self {
        Self {
            kv,
            db,
            meta,
            interval,
            metrics: Metrics::new(registry),
        }
    }

    pub async fn archive(&self) -> Result<(), Error> {
        let mut cursor = 0;
        let mut flushed = 0;

        loop {
            let (next, keys) = self.kv.scan_page(cursor, SCAN_PATTERN, SCAN_PAGE).await?;

            for key in keys {
                match self.archive_one(&key).await {
                    Ok(true) => flushed += 1,
                    Ok(false) => {}
                    Err(e) => warn!(key, error = %e, "unable to archive usage counter"),
                }
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        if flushed > 0 {
            self.metrics.flushed.inc_by(flushed);
            debug!(flushed, "archived usage counters");
        }

        Ok(())
    }

    /// Returns whether a row was flushed. Malformed keys are skipped.
    async fn archive_one(&self, key: &str) -> Result<bool, Error> {
        // usage:{key_string}:{service_name}:{minute_unix}
        let parts: Vec<&str> = key.split(':').collect();
        if parts.len() != 4 || parts[0] != "usage" {
            return Ok(false);
        }

        let (key_string, service_name) = (parts[1], parts[2]);
        let Ok(minute) = parts[3].parse::<i64>() else {
            return Ok(false);
        };
        let Some(minute_ts) = DateTime::<Utc>::from_timestamp(minute, 0) else {
            return Ok(false);
        };

        let Some(count) = self.kv.get_del(key).await? else {
            return Ok(false);
        };
        if count <= 0 {
            return Ok(false);
        }

        // Everything past GETDEL must either land durably or go back to Redis
        let upserted: Result<(), Error> = async {
            let key_meta = self.meta.get_key(key_string).await?;
            let service_meta = self.meta.get_service(service_name).await?;

            self.db
                .upsert_minute_usage(key_meta.key_id, service_meta.service_id, count, minute_ts)
                .await
                .map_err(Error::Durable)
        }
        .await;

        if let Err(e) = upserted {
            if let Err(redeposit) = self.kv.set_ex(key, &count.to_string(), RETRY_TTL).await {
                error!(key, count, error = %redeposit, "unable to re-deposit usage counter");
            }
            return Err(e);
        }

        Ok(true)
    }
}

#[async_trait]
impl Run for UsageArchiver {
    async fn run(&self, token: CancellationToken) -> Result<(), anyhow::Error> {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The immediate first tick is pointless right after startup
        interval.tick().await;

        loop {
            select! {
                biased;

                () = token.cancelled() => {
                    // Final drain so counters don't sit out the restart
                    self.archive().await.context("final archive pass failed")?;
                    return Ok(());
                }

                _ = interval.tick() => {
                    if let Err(e) = self.archive().await {
                        warn!(error = %e, "usage archive pass failed");
                    }
                }
            }
        }
    }
}
