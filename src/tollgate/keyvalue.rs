use std::sync::Arc;

use async_trait::async_trait;

use super::{
    Error, Gate,
    metastore::{KeyStatus, MetaStore},
    quota::QuotaManager,
};

/// Redis-backed gate: key metadata through the metastore,
/// balances through the quota manager.
pub struct KeyValueGate {
    meta: Arc<dyn MetaStore>,
    quota: QuotaManager,
}

impl KeyValueGate {
    pub fn new(meta: Arc<dyn MetaStore>, quota: QuotaManager) -> Self {
        Self { meta, quota }
    }
}

#[async_trait]
impl Gate for KeyValueGate {
    async fn reserve(&self, key: &str, amount: i64) -> Result<bool, Error> {
        let key_meta = self.meta.get_key(key).await?;

        // Revoked keys are refused before any quota state is touched
        if key_meta.status == KeyStatus::Revoked {
            return Ok(false);
        }

        self.quota.reserve(&key_meta, amount).await
    }

    async fn refund(&self, key: &str, amount: i64) -> Result<bool, Error> {
        let key_meta = self.meta.get_key(key).await?;
        self.quota.refund(&key_meta, amount).await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::tollgate::{
        metastore::{KeyMetadata, MockMetaStore, ServiceMetadata},
        quota::{MockScriptExecutor, ScriptReply},
    };

    fn meta_with_key(status: KeyStatus) -> MockMetaStore {
        let mut meta = MockMetaStore::new();
        meta.expect_get_service().returning(|name| {
            Ok(ServiceMetadata {
                service_id: 3,
                service_name: name.into(),
                default_quota: 1000,
            })
        });
        meta.expect_get_key().withf(|key| key == "k1").returning(move |_| {
            Ok(KeyMetadata {
                key_id: 7,
                key_string: "k1".into(),
                has_quota: true,
                status,
            })
        });
        meta
    }

    async fn gate(meta: MockMetaStore, scripts: MockScriptExecutor) -> KeyValueGate {
        let meta = Arc::new(meta);
        let quota = QuotaManager::new(Arc::new(scripts), meta.clone(), "reader")
            .await
            .unwrap();
        KeyValueGate::new(meta, quota)
    }

    #[tokio::test]
    async fn test_reserve_flows_through_quota() {
        let mut scripts = MockScriptExecutor::new();
        scripts.expect_invoke().times(1).returning(|_, _, _| {
            Ok(ScriptReply {
                remaining: 4,
                status: "OK".into(),
            })
        });

        let gate = gate(meta_with_key(KeyStatus::Assigned), scripts).await;
        assert!(gate.reserve("k1", 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_revoked_key_denied_without_scripts() {
        let mut scripts = MockScriptExecutor::new();
        scripts.expect_invoke().times(0);

        let gate = gate(meta_with_key(KeyStatus::Revoked), scripts).await;
        assert!(!gate.reserve("k1", 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_key_surfaces() {
        let mut meta = MockMetaStore::new();
        meta.expect_get_service().returning(|name| {
            Ok(ServiceMetadata {
                service_id: 3,
                service_name: name.into(),
                default_quota: 1000,
            })
        });
        meta.expect_get_key().returning(|_| Err(Error::KeyNotFound));

        let gate = gate(meta, MockScriptExecutor::new()).await;
        assert!(matches!(gate.reserve("k1", 1).await, Err(Error::KeyNotFound)));
    }
}
