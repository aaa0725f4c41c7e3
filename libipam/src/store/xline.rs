use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, Compare, CompareOp, ConnectOptions, GetOptions, KvClient, Txn, TxnOp};
use log::{debug, info};
use tokio::sync::Mutex;

use super::{CasOutcome, KvStore, StoreError, Version, Versioned};
use crate::config::StoreConfig;

/// Store backed by Xline (or any etcd v3 endpoint).
///
/// The record version is the key's `mod_revision`; creates compare the key's
/// `version` against zero.
pub struct XlineStore {
    kv_api: Arc<Mutex<KvClient>>,
    timeout: Duration,
}

impl XlineStore {
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let opts = if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            ConnectOptions::default().with_user(user.clone(), pass.clone())
        } else {
            ConnectOptions::default()
        };
        let timeout = Duration::from_millis(config.timeout_ms);
        let cli = tokio::time::timeout(
            timeout,
            Client::connect(config.endpoints.clone(), Some(opts)),
        )
        .await
        .map_err(|_| StoreError::Timeout(config.endpoints.join(",")))??;
        info!("connected to xline at {:?}", config.endpoints);

        Ok(Self {
            kv_api: Arc::new(Mutex::new(cli.kv_client())),
            timeout,
        })
    }

    async fn kv(&self) -> tokio::sync::MutexGuard<'_, KvClient> {
        self.kv_api.lock().await
    }

    async fn bounded<T, F>(&self, key: &str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, etcd_client::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(res) => res.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(key.to_string())),
        }
    }
}

#[async_trait]
impl KvStore for XlineStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        let mut kv = self.kv().await;
        let resp = self.bounded(key, kv.get(key, None)).await?;
        Ok(resp.kvs().first().map(|kv| Versioned {
            value: kv.value().to_vec(),
            version: kv.mod_revision(),
        }))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Version,
        value: Option<Vec<u8>>,
    ) -> Result<CasOutcome, StoreError> {
        let cmp = if expected == 0 {
            Compare::version(key, CompareOp::Equal, 0)
        } else {
            Compare::mod_revision(key, CompareOp::Equal, expected)
        };
        let deleting = value.is_none();
        let op = match value {
            Some(value) => TxnOp::put(key, value, None),
            None => TxnOp::delete(key, None),
        };
        let txn = Txn::new().when([cmp]).and_then([op]);

        let mut kv = self.kv().await;
        let resp = self.bounded(key, kv.txn(txn)).await?;
        if !resp.succeeded() {
            debug!("compare-and-swap on {key} lost against revision {expected}");
            return Ok(CasOutcome::Conflict);
        }
        if deleting {
            return Ok(CasOutcome::Swapped(0));
        }
        Ok(CasOutcome::Swapped(
            resp.header().map_or(expected + 1, |h| h.revision()),
        ))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Versioned)>, StoreError> {
        let opts = GetOptions::new().with_prefix();
        let mut kv = self.kv().await;
        let resp = self.bounded(prefix, kv.get(prefix, Some(opts))).await?;
        let mut out = Vec::with_capacity(resp.kvs().len());
        for item in resp.kvs() {
            out.push((
                std::str::from_utf8(item.key())?.to_string(),
                Versioned {
                    value: item.value().to_vec(),
                    version: item.mod_revision(),
                },
            ));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> StoreConfig {
        StoreConfig {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            prefix: "/registry/ipam-test".to_string(),
            ..StoreConfig::default()
        }
    }

    #[tokio::test]
    #[ignore = "requires a running xline/etcd endpoint"]
    async fn test_compare_and_swap_round() {
        let store = XlineStore::connect(&local_config())
            .await
            .expect("failed to connect xline");
        let key = "/registry/ipam-test/cas";

        if let Some(existing) = store.get(key).await.unwrap() {
            store
                .compare_and_swap(key, existing.version, None)
                .await
                .unwrap();
        }

        let CasOutcome::Swapped(v1) = store
            .compare_and_swap(key, 0, Some(b"one".to_vec()))
            .await
            .unwrap()
        else {
            panic!("create should succeed");
        };
        assert_eq!(
            store
                .compare_and_swap(key, 0, Some(b"two".to_vec()))
                .await
                .unwrap(),
            CasOutcome::Conflict
        );
        let CasOutcome::Swapped(v2) = store
            .compare_and_swap(key, v1, Some(b"two".to_vec()))
            .await
            .unwrap()
        else {
            panic!("swap at the read version should succeed");
        };
        assert!(v2 > v1);

        let listed = store.list("/registry/ipam-test/").await.unwrap();
        assert!(listed.iter().any(|(k, v)| k == key && v.value == b"two"));

        store.compare_and_swap(key, v2, None).await.unwrap();
        assert!(store.get(key).await.unwrap().is_none());
    }
}
