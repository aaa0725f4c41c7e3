use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{CasOutcome, KvStore, StoreError, Version, Versioned};

/// In-process store with an etcd-like global revision counter.
///
/// Every successful write takes the next revision, so versions of a key
/// strictly increase. Conflicts and timeouts can be injected to exercise the
/// retry paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    revision: Version,
    data: BTreeMap<String, Versioned>,
    injected_conflicts: usize,
    injected_timeouts: usize,
    cas_calls: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` compare-and-swap calls report a conflict without writing.
    pub async fn inject_conflicts(&self, n: usize) {
        self.inner.lock().await.injected_conflicts = n;
    }

    /// The next `n` compare-and-swap calls time out without writing.
    pub async fn inject_timeouts(&self, n: usize) {
        self.inner.lock().await.injected_timeouts = n;
    }

    pub async fn cas_calls(&self) -> usize {
        self.inner.lock().await.cas_calls
    }

    pub async fn revision(&self) -> Version {
        self.inner.lock().await.revision
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        Ok(self.inner.lock().await.data.get(key).cloned())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Version,
        value: Option<Vec<u8>>,
    ) -> Result<CasOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.cas_calls += 1;

        if inner.injected_timeouts > 0 {
            inner.injected_timeouts -= 1;
            return Err(StoreError::Timeout(key.to_string()));
        }
        if inner.injected_conflicts > 0 {
            inner.injected_conflicts -= 1;
            return Ok(CasOutcome::Conflict);
        }

        let current = inner.data.get(key).map_or(0, |kv| kv.version);
        if current != expected {
            return Ok(CasOutcome::Conflict);
        }

        match value {
            Some(value) => {
                inner.revision += 1;
                let version = inner.revision;
                inner
                    .data
                    .insert(key.to_string(), Versioned { value, version });
                Ok(CasOutcome::Swapped(version))
            }
            None => {
                if inner.data.remove(key).is_some() {
                    inner.revision += 1;
                }
                Ok(CasOutcome::Swapped(0))
            }
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Versioned)>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
