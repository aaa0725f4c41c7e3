//! Versioned key-value store seam.
//!
//! Every coordinated mutation in the allocator is a compare-and-swap against
//! the version returned by a previous read. Version `0` means "absent", so a
//! swap expecting `0` only succeeds when it creates the key.

use async_trait::async_trait;
use log::warn;
use serde::{Serialize, de::DeserializeOwned};

use crate::error::Result;

pub mod memory;
pub mod xline;

pub use memory::MemoryStore;
pub use xline::XlineStore;

pub type Version = i64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: Vec<u8>,
    pub version: Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write landed; carries the new version (`0` after a delete).
    Swapped(Version),
    /// The key moved on since `expected` was read.
    Conflict,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store operation on {0} timed out")]
    Timeout(String),
    #[error(transparent)]
    Xline(#[from] Box<etcd_client::Error>),
    #[error(transparent)]
    Utf8(#[from] std::str::Utf8Error),
}

impl From<etcd_client::Error> for StoreError {
    fn from(e: etcd_client::Error) -> Self {
        StoreError::Xline(Box::new(e))
    }
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> std::result::Result<Option<Versioned>, StoreError>;

    /// Writes `value` (or deletes the key when `None`) only if the key is
    /// still at `expected`.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Version,
        value: Option<Vec<u8>>,
    ) -> std::result::Result<CasOutcome, StoreError>;

    /// All keys under `prefix`, in key order.
    async fn list(&self, prefix: &str) -> std::result::Result<Vec<(String, Versioned)>, StoreError>;
}

pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> Result<Option<(T, Version)>> {
    match store.get(key).await? {
        Some(kv) => Ok(Some((serde_json::from_slice(&kv.value)?, kv.version))),
        None => Ok(None),
    }
}

pub async fn list_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    prefix: &str,
) -> Result<Vec<(String, T, Version)>> {
    let mut out = Vec::new();
    for (key, kv) in store.list(prefix).await? {
        let value: T = serde_json::from_slice(&kv.value)?;
        out.push((key, value, kv.version));
    }
    Ok(out)
}

/// One compare-and-swap attempt. `Ok(None)` means the caller lost the race
/// (or the store timed out) and should re-read before trying again.
pub async fn swap_json<T: Serialize>(
    store: &dyn KvStore,
    key: &str,
    expected: Version,
    value: Option<&T>,
) -> Result<Option<Version>> {
    let bytes = value.map(serde_json::to_vec).transpose()?;
    match store.compare_and_swap(key, expected, bytes).await {
        Ok(CasOutcome::Swapped(version)) => Ok(Some(version)),
        Ok(CasOutcome::Conflict) => Ok(None),
        Err(StoreError::Timeout(key)) => {
            warn!("compare-and-swap on {key} timed out, treating as contention");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}
