use std::net::IpAddr;
use std::sync::Arc;

use ipnetwork::IpNetwork;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::block::BlockAllocator;
use crate::error::{IpamError, Result};
use crate::ip::{self, MAX_BLOCK_HOST_BITS};
use crate::keys::Keys;
use crate::retry::RetryPolicy;
use crate::store::{KvStore, Version, get_json, list_json, swap_json};

pub type PoolId = IpNetwork;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pool {
    pub cidr: IpNetwork,
    pub enabled: bool,
    /// Prefix length of the blocks this pool is carved into.
    pub block_size: u8,
}

impl Pool {
    pub fn id(&self) -> PoolId {
        self.cidr
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        self.cidr.contains(addr)
    }

    pub fn overlaps(&self, other: &IpNetwork) -> bool {
        ip::overlaps(&self.cidr, other)
    }

    pub fn block_capacity(&self) -> usize {
        1usize << (ip::max_prefix(&self.cidr) - self.block_size)
    }
}

/// Recognized pool options; anything else is rejected at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolOptions {
    #[serde(default)]
    pub block_size: Option<u8>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            block_size: None,
            enabled: true,
        }
    }
}

impl PoolOptions {
    pub fn with_block_size(mut self, block_size: u8) -> Self {
        self.block_size = Some(block_size);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Default block prefix lengths per address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSizes {
    pub v4: u8,
    pub v6: u8,
}

impl Default for BlockSizes {
    fn default() -> Self {
        Self { v4: 26, v6: 122 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PoolTable {
    pools: Vec<Pool>,
}

/// Pools live in one versioned table so overlap checks and insertion order
/// are settled by a single compare-and-swap.
pub struct PoolStore {
    store: Arc<dyn KvStore>,
    keys: Keys,
    retry: RetryPolicy,
    block_sizes: BlockSizes,
    blocks: Arc<BlockAllocator>,
}

impl PoolStore {
    pub fn new(
        store: Arc<dyn KvStore>,
        keys: Keys,
        retry: RetryPolicy,
        block_sizes: BlockSizes,
        blocks: Arc<BlockAllocator>,
    ) -> Self {
        Self {
            store,
            keys,
            retry,
            block_sizes,
            blocks,
        }
    }

    async fn table(&self) -> Result<(PoolTable, Version)> {
        Ok(get_json(self.store.as_ref(), &self.keys.pools())
            .await?
            .unwrap_or_default())
    }

    /// Applies `edit` to the pool table under compare-and-swap, retrying with
    /// backoff. `edit` returns `Ok(None)` when there is nothing to write.
    async fn update<T, F>(&self, what: &str, mut edit: F) -> Result<T>
    where
        F: FnMut(&mut PoolTable) -> Result<Option<T>>,
        T: Default,
    {
        let key = self.keys.pools();
        let mut backoff = self.retry.backoff();
        for attempt in 0..self.retry.max_attempts {
            let (mut table, version) = self.table().await?;
            let Some(out) = edit(&mut table)? else {
                return Ok(T::default());
            };
            if swap_json(self.store.as_ref(), &key, version, Some(&table))
                .await?
                .is_some()
            {
                return Ok(out);
            }
            warn!("pool table changed while trying to {what}, retrying (attempt {})", attempt + 1);
            backoff.wait().await;
        }
        Err(IpamError::Conflict(format!(
            "pool table kept changing while trying to {what}"
        )))
    }

    fn validate(&self, cidr: IpNetwork, options: &PoolOptions) -> Result<Pool> {
        if !ip::is_canonical(&cidr) {
            return Err(IpamError::InvalidPool(format!(
                "{cidr} has host bits set, the network address is {}",
                cidr.network()
            )));
        }
        let max = ip::max_prefix(&cidr);
        let block_size = match options.block_size {
            Some(size) => size,
            // A pool smaller than the default block is a single block.
            None if cidr.is_ipv4() => self.block_sizes.v4.max(cidr.prefix()),
            None => self.block_sizes.v6.max(cidr.prefix()),
        };
        if block_size < cidr.prefix() || block_size > max {
            return Err(IpamError::InvalidPool(format!(
                "block size /{block_size} does not fit in pool {cidr}"
            )));
        }
        if max - block_size > MAX_BLOCK_HOST_BITS {
            return Err(IpamError::InvalidPool(format!(
                "block size /{block_size} is too large, blocks hold at most {} addresses",
                1u32 << MAX_BLOCK_HOST_BITS
            )));
        }
        Ok(Pool {
            cidr,
            enabled: options.enabled,
            block_size,
        })
    }

    /// Adds a pool; fails with `Conflict` if it overlaps an existing one.
    pub async fn add_pool(&self, cidr: IpNetwork, options: PoolOptions) -> Result<PoolId> {
        let pool = self.validate(cidr, &options)?;
        self.update("add pool", |table| {
            if let Some(existing) = table.pools.iter().find(|p| p.overlaps(&cidr)) {
                return Err(IpamError::Conflict(format!(
                    "pool {cidr} overlaps existing pool {}",
                    existing.cidr
                )));
            }
            table.pools.push(pool.clone());
            Ok(Some(()))
        })
        .await?;
        info!(
            "added pool {cidr} (blocks /{}, enabled: {})",
            pool.block_size, pool.enabled
        );
        Ok(cidr)
    }

    /// Removes a pool and its (empty) blocks; fails with `InUse` while any
    /// address is still allocated from it.
    ///
    /// The pool is disabled before anything is inspected, so an allocation
    /// racing with the removal either lands before the checks (and is seen
    /// by them) or observes the disabled pool and backs out.
    pub async fn remove_pool(&self, id: PoolId) -> Result<()> {
        let pool = self
            .get_pool(id)
            .await?
            .ok_or_else(|| IpamError::NotFound(format!("pool {id}")))?;
        if pool.enabled {
            self.set_pool_enabled(id, false).await?;
        }

        if let Err(e) = self.clear_pool(&pool).await {
            if pool.enabled {
                if let Err(restore) = self.set_pool_enabled(id, true).await {
                    warn!("failed to re-enable pool {id} after aborted removal: {restore}");
                }
            }
            return Err(e);
        }

        self.update("remove pool", |table| {
            let before = table.pools.len();
            table.pools.retain(|p| p.cidr != id);
            Ok((table.pools.len() != before).then_some(()))
        })
        .await?;
        info!("removed pool {id}");
        Ok(())
    }

    async fn clear_pool(&self, pool: &Pool) -> Result<()> {
        let id = pool.cidr;
        let allocations: Vec<(String, serde_json::Value, Version)> =
            list_json(self.store.as_ref(), &self.keys.allocations(&id)).await?;
        if !allocations.is_empty() {
            return Err(IpamError::InUse(format!(
                "pool {id} ({} allocations)",
                allocations.len()
            )));
        }
        for (block, _) in self.blocks.list_blocks(pool).await? {
            if !self.blocks.delete_block_if_empty(&id, block.cidr).await? {
                return Err(IpamError::InUse(format!(
                    "pool {id} (block {} has allocations)",
                    block.cidr
                )));
            }
        }
        Ok(())
    }

    pub async fn set_pool_enabled(&self, id: PoolId, enabled: bool) -> Result<()> {
        self.update("toggle pool", |table| {
            let pool = table
                .pools
                .iter_mut()
                .find(|p| p.cidr == id)
                .ok_or_else(|| IpamError::NotFound(format!("pool {id}")))?;
            if pool.enabled == enabled {
                return Ok(None);
            }
            pool.enabled = enabled;
            Ok(Some(()))
        })
        .await?;
        info!("pool {id} enabled: {enabled}");
        Ok(())
    }

    /// All pools, in the order they were added.
    pub async fn list_pools(&self) -> Result<Vec<Pool>> {
        Ok(self.table().await?.0.pools)
    }

    pub async fn get_pool(&self, id: PoolId) -> Result<Option<Pool>> {
        Ok(self
            .list_pools()
            .await?
            .into_iter()
            .find(|p| p.cidr == id))
    }

    /// The pool holding `addr`.
    pub async fn resolve_address(&self, addr: IpAddr) -> Result<Pool> {
        self.list_pools()
            .await?
            .into_iter()
            .find(|p| p.contains(addr))
            .ok_or_else(|| IpamError::NotFound(format!("pool for address {addr}")))
    }
}
