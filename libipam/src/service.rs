use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use ipnetwork::IpNetwork;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::affinity::AffinityManager;
use crate::binding::{NetworkBinding, NetworkBindings};
use crate::block::{BlockAllocator, BlockId, Owner, Released};
use crate::config::IpamSettings;
use crate::error::{IpamError, Result};
use crate::keys::Keys;
use crate::pool::{Pool, PoolId, PoolStore};
use crate::retry::RetryPolicy;
use crate::store::{KvStore, get_json, swap_json};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocateRequest {
    pub network: String,
    pub host: String,
    /// Workload the address is handed to.
    pub handle: String,
    pub requested: Option<IpAddr>,
    pub attrs: BTreeMap<String, String>,
}

impl AllocateRequest {
    pub fn new(
        network: impl Into<String>,
        host: impl Into<String>,
        handle: impl Into<String>,
    ) -> Self {
        Self {
            network: network.into(),
            host: host.into(),
            handle: handle.into(),
            requested: None,
            attrs: BTreeMap::new(),
        }
    }

    pub fn with_address(mut self, addr: IpAddr) -> Self {
        self.requested = Some(addr);
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }
}

/// A live address assignment, unique per (pool, address).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Allocation {
    pub pool: IpNetwork,
    pub block: BlockId,
    pub address: IpAddr,
    pub handle: String,
    pub host: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
}

impl Allocation {
    fn new(pool: IpNetwork, block: BlockId, address: IpAddr, owner: Owner) -> Self {
        Self {
            pool,
            block,
            address,
            handle: owner.handle,
            host: owner.host,
            attrs: owner.attrs,
        }
    }
}

pub struct IpamService {
    store: Arc<dyn KvStore>,
    keys: Keys,
    retry: RetryPolicy,
    pools: PoolStore,
    blocks: Arc<BlockAllocator>,
    affinity: AffinityManager,
    bindings: NetworkBindings,
}

impl IpamService {
    pub fn new(store: Arc<dyn KvStore>, settings: IpamSettings) -> Self {
        let keys = Keys::new(settings.prefix);
        let retry = settings.retry;
        let blocks = Arc::new(BlockAllocator::new(
            store.clone(),
            keys.clone(),
            retry.clone(),
        ));
        let pools = PoolStore::new(
            store.clone(),
            keys.clone(),
            retry.clone(),
            settings.block_sizes,
            blocks.clone(),
        );
        let affinity =
            AffinityManager::new(store.clone(), keys.clone(), blocks.clone(), retry.clone());
        let bindings = NetworkBindings::new(store.clone(), keys.clone());
        Self {
            store,
            keys,
            retry,
            pools,
            blocks,
            affinity,
            bindings,
        }
    }

    pub fn pools(&self) -> &PoolStore {
        &self.pools
    }

    pub fn blocks(&self) -> &BlockAllocator {
        &self.blocks
    }

    pub fn affinity(&self) -> &AffinityManager {
        &self.affinity
    }

    pub fn bindings(&self) -> &NetworkBindings {
        &self.bindings
    }

    /// Assigns one address to the request's workload from the pools bound to
    /// its network, in binding order.
    ///
    /// The block write hands the address to the workload; the allocation
    /// record written after it is an index over the block. A call dropped in
    /// between leaves the address owned in its block with no record, which
    /// [`IpamService::release_handle`] cleans up.
    pub async fn allocate(&self, request: AllocateRequest) -> Result<Allocation> {
        let binding = self.bindings.resolve(&request.network).await?;
        let owner = Owner {
            handle: request.handle,
            host: request.host,
            attrs: request.attrs,
        };
        let (pool, block, address) = match request.requested {
            Some(addr) => self.allocate_requested(&binding, addr, &owner).await?,
            None => self.allocate_next(&binding, &owner).await?,
        };

        let allocation = Allocation::new(pool.cidr, block, address, owner);
        self.record(&allocation).await?;
        info!(
            "allocated {address} from pool {} (block {block}) to {} on {}",
            pool.cidr, allocation.handle, allocation.host
        );
        Ok(allocation)
    }

    async fn allocate_requested(
        &self,
        binding: &NetworkBinding,
        addr: IpAddr,
        owner: &Owner,
    ) -> Result<(Pool, BlockId, IpAddr)> {
        for id in &binding.pools {
            let Some(pool) = self.pools.get_pool(*id).await? else {
                warn!("network {} is bound to missing pool {id}", binding.network);
                continue;
            };
            if !pool.contains(addr) {
                continue;
            }
            if !pool.enabled {
                return Err(IpamError::PoolDisabled(pool.cidr));
            }
            let block = self.blocks.block_for_address(&pool, addr).await?;
            let addr = self
                .blocks
                .allocate_in_block(&pool.cidr, block, Some(addr), owner)
                .await?;
            self.confirm_pool(&pool, block, addr, owner).await?;
            return Ok((pool, block, addr));
        }
        Err(IpamError::AddressOutOfRange(addr))
    }

    async fn allocate_next(
        &self,
        binding: &NetworkBinding,
        owner: &Owner,
    ) -> Result<(Pool, BlockId, IpAddr)> {
        for id in &binding.pools {
            let Some(pool) = self.pools.get_pool(*id).await? else {
                warn!("network {} is bound to missing pool {id}", binding.network);
                continue;
            };
            if !pool.enabled {
                debug!("skipping disabled pool {id}");
                continue;
            }
            let (block, addr) = match self.allocate_from_pool(&pool, owner).await {
                Ok(found) => found,
                Err(IpamError::PoolExhausted(_)) => {
                    debug!("pool {id} is exhausted, trying the next one");
                    continue;
                }
                Err(e) => return Err(e),
            };
            match self.confirm_pool(&pool, block, addr, owner).await {
                Ok(()) => return Ok((pool, block, addr)),
                Err(IpamError::PoolDisabled(_)) | Err(IpamError::UnknownPool(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(IpamError::NoAddressesAvailable(binding.network.clone()))
    }

    async fn allocate_from_pool(&self, pool: &Pool, owner: &Owner) -> Result<(BlockId, IpAddr)> {
        let mut backoff = self.retry.backoff();
        for attempt in 0..self.retry.max_attempts {
            let block = self.affinity.get_or_claim_block(pool, &owner.host).await?;
            match self
                .blocks
                .allocate_in_block(&pool.cidr, block, None, owner)
                .await
            {
                Ok(addr) => return Ok((block, addr)),
                // Filled up or removed between picking it and flipping the bit.
                Err(IpamError::BlockFull(_)) | Err(IpamError::NotFound(_)) => {
                    debug!(
                        "block {block} ran out under us, picking again (attempt {})",
                        attempt + 1
                    );
                    backoff.wait().await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(IpamError::Contention(format!("block in pool {}", pool.cidr)))
    }

    /// Re-reads the pool once the address is committed. Pool removal
    /// disables the pool before it inspects any block, so an allocation that
    /// still finds it enabled here is seen by that inspection. Otherwise the
    /// address is handed back and the pool's error returned.
    async fn confirm_pool(
        &self,
        pool: &Pool,
        block: BlockId,
        addr: IpAddr,
        owner: &Owner,
    ) -> Result<()> {
        let err = match self.pools.get_pool(pool.cidr).await? {
            Some(current) if current.enabled => return Ok(()),
            Some(_) => IpamError::PoolDisabled(pool.cidr),
            None => IpamError::UnknownPool(pool.cidr),
        };
        warn!(
            "pool {} was disabled or removed while allocating {addr}, backing out",
            pool.cidr
        );
        if let Released::Freed { block_empty: true } =
            self.free(&pool.cidr, block, addr, &owner.handle).await?
        {
            self.blocks.delete_block_if_empty(&pool.cidr, block).await?;
        }
        Err(err)
    }

    /// Writes the allocation record for an address already committed in its
    /// block. A record left behind by an earlier holder is replaced as long as
    /// the block still names this allocation's handle.
    async fn record(&self, allocation: &Allocation) -> Result<()> {
        let key = self.keys.allocation(&allocation.pool, allocation.address);
        let mut backoff = self.retry.backoff();
        for _ in 0..self.retry.max_attempts {
            let expected = match get_json::<Allocation>(self.store.as_ref(), &key).await? {
                None => 0,
                Some((existing, _)) if existing == *allocation => return Ok(()),
                Some((existing, version)) => {
                    if !self.holds(allocation).await? {
                        return Err(IpamError::AllocationConflict(
                            allocation.pool,
                            allocation.address,
                        ));
                    }
                    warn!(
                        "replacing stale allocation record of {} for {}",
                        existing.handle, allocation.address
                    );
                    version
                }
            };
            if swap_json(self.store.as_ref(), &key, expected, Some(allocation))
                .await?
                .is_some()
            {
                return Ok(());
            }
            backoff.wait().await;
        }
        warn!("could not record allocation of {}, releasing it", allocation.address);
        self.free(
            &allocation.pool,
            allocation.block,
            allocation.address,
            &allocation.handle,
        )
        .await?;
        Err(IpamError::Contention(key))
    }

    async fn holds(&self, allocation: &Allocation) -> Result<bool> {
        Ok(self
            .blocks
            .get_block(&allocation.pool, allocation.block)
            .await?
            .is_some_and(|(b, _)| {
                b.owner_of(allocation.address)
                    .is_some_and(|o| o.handle == allocation.handle)
            }))
    }

    /// Clears `addr` if `handle` still holds it, and drops the block's
    /// affinity once the block is empty.
    async fn free(
        &self,
        pool: &IpNetwork,
        block: BlockId,
        addr: IpAddr,
        handle: &str,
    ) -> Result<Released> {
        let released = self
            .blocks
            .release_in_block(pool, block, addr, Some(handle))
            .await?;
        if let Released::Freed { block_empty: true } = released {
            self.affinity.release_affinity(pool, block).await?;
        }
        Ok(released)
    }

    /// Frees `addr` in `pool`. Releasing an address that has no allocation
    /// record is a no-op.
    ///
    /// The record is deleted first and the block bit is cleared only for the
    /// handle that record named, so a repeated release cannot take the
    /// address away from whoever was handed it next.
    pub async fn release(&self, pool: PoolId, addr: IpAddr) -> Result<()> {
        let pool = self
            .pools
            .get_pool(pool)
            .await?
            .ok_or_else(|| IpamError::NotFound(format!("pool {pool}")))?;
        if !pool.contains(addr) {
            return Err(IpamError::AddressOutOfRange(addr));
        }

        let key = self.keys.allocation(&pool.cidr, addr);
        let mut deleted = None;
        let mut backoff = self.retry.backoff();
        for _ in 0..self.retry.max_attempts {
            let Some((record, version)) = get_json::<Allocation>(self.store.as_ref(), &key).await?
            else {
                debug!("{addr} in pool {} has no allocation record", pool.cidr);
                return Ok(());
            };
            if swap_json::<Allocation>(self.store.as_ref(), &key, version, None)
                .await?
                .is_some()
            {
                deleted = Some(record);
                break;
            }
            backoff.wait().await;
        }
        let Some(record) = deleted else {
            return Err(IpamError::Contention(key));
        };

        match self
            .free(&pool.cidr, record.block, addr, &record.handle)
            .await?
        {
            Released::Freed { .. } => {
                info!("released {addr} in pool {} from {}", pool.cidr, record.handle)
            }
            Released::HeldByOther => warn!(
                "dropped record of {addr} for {}, the block names another holder",
                record.handle
            ),
            Released::NotAllocated => debug!("{addr} was already free in block {}", record.block),
        }
        Ok(())
    }

    /// Frees every address held by `handle`, including ones whose allocation
    /// record was never written. Returns what was freed.
    pub async fn release_handle(&self, handle: &str) -> Result<Vec<Allocation>> {
        let held = self.allocations_for_handle(handle).await?;
        for allocation in &held {
            let key = self.keys.allocation(&allocation.pool, allocation.address);
            if let Some((record, version)) =
                get_json::<Allocation>(self.store.as_ref(), &key).await?
            {
                if record.handle == handle
                    && swap_json::<Allocation>(self.store.as_ref(), &key, version, None)
                        .await?
                        .is_none()
                {
                    return Err(IpamError::Contention(key));
                }
            }
            self.free(
                &allocation.pool,
                allocation.block,
                allocation.address,
                handle,
            )
            .await?;
        }
        if !held.is_empty() {
            info!("released {} address(es) held by {handle}", held.len());
        }
        Ok(held)
    }

    /// Binds `network` to `pools`, in priority order. Every pool must exist.
    pub async fn bind_network(&self, network: &str, pools: &[PoolId]) -> Result<NetworkBinding> {
        let known = self.pools.list_pools().await?;
        let mut ordered: Vec<IpNetwork> = Vec::with_capacity(pools.len());
        for id in pools {
            if !known.iter().any(|p| p.cidr == *id) {
                return Err(IpamError::UnknownPool(*id));
            }
            if !ordered.contains(id) {
                ordered.push(*id);
            }
        }
        self.bindings.bind(network, ordered).await
    }

    pub async fn unbind_network(&self, network: &str) -> Result<()> {
        self.bindings.unbind(network).await
    }

    /// The pools `network` draws from, in binding order.
    pub async fn network_pools(&self, network: &str) -> Result<Vec<Pool>> {
        let binding = self.bindings.resolve(network).await?;
        let known = self.pools.list_pools().await?;
        Ok(binding
            .pools
            .iter()
            .filter_map(|id| known.iter().find(|p| p.cidr == *id).cloned())
            .collect())
    }

    /// The allocation of `addr`, as its block records it.
    pub async fn get_allocation(&self, pool: PoolId, addr: IpAddr) -> Result<Option<Allocation>> {
        let Some(pool) = self.pools.get_pool(pool).await? else {
            return Ok(None);
        };
        if !pool.contains(addr) {
            return Ok(None);
        }
        let Some(id) = BlockId::containing(addr, pool.block_size) else {
            return Ok(None);
        };
        Ok(self
            .blocks
            .get_block(&pool.cidr, id)
            .await?
            .and_then(|(block, _)| block.owner_of(addr).cloned())
            .map(|owner| Allocation::new(pool.cidr, id, addr, owner)))
    }

    /// Every address held by `handle`, read from the blocks of all pools.
    pub async fn allocations_for_handle(&self, handle: &str) -> Result<Vec<Allocation>> {
        let mut found = Vec::new();
        for pool in self.pools.list_pools().await? {
            for (block, _) in self.blocks.list_blocks(&pool).await? {
                found.extend(
                    block
                        .owned()
                        .filter(|(_, owner)| owner.handle == handle)
                        .map(|(addr, owner)| {
                            Allocation::new(pool.cidr, block.cidr, addr, owner.clone())
                        }),
                );
            }
        }
        Ok(found)
    }

    /// Removes an unused pool together with its blocks and affinities.
    pub async fn remove_pool(&self, id: PoolId) -> Result<()> {
        self.pools.remove_pool(id).await?;
        self.affinity.forget_pool(id).await
    }
}
