use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use fixedbitset::FixedBitSet;
use ipnetwork::IpNetwork;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{IpamError, Result};
use crate::ip;
use crate::keys::{Keys, parse_cidr_key};
use crate::pool::Pool;
use crate::retry::RetryPolicy;
use crate::store::{KvStore, Version, get_json, swap_json};

/// A block is identified by its CIDR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(IpNetwork);

impl BlockId {
    pub fn new(cidr: IpNetwork) -> Self {
        BlockId(cidr)
    }

    pub fn cidr(&self) -> IpNetwork {
        self.0
    }

    /// The block of `prefix` length holding `addr`.
    pub fn containing(addr: IpAddr, prefix: u8) -> Option<Self> {
        ip::containing_subnet(addr, prefix).map(BlockId)
    }
}

impl Ord for BlockId {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.0.network(), self.0.prefix()).cmp(&(other.0.network(), other.0.prefix()))
    }
}

impl PartialOrd for BlockId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Holder of one allocated address, kept inside the block so the block write
/// alone decides who owns it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Owner {
    pub handle: String,
    pub host: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
}

impl Owner {
    pub fn new(handle: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            host: host.into(),
            attrs: BTreeMap::new(),
        }
    }
}

/// Persisted block: one bit per address, set when allocated, plus the owner
/// of every set bit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub cidr: BlockId,
    pub pool: IpNetwork,
    /// Bumped on every committed mutation.
    pub sequence: u64,
    #[serde(with = "bitmap")]
    allocated: FixedBitSet,
    #[serde(default)]
    owners: BTreeMap<usize, Owner>,
}

impl Block {
    pub fn new(cidr: BlockId, pool: IpNetwork) -> Self {
        let net = cidr.cidr();
        let host_bits = ip::max_prefix(&net) - net.prefix();
        Block {
            cidr,
            pool,
            sequence: 0,
            allocated: FixedBitSet::with_capacity(1usize << host_bits),
            owners: BTreeMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.allocated.len()
    }

    pub fn allocated_count(&self) -> usize {
        self.allocated.count_ones(..)
    }

    pub fn free(&self) -> usize {
        self.capacity() - self.allocated_count()
    }

    pub fn is_empty(&self) -> bool {
        self.allocated_count() == 0
    }

    pub fn ordinal_of(&self, addr: IpAddr) -> Option<usize> {
        ip::offset(&self.cidr.cidr(), addr).map(|o| o as usize)
    }

    pub fn address_at(&self, ordinal: usize) -> Option<IpAddr> {
        if ordinal >= self.capacity() {
            return None;
        }
        ip::nth_address(&self.cidr.cidr(), ordinal as u128)
    }

    pub fn is_allocated(&self, addr: IpAddr) -> bool {
        self.ordinal_of(addr)
            .is_some_and(|o| self.allocated.contains(o))
    }

    pub fn owner_of(&self, addr: IpAddr) -> Option<&Owner> {
        self.ordinal_of(addr).and_then(|o| self.owners.get(&o))
    }

    /// Allocated addresses with their owners, lowest first.
    pub fn owned(&self) -> impl Iterator<Item = (IpAddr, &Owner)> + '_ {
        self.owners
            .iter()
            .filter_map(|(o, owner)| self.address_at(*o).map(|addr| (addr, owner)))
    }

    pub fn first_free(&self) -> Option<usize> {
        (0..self.capacity()).find(|&o| !self.allocated.contains(o))
    }

    pub fn allocated_addresses(&self) -> Vec<IpAddr> {
        self.allocated
            .ones()
            .filter_map(|o| self.address_at(o))
            .collect()
    }

    fn set(&mut self, ordinal: usize, owner: Option<Owner>) {
        self.allocated.set(ordinal, owner.is_some());
        match owner {
            Some(owner) => self.owners.insert(ordinal, owner),
            None => self.owners.remove(&ordinal),
        };
        self.sequence += 1;
    }
}

/// JSON form of the bitmap: its length and the set ordinals.
mod bitmap {
    use fixedbitset::FixedBitSet;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct Bits {
        len: usize,
        ones: Vec<usize>,
    }

    pub fn serialize<S: Serializer>(bits: &FixedBitSet, s: S) -> Result<S::Ok, S::Error> {
        Bits {
            len: bits.len(),
            ones: bits.ones().collect(),
        }
        .serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<FixedBitSet, D::Error> {
        let raw = Bits::deserialize(d)?;
        let mut bits = FixedBitSet::with_capacity(raw.len);
        for ordinal in raw.ones {
            if ordinal >= raw.len {
                return Err(D::Error::custom(format!(
                    "bit {ordinal} out of range for a bitmap of {}",
                    raw.len
                )));
            }
            bits.insert(ordinal);
        }
        Ok(bits)
    }
}

/// What [`BlockAllocator::release_in_block`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Released {
    /// The address was already free, or its block is gone.
    NotAllocated,
    /// The address belongs to a different handle than the one releasing it.
    HeldByOther,
    Freed { block_empty: bool },
}

/// Which existing blocks a caller may be handed by [`BlockAllocator::ensure_block`].
#[derive(Debug, Clone, Default)]
pub struct BlockHint {
    /// Blocks affine to the caller, preferred in ascending order.
    pub owned: Vec<BlockId>,
    /// Blocks affine to anyone; skipped unless owned.
    pub claimed: HashSet<BlockId>,
}

impl BlockHint {
    pub fn affine(mut owned: Vec<BlockId>, claimed: HashSet<BlockId>) -> Self {
        owned.sort();
        BlockHint { owned, claimed }
    }

    /// Accepts any block with free capacity regardless of ownership.
    pub fn any() -> Self {
        BlockHint::default()
    }
}

pub struct BlockAllocator {
    store: Arc<dyn KvStore>,
    keys: Keys,
    retry: RetryPolicy,
}

impl BlockAllocator {
    pub fn new(store: Arc<dyn KvStore>, keys: Keys, retry: RetryPolicy) -> Self {
        Self { store, keys, retry }
    }

    pub async fn get_block(&self, pool: &IpNetwork, id: BlockId) -> Result<Option<(Block, Version)>> {
        get_json(self.store.as_ref(), &self.keys.block(pool, id)).await
    }

    /// Blocks carved out of `pool`, lowest CIDR first.
    pub async fn list_blocks(&self, pool: &Pool) -> Result<Vec<(Block, Version)>> {
        let prefix = self.keys.blocks(&pool.cidr);
        let mut blocks = Vec::new();
        for (key, kv) in self.store.list(&prefix).await? {
            if key
                .strip_prefix(&prefix)
                .and_then(parse_cidr_key)
                .is_none()
            {
                warn!("ignoring malformed block key {key}");
                continue;
            }
            let block: Block = serde_json::from_slice(&kv.value)?;
            blocks.push((block, kv.version));
        }
        blocks.sort_by_key(|(b, _)| b.cidr);
        Ok(blocks)
    }

    /// Returns a block of `pool` with free capacity that the hint accepts:
    /// an owned block first, then an unclaimed one, else a freshly created
    /// block at the lowest unused aligned range.
    pub async fn ensure_block(&self, pool: &Pool, hint: &BlockHint) -> Result<BlockId> {
        let blocks = self.list_blocks(pool).await?;

        if let Some((b, _)) = blocks
            .iter()
            .find(|(b, _)| b.free() > 0 && hint.owned.contains(&b.cidr))
        {
            return Ok(b.cidr);
        }
        if let Some((b, _)) = blocks
            .iter()
            .find(|(b, _)| b.free() > 0 && !hint.claimed.contains(&b.cidr))
        {
            return Ok(b.cidr);
        }

        let mut used: HashSet<BlockId> = blocks.iter().map(|(b, _)| b.cidr).collect();
        used.extend(hint.claimed.iter().copied());

        let mut backoff = self.retry.backoff();
        for _ in 0..self.retry.max_attempts {
            let Some(id) = first_unused_block(pool, &used) else {
                return Err(IpamError::PoolExhausted(pool.cidr));
            };
            if self.create_block(pool, id).await? {
                return Ok(id);
            }
            // Someone else took this range; it will show up as used next round.
            used.insert(id);
            backoff.wait().await;
        }
        Err(IpamError::Contention(format!("new block in pool {}", pool.cidr)))
    }

    /// The block holding `addr`, created without affinity when missing.
    pub async fn block_for_address(&self, pool: &Pool, addr: IpAddr) -> Result<BlockId> {
        if !pool.contains(addr) {
            return Err(IpamError::AddressOutOfRange(addr));
        }
        let id = BlockId::containing(addr, pool.block_size)
            .ok_or(IpamError::AddressOutOfRange(addr))?;

        let mut backoff = self.retry.backoff();
        for _ in 0..self.retry.max_attempts {
            if self.get_block(&pool.cidr, id).await?.is_some() || self.create_block(pool, id).await? {
                return Ok(id);
            }
            backoff.wait().await;
        }
        Err(IpamError::Contention(self.keys.block(&pool.cidr, id)))
    }

    async fn create_block(&self, pool: &Pool, id: BlockId) -> Result<bool> {
        let block = Block::new(id, pool.cidr);
        let key = self.keys.block(&pool.cidr, id);
        match swap_json(self.store.as_ref(), &key, 0, Some(&block)).await? {
            Some(_) => {
                info!("created block {id} in pool {}", pool.cidr);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Hands one address of the block to `owner`: `requested` if given,
    /// otherwise the lowest free one. The whole read-modify-write restarts on
    /// a lost race and gives up with `Contention` once the retry budget is
    /// spent. The successful swap is the commit point of an allocation.
    pub async fn allocate_in_block(
        &self,
        pool: &IpNetwork,
        id: BlockId,
        requested: Option<IpAddr>,
        owner: &Owner,
    ) -> Result<IpAddr> {
        let key = self.keys.block(pool, id);
        let mut backoff = self.retry.backoff();

        for attempt in 0..self.retry.max_attempts {
            let Some((mut block, version)) = self.get_block(pool, id).await? else {
                return Err(IpamError::NotFound(format!("block {id}")));
            };

            let ordinal = match requested {
                Some(addr) => {
                    let ordinal = block
                        .ordinal_of(addr)
                        .ok_or(IpamError::AddressOutOfRange(addr))?;
                    if block.allocated.contains(ordinal) {
                        return Err(IpamError::AddressInUse(addr));
                    }
                    ordinal
                }
                None => block.first_free().ok_or(IpamError::BlockFull(id))?,
            };
            let addr = block
                .address_at(ordinal)
                .ok_or_else(|| IpamError::NotFound(format!("ordinal {ordinal} of block {id}")))?;

            block.set(ordinal, Some(owner.clone()));
            if swap_json(self.store.as_ref(), &key, version, Some(&block))
                .await?
                .is_some()
            {
                debug!(
                    "assigned {addr} from block {id} to {} (sequence {})",
                    owner.handle, block.sequence
                );
                return Ok(addr);
            }
            debug!("block {id} changed under us, retrying (attempt {})", attempt + 1);
            backoff.wait().await;
        }
        Err(IpamError::Contention(key))
    }

    /// Clears the bit for `addr`. With a `handle`, only that handle's
    /// allocation is cleared. Free addresses and missing blocks are left
    /// alone.
    pub async fn release_in_block(
        &self,
        pool: &IpNetwork,
        id: BlockId,
        addr: IpAddr,
        handle: Option<&str>,
    ) -> Result<Released> {
        let key = self.keys.block(pool, id);
        let mut backoff = self.retry.backoff();

        for attempt in 0..self.retry.max_attempts {
            let Some((mut block, version)) = self.get_block(pool, id).await? else {
                return Ok(Released::NotAllocated);
            };
            let ordinal = block
                .ordinal_of(addr)
                .ok_or(IpamError::AddressOutOfRange(addr))?;
            if !block.allocated.contains(ordinal) {
                return Ok(Released::NotAllocated);
            }
            if let Some(handle) = handle {
                if block.owners.get(&ordinal).is_some_and(|o| o.handle != handle) {
                    return Ok(Released::HeldByOther);
                }
            }

            block.set(ordinal, None);
            if swap_json(self.store.as_ref(), &key, version, Some(&block))
                .await?
                .is_some()
            {
                debug!("released {addr} in block {id}");
                return Ok(Released::Freed {
                    block_empty: block.is_empty(),
                });
            }
            debug!("block {id} changed under us, retrying (attempt {})", attempt + 1);
            backoff.wait().await;
        }
        Err(IpamError::Contention(key))
    }

    /// Deletes the block record if no address in it is allocated.
    pub async fn delete_block_if_empty(&self, pool: &IpNetwork, id: BlockId) -> Result<bool> {
        let key = self.keys.block(pool, id);
        let mut backoff = self.retry.backoff();

        for _ in 0..self.retry.max_attempts {
            let Some((block, version)) = self.get_block(pool, id).await? else {
                return Ok(true);
            };
            if !block.is_empty() {
                return Ok(false);
            }
            if swap_json::<Block>(self.store.as_ref(), &key, version, None)
                .await?
                .is_some()
            {
                info!("deleted block {id}");
                return Ok(true);
            }
            backoff.wait().await;
        }
        Err(IpamError::Contention(key))
    }
}

fn first_unused_block(pool: &Pool, used: &HashSet<BlockId>) -> Option<BlockId> {
    let count = ip::subnet_count(&pool.cidr, pool.block_size);
    // At most `used.len() + 1` candidates are inspected before a gap turns up.
    (0..count)
        .take(used.len() + 1)
        .filter_map(|n| ip::nth_subnet(&pool.cidr, pool.block_size, n))
        .map(BlockId)
        .find(|id| !used.contains(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn pool(cidr: &str, block_size: u8) -> Pool {
        Pool {
            cidr: cidr.parse().unwrap(),
            enabled: true,
            block_size,
        }
    }

    fn allocator(store: Arc<MemoryStore>, attempts: usize) -> BlockAllocator {
        BlockAllocator::new(store, Keys::default(), RetryPolicy::immediate(attempts))
    }

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn owner(handle: &str) -> Owner {
        Owner::new(handle, "node-a")
    }

    #[test]
    fn test_block_bitmap() {
        let id = BlockId::new("10.15.0.64/26".parse().unwrap());
        let mut block = Block::new(id, "10.15.0.0/16".parse().unwrap());
        assert_eq!(block.capacity(), 64);
        assert!(block.is_empty());
        assert_eq!(block.first_free(), Some(0));

        block.set(0, Some(owner("c0")));
        block.set(5, Some(owner("c5")));
        assert_eq!(block.free(), 62);
        assert_eq!(block.first_free(), Some(1));
        assert!(block.is_allocated(addr("10.15.0.69")));
        assert_eq!(block.owner_of(addr("10.15.0.69")).unwrap().handle, "c5");
        assert_eq!(
            block.allocated_addresses(),
            vec![addr("10.15.0.64"), addr("10.15.0.69")]
        );
        assert_eq!(block.sequence, 2);
        assert_eq!(block.ordinal_of(addr("10.15.0.128")), None);
        assert_eq!(block.address_at(64), None);

        block.set(5, None);
        assert!(block.owner_of(addr("10.15.0.69")).is_none());
        assert_eq!(block.owned().count(), 1);
    }

    #[test]
    fn test_block_json_round_trip() {
        let id = BlockId::new("10.15.0.64/26".parse().unwrap());
        let mut block = Block::new(id, "10.15.0.0/16".parse().unwrap());
        block.set(0, Some(owner("c0")));
        block.set(63, Some(owner("c63")));

        let json = serde_json::to_vec(&block).unwrap();
        let decoded: Block = serde_json::from_slice(&json).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.capacity(), 64);
        assert_eq!(decoded.allocated_count(), 2);
        assert_eq!(decoded.owner_of(addr("10.15.0.127")).unwrap().handle, "c63");

        let bad = r#"{"cidr":"10.15.0.0/30","pool":"10.15.0.0/16","sequence":1,
            "allocated":{"len":4,"ones":[4]}}"#;
        assert!(serde_json::from_str::<Block>(bad).is_err());
    }

    #[test]
    fn test_block_id_order() {
        let mut ids: Vec<BlockId> = ["10.15.1.0/26", "10.15.0.192/26", "10.15.0.64/26"]
            .iter()
            .map(|s| BlockId::new(s.parse().unwrap()))
            .collect();
        ids.sort();
        let sorted: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        assert_eq!(sorted, ["10.15.0.64/26", "10.15.0.192/26", "10.15.1.0/26"]);
    }

    #[tokio::test]
    async fn test_ensure_block_creates_lowest_range_first() {
        let store = Arc::new(MemoryStore::new());
        let blocks = allocator(store, 5);
        let pool = pool("10.15.0.0/24", 26);

        let first = blocks.ensure_block(&pool, &BlockHint::any()).await.unwrap();
        assert_eq!(first.to_string(), "10.15.0.0/26");

        // An unclaimed block with room is reused rather than carving a new one.
        let again = blocks.ensure_block(&pool, &BlockHint::any()).await.unwrap();
        assert_eq!(again, first);

        // Claimed by somebody else: skip it and carve the next range.
        let hint = BlockHint::affine(vec![], HashSet::from([first]));
        let second = blocks.ensure_block(&pool, &hint).await.unwrap();
        assert_eq!(second.to_string(), "10.15.0.64/26");

        let (block, _) = blocks.get_block(&pool.cidr, second).await.unwrap().unwrap();
        assert!(pool.cidr.contains(block.cidr.cidr().network()));
        assert_eq!(block.capacity(), 64);
    }

    #[tokio::test]
    async fn test_list_blocks_is_scoped_to_pool() {
        let store = Arc::new(MemoryStore::new());
        let blocks = allocator(store, 5);
        let p1 = pool("10.15.0.0/24", 26);
        let p2 = pool("10.16.0.0/24", 26);
        blocks.ensure_block(&p1, &BlockHint::any()).await.unwrap();
        blocks.ensure_block(&p2, &BlockHint::any()).await.unwrap();

        let listed = blocks.list_blocks(&p1).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0.pool, p1.cidr);
    }

    #[tokio::test]
    async fn test_ensure_block_prefers_owned() {
        let store = Arc::new(MemoryStore::new());
        let blocks = allocator(store, 5);
        let pool = pool("10.15.0.0/24", 26);

        let a = blocks.ensure_block(&pool, &BlockHint::any()).await.unwrap();
        let b = blocks
            .ensure_block(&pool, &BlockHint::affine(vec![], HashSet::from([a])))
            .await
            .unwrap();
        let hint = BlockHint::affine(vec![b], HashSet::from([a, b]));
        assert_eq!(blocks.ensure_block(&pool, &hint).await.unwrap(), b);
    }

    #[tokio::test]
    async fn test_ensure_block_exhausted() {
        let store = Arc::new(MemoryStore::new());
        let blocks = allocator(store, 5);
        let pool = pool("10.15.0.0/29", 30);

        let a = blocks.ensure_block(&pool, &BlockHint::any()).await.unwrap();
        let b = blocks
            .ensure_block(&pool, &BlockHint::affine(vec![], HashSet::from([a])))
            .await
            .unwrap();
        let err = blocks
            .ensure_block(&pool, &BlockHint::affine(vec![], HashSet::from([a, b])))
            .await
            .unwrap_err();
        assert!(matches!(err, IpamError::PoolExhausted(_)));
    }

    #[tokio::test]
    async fn test_allocate_lowest_then_specific() {
        let store = Arc::new(MemoryStore::new());
        let blocks = allocator(store, 5);
        let pool = pool("10.15.0.0/24", 26);
        let p = pool.cidr;
        let id = blocks.ensure_block(&pool, &BlockHint::any()).await.unwrap();
        let w = owner("c1");

        assert_eq!(blocks.allocate_in_block(&p, id, None, &w).await.unwrap(), addr("10.15.0.0"));
        assert_eq!(blocks.allocate_in_block(&p, id, None, &w).await.unwrap(), addr("10.15.0.1"));
        assert_eq!(
            blocks.allocate_in_block(&p, id, Some(addr("10.15.0.9")), &w).await.unwrap(),
            addr("10.15.0.9")
        );
        assert!(matches!(
            blocks.allocate_in_block(&p, id, Some(addr("10.15.0.9")), &w).await,
            Err(IpamError::AddressInUse(_))
        ));
        assert!(matches!(
            blocks.allocate_in_block(&p, id, Some(addr("10.15.0.200")), &w).await,
            Err(IpamError::AddressOutOfRange(_))
        ));
        assert_eq!(blocks.allocate_in_block(&p, id, None, &w).await.unwrap(), addr("10.15.0.2"));

        // The owner is read back from the store together with the bit.
        let (block, _) = blocks.get_block(&p, id).await.unwrap().unwrap();
        assert_eq!(block.owner_of(addr("10.15.0.9")), Some(&w));
    }

    #[tokio::test]
    async fn test_version_increases_on_every_mutation() {
        let store = Arc::new(MemoryStore::new());
        let blocks = allocator(store, 5);
        let pool = pool("10.15.0.0/24", 26);
        let p = pool.cidr;
        let id = blocks.ensure_block(&pool, &BlockHint::any()).await.unwrap();

        let (_, mut last) = blocks.get_block(&p, id).await.unwrap().unwrap();
        let a = blocks.allocate_in_block(&p, id, None, &owner("c1")).await.unwrap();
        let (b, v) = blocks.get_block(&p, id).await.unwrap().unwrap();
        assert!(v > last && b.sequence == 1);
        last = v;

        blocks.release_in_block(&p, id, a, None).await.unwrap();
        let (b, v) = blocks.get_block(&p, id).await.unwrap().unwrap();
        assert!(v > last && b.sequence == 2);
    }

    #[tokio::test]
    async fn test_full_block() {
        let store = Arc::new(MemoryStore::new());
        let blocks = allocator(store, 5);
        let pool = pool("10.15.0.0/30", 31);
        let p = pool.cidr;
        let id = blocks.ensure_block(&pool, &BlockHint::any()).await.unwrap();
        blocks.allocate_in_block(&p, id, None, &owner("c1")).await.unwrap();
        blocks.allocate_in_block(&p, id, None, &owner("c2")).await.unwrap();
        assert!(matches!(
            blocks.allocate_in_block(&p, id, None, &owner("c3")).await,
            Err(IpamError::BlockFull(_))
        ));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let blocks = allocator(store.clone(), 5);
        let pool = pool("10.15.0.0/24", 26);
        let p = pool.cidr;
        let id = blocks.ensure_block(&pool, &BlockHint::any()).await.unwrap();
        let a = blocks.allocate_in_block(&p, id, None, &owner("c1")).await.unwrap();
        let b = blocks.allocate_in_block(&p, id, None, &owner("c2")).await.unwrap();

        assert_eq!(
            blocks.release_in_block(&p, id, a, None).await.unwrap(),
            Released::Freed { block_empty: false }
        );
        let revision = store.revision().await;
        assert_eq!(
            blocks.release_in_block(&p, id, a, None).await.unwrap(),
            Released::NotAllocated
        );
        assert_eq!(store.revision().await, revision);
        assert_eq!(
            blocks.release_in_block(&p, id, b, None).await.unwrap(),
            Released::Freed { block_empty: true }
        );
    }

    #[tokio::test]
    async fn test_release_by_handle_spares_other_owner() {
        let store = Arc::new(MemoryStore::new());
        let blocks = allocator(store.clone(), 5);
        let pool = pool("10.15.0.0/24", 26);
        let p = pool.cidr;
        let id = blocks.ensure_block(&pool, &BlockHint::any()).await.unwrap();
        let a = blocks.allocate_in_block(&p, id, None, &owner("new")).await.unwrap();

        let revision = store.revision().await;
        assert_eq!(
            blocks.release_in_block(&p, id, a, Some("old")).await.unwrap(),
            Released::HeldByOther
        );
        assert_eq!(store.revision().await, revision);
        assert_eq!(
            blocks.release_in_block(&p, id, a, Some("new")).await.unwrap(),
            Released::Freed { block_empty: true }
        );
    }

    #[tokio::test]
    async fn test_contention_leaves_bitmap_untouched() {
        let store = Arc::new(MemoryStore::new());
        let blocks = allocator(store.clone(), 3);
        let pool = pool("10.15.0.0/24", 26);
        let p = pool.cidr;
        let id = blocks.ensure_block(&pool, &BlockHint::any()).await.unwrap();
        blocks.allocate_in_block(&p, id, None, &owner("c1")).await.unwrap();
        let before = blocks.get_block(&p, id).await.unwrap().unwrap();

        store.inject_conflicts(3).await;
        let calls = store.cas_calls().await;
        let err = blocks.allocate_in_block(&p, id, None, &owner("c2")).await.unwrap_err();
        assert!(matches!(err, IpamError::Contention(_)));
        assert_eq!(store.cas_calls().await - calls, 3);
        assert_eq!(blocks.get_block(&p, id).await.unwrap().unwrap(), before);

        // Once the interference stops the next attempt goes through.
        assert_eq!(
            blocks.allocate_in_block(&p, id, None, &owner("c2")).await.unwrap(),
            addr("10.15.0.1")
        );
    }

    #[tokio::test]
    async fn test_timeouts_count_as_contention() {
        let store = Arc::new(MemoryStore::new());
        let blocks = allocator(store.clone(), 2);
        let pool = pool("10.15.0.0/24", 26);
        let p = pool.cidr;
        let id = blocks.ensure_block(&pool, &BlockHint::any()).await.unwrap();
        let before = blocks.get_block(&p, id).await.unwrap().unwrap();

        store.inject_timeouts(2).await;
        assert!(matches!(
            blocks.allocate_in_block(&p, id, None, &owner("c1")).await,
            Err(IpamError::Contention(_))
        ));
        assert_eq!(blocks.get_block(&p, id).await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn test_block_for_address() {
        let store = Arc::new(MemoryStore::new());
        let blocks = allocator(store, 5);
        let pool = pool("10.15.0.0/16", 26);
        let id = blocks.block_for_address(&pool, addr("10.15.3.77")).await.unwrap();
        assert_eq!(id.to_string(), "10.15.3.64/26");
        assert_eq!(blocks.block_for_address(&pool, addr("10.15.3.70")).await.unwrap(), id);
        assert!(matches!(
            blocks.block_for_address(&pool, addr("10.16.0.1")).await,
            Err(IpamError::AddressOutOfRange(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_block_if_empty() {
        let store = Arc::new(MemoryStore::new());
        let blocks = allocator(store, 5);
        let pool = pool("10.15.0.0/24", 26);
        let p = pool.cidr;
        let id = blocks.ensure_block(&pool, &BlockHint::any()).await.unwrap();
        let a = blocks.allocate_in_block(&p, id, None, &owner("c1")).await.unwrap();
        assert!(!blocks.delete_block_if_empty(&p, id).await.unwrap());
        blocks.release_in_block(&p, id, a, None).await.unwrap();
        assert!(blocks.delete_block_if_empty(&p, id).await.unwrap());
        assert!(blocks.get_block(&p, id).await.unwrap().is_none());
        assert!(blocks.list_blocks(&pool).await.unwrap().is_empty());
    }
}
