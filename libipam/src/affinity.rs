use std::collections::HashSet;
use std::sync::Arc;

use ipnetwork::IpNetwork;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::block::{BlockAllocator, BlockHint, BlockId};
use crate::error::{IpamError, Result};
use crate::keys::Keys;
use crate::pool::Pool;
use crate::retry::RetryPolicy;
use crate::store::{KvStore, Version, get_json, list_json, swap_json};

/// A host's claim on a block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Affinity {
    pub host: String,
    pub block: BlockId,
    pub pool: IpNetwork,
}

/// Hands each host its own blocks so hosts rarely race on the same bitmap.
/// Affinity only steers block choice; uniqueness is enforced by the block CAS.
pub struct AffinityManager {
    store: Arc<dyn KvStore>,
    keys: Keys,
    blocks: Arc<BlockAllocator>,
    retry: RetryPolicy,
}

impl AffinityManager {
    pub fn new(
        store: Arc<dyn KvStore>,
        keys: Keys,
        blocks: Arc<BlockAllocator>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            keys,
            blocks,
            retry,
        }
    }

    pub async fn get_affinity(
        &self,
        pool: &IpNetwork,
        block: BlockId,
    ) -> Result<Option<(Affinity, Version)>> {
        get_json(self.store.as_ref(), &self.keys.affinity(pool, block)).await
    }

    /// Every affinity of every pool.
    pub async fn list_affinities(&self) -> Result<Vec<Affinity>> {
        let listed: Vec<(String, Affinity, Version)> =
            list_json(self.store.as_ref(), &self.keys.all_affinities()).await?;
        Ok(listed.into_iter().map(|(_, a, _)| a).collect())
    }

    pub async fn pool_affinities(&self, pool: &IpNetwork) -> Result<Vec<Affinity>> {
        let listed: Vec<(String, Affinity, Version)> =
            list_json(self.store.as_ref(), &self.keys.affinities(pool)).await?;
        Ok(listed.into_iter().map(|(_, a, _)| a).collect())
    }

    pub async fn affinities_for_host(&self, host: &str) -> Result<Vec<Affinity>> {
        let mut owned: Vec<Affinity> = self
            .list_affinities()
            .await?
            .into_iter()
            .filter(|a| a.host == host)
            .collect();
        owned.sort_by_key(|a| a.block);
        Ok(owned)
    }

    fn hint_for(host: &str, affinities: &[Affinity]) -> BlockHint {
        let owned = affinities
            .iter()
            .filter(|a| a.host == host)
            .map(|a| a.block)
            .collect();
        let claimed: HashSet<BlockId> = affinities.iter().map(|a| a.block).collect();
        BlockHint::affine(owned, claimed)
    }

    /// Returns a block of `pool` for `host` to allocate from: one of its own
    /// blocks with room if there is one, otherwise a freshly claimed block.
    /// When every block is taken by other hosts the host borrows any block
    /// with free space instead.
    pub async fn get_or_claim_block(&self, pool: &Pool, host: &str) -> Result<BlockId> {
        let mut backoff = self.retry.backoff();
        for attempt in 0..self.retry.max_attempts {
            let affinities = self.pool_affinities(&pool.cidr).await?;
            let hint = Self::hint_for(host, &affinities);

            let block = match self.blocks.ensure_block(pool, &hint).await {
                Ok(block) => block,
                Err(IpamError::PoolExhausted(_)) | Err(IpamError::Contention(_)) => break,
                Err(e) => return Err(e),
            };
            if hint.owned.contains(&block) || self.try_claim(pool, block, host).await? {
                return Ok(block);
            }
            debug!(
                "block {block} was claimed by another host first, retrying (attempt {})",
                attempt + 1
            );
            backoff.wait().await;
        }

        warn!(
            "no block of pool {} can be claimed by host {host}, borrowing one without affinity",
            pool.cidr
        );
        self.blocks.ensure_block(pool, &BlockHint::any()).await
    }

    /// Creates the affinity record for `block`. Returns whether `host` now
    /// holds it.
    pub async fn try_claim(&self, pool: &Pool, block: BlockId, host: &str) -> Result<bool> {
        let affinity = Affinity {
            host: host.to_string(),
            block,
            pool: pool.cidr,
        };
        let key = self.keys.affinity(&pool.cidr, block);
        if swap_json(self.store.as_ref(), &key, 0, Some(&affinity))
            .await?
            .is_some()
        {
            info!("host {host} claimed block {block}");
            return Ok(true);
        }
        // The create may have landed before a timeout was reported.
        Ok(self
            .get_affinity(&pool.cidr, block)
            .await?
            .is_some_and(|(a, _)| a.host == host))
    }

    /// Drops the affinity on `block` if the block has no allocated addresses.
    /// A claim that changed between the read and the delete is left alone.
    pub async fn release_affinity(&self, pool: &IpNetwork, block: BlockId) -> Result<bool> {
        let Some((affinity, version)) = self.get_affinity(pool, block).await? else {
            return Ok(false);
        };
        if let Some((b, _)) = self.blocks.get_block(pool, block).await? {
            if !b.is_empty() {
                debug!("block {block} still has allocations, keeping affinity");
                return Ok(false);
            }
        }
        let released = swap_json::<Affinity>(
            self.store.as_ref(),
            &self.keys.affinity(pool, block),
            version,
            None,
        )
        .await?
        .is_some();
        if released {
            info!("released affinity of host {} on block {block}", affinity.host);
        } else {
            debug!("affinity on block {block} changed, not releasing");
        }
        Ok(released)
    }

    /// Releases every affinity of `host` whose block is empty. Returns the
    /// released blocks.
    pub async fn release_host_affinities(&self, host: &str) -> Result<Vec<BlockId>> {
        let mut released = Vec::new();
        for affinity in self.affinities_for_host(host).await? {
            if self.release_affinity(&affinity.pool, affinity.block).await? {
                released.push(affinity.block);
            }
        }
        Ok(released)
    }

    /// Drops every affinity pointing into `pool`, once the pool is gone.
    pub async fn forget_pool(&self, pool: IpNetwork) -> Result<()> {
        let listed: Vec<(String, Affinity, Version)> =
            list_json(self.store.as_ref(), &self.keys.affinities(&pool)).await?;
        for (key, _, version) in listed {
            if swap_json::<Affinity>(self.store.as_ref(), &key, version, None)
                .await?
                .is_none()
            {
                return Err(IpamError::Contention(key));
            }
        }
        Ok(())
    }
}
