use std::sync::Arc;

use ipnetwork::IpNetwork;
use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{IpamError, Result};
use crate::keys::Keys;
use crate::store::{KvStore, Version, get_json, list_json, swap_json};

/// The ordered pools a network draws its addresses from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkBinding {
    pub network: String,
    pub pools: Vec<IpNetwork>,
}

/// Network bindings, one record per network. A binding is fixed from
/// `bind` until `unbind`.
pub struct NetworkBindings {
    store: Arc<dyn KvStore>,
    keys: Keys,
}

impl NetworkBindings {
    pub fn new(store: Arc<dyn KvStore>, keys: Keys) -> Self {
        Self { store, keys }
    }

    /// Stores the binding; pool existence is checked by the caller.
    pub async fn bind(&self, network: &str, pools: Vec<IpNetwork>) -> Result<NetworkBinding> {
        if network.is_empty() || network.contains('/') {
            return Err(IpamError::InvalidNetwork(format!(
                "name {network:?} must be non-empty and contain no '/'"
            )));
        }
        if pools.is_empty() {
            return Err(IpamError::InvalidNetwork(format!(
                "network {network} must be bound to at least one pool"
            )));
        }
        let binding = NetworkBinding {
            network: network.to_string(),
            pools,
        };
        match swap_json(self.store.as_ref(), &self.keys.network(network), 0, Some(&binding)).await? {
            Some(_) => {
                info!("bound network {network} to pools {:?}", binding.pools);
                Ok(binding)
            }
            None => Err(IpamError::AlreadyBound(network.to_string())),
        }
    }

    pub async fn get(&self, network: &str) -> Result<Option<(NetworkBinding, Version)>> {
        get_json(self.store.as_ref(), &self.keys.network(network)).await
    }

    pub async fn resolve(&self, network: &str) -> Result<NetworkBinding> {
        self.get(network)
            .await?
            .map(|(b, _)| b)
            .ok_or_else(|| IpamError::NotFound(format!("network {network}")))
    }

    pub async fn unbind(&self, network: &str) -> Result<()> {
        let key = self.keys.network(network);
        let Some((_, version)) = self.get(network).await? else {
            return Err(IpamError::NotFound(format!("network {network}")));
        };
        if swap_json::<NetworkBinding>(self.store.as_ref(), &key, version, None)
            .await?
            .is_none()
        {
            return Err(IpamError::Contention(key));
        }
        info!("unbound network {network}");
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<NetworkBinding>> {
        let listed: Vec<(String, NetworkBinding, Version)> =
            list_json(self.store.as_ref(), &self.keys.networks()).await?;
        Ok(listed.into_iter().map(|(_, b, _)| b).collect())
    }
}
