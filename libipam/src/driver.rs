use std::net::IpAddr;
use std::sync::Arc;

use ipnetwork::IpNetwork;
use log::info;

use crate::error::{IpamError, Result};
use crate::pool::Pool;
use crate::service::{AllocateRequest, Allocation, IpamService};

/// Entry points of the IPAM plugin for one host, mapped onto the service.
#[derive(Clone)]
pub struct IpamDriver {
    service: Arc<IpamService>,
    host: String,
}

impl IpamDriver {
    pub fn new(service: Arc<IpamService>, host: impl Into<String>) -> Self {
        Self {
            service,
            host: host.into(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn service(&self) -> &IpamService {
        &self.service
    }

    /// Binds `network` to the pool whose CIDR is exactly `subnet`, or to
    /// every enabled pool when no subnet is given.
    pub async fn request_pool(&self, network: &str, subnet: Option<IpNetwork>) -> Result<Vec<Pool>> {
        let pools = match subnet {
            Some(subnet) => {
                let pool = self
                    .service
                    .pools()
                    .get_pool(subnet)
                    .await?
                    .ok_or(IpamError::UnknownPool(subnet))?;
                vec![pool.cidr]
            }
            None => self
                .service
                .pools()
                .list_pools()
                .await?
                .into_iter()
                .filter(|p| p.enabled)
                .map(|p| p.cidr)
                .collect(),
        };
        if pools.is_empty() {
            return Err(IpamError::NoAddressesAvailable(network.to_string()));
        }
        self.service.bind_network(network, &pools).await?;
        info!("network {network} requested pools {pools:?}");
        self.service.network_pools(network).await
    }

    pub async fn release_pool(&self, network: &str) -> Result<()> {
        self.service.unbind_network(network).await
    }

    /// Allocates an address on `network` for a fresh workload handle. The
    /// result carries the prefix length of the pool it came from.
    pub async fn request_address(
        &self,
        network: &str,
        requested: Option<IpAddr>,
    ) -> Result<(IpNetwork, Allocation)> {
        let handle = uuid::Uuid::new_v4().to_string();
        let mut request = AllocateRequest::new(network, self.host.clone(), handle);
        if let Some(addr) = requested {
            request = request.with_address(addr);
        }
        let allocation = self.service.allocate(request).await?;
        let addr = IpNetwork::new(allocation.address, allocation.pool.prefix())
            .map_err(|e| IpamError::InvalidPool(e.to_string()))?;
        Ok((addr, allocation))
    }

    pub async fn release_address(&self, network: &str, addr: IpAddr) -> Result<()> {
        let pool = self
            .service
            .network_pools(network)
            .await?
            .into_iter()
            .find(|p| p.contains(addr))
            .ok_or(IpamError::AddressOutOfRange(addr))?;
        self.service.release(pool.cidr, addr).await
    }
}
