use std::net::IpAddr;

use ipnetwork::IpNetwork;

use crate::block::BlockId;

pub const DEFAULT_PREFIX: &str = "/registry/ipam";

/// Keys never contain `/` inside a CIDR; `10.15.0.0/26` becomes `10.15.0.0-26`.
pub fn make_cidr_key(net: &IpNetwork) -> String {
    net.to_string().replace('/', "-")
}

pub fn parse_cidr_key(s: &str) -> Option<IpNetwork> {
    let (ip, prefix) = s.rsplit_once('-')?;
    let ip: IpAddr = ip.parse().ok()?;
    IpNetwork::new(ip, prefix.parse().ok()?).ok()
}

/// Layout of every record under the configured prefix.
#[derive(Debug, Clone)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix: String = prefix.into();
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn pools(&self) -> String {
        format!("{}/pools", self.prefix)
    }

    pub fn blocks(&self, pool: &IpNetwork) -> String {
        format!("{}/blocks/{}/", self.prefix, make_cidr_key(pool))
    }

    pub fn block(&self, pool: &IpNetwork, id: BlockId) -> String {
        format!("{}{}", self.blocks(pool), make_cidr_key(&id.cidr()))
    }

    pub fn all_affinities(&self) -> String {
        format!("{}/affinities/", self.prefix)
    }

    pub fn affinities(&self, pool: &IpNetwork) -> String {
        format!("{}{}/", self.all_affinities(), make_cidr_key(pool))
    }

    pub fn affinity(&self, pool: &IpNetwork, block: BlockId) -> String {
        format!("{}{}", self.affinities(pool), make_cidr_key(&block.cidr()))
    }

    pub fn all_allocations(&self) -> String {
        format!("{}/allocations/", self.prefix)
    }

    pub fn allocations(&self, pool: &IpNetwork) -> String {
        format!("{}{}/", self.all_allocations(), make_cidr_key(pool))
    }

    pub fn allocation(&self, pool: &IpNetwork, addr: IpAddr) -> String {
        format!("{}{}", self.allocations(pool), addr)
    }

    pub fn networks(&self) -> String {
        format!("{}/networks/", self.prefix)
    }

    pub fn network(&self, name: &str) -> String {
        format!("{}{}", self.networks(), name)
    }
}

impl Default for Keys {
    fn default() -> Self {
        Keys::new(DEFAULT_PREFIX)
    }
}
