use std::net::IpAddr;

use ipnetwork::IpNetwork;

use crate::block::BlockId;
use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, IpamError>;

#[derive(Debug, thiserror::Error)]
pub enum IpamError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("{0} is still in use")]
    InUse(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("pool {0} has no free blocks left")]
    PoolExhausted(IpNetwork),
    #[error("address {0} is already allocated")]
    AddressInUse(IpAddr),
    #[error("address {0} is out of range")]
    AddressOutOfRange(IpAddr),
    #[error("gave up on {0} after too many concurrent updates")]
    Contention(String),
    #[error("no addresses available for network {0}")]
    NoAddressesAvailable(String),
    #[error("allocation record for {1} in pool {0} already exists")]
    AllocationConflict(IpNetwork, IpAddr),
    #[error("pool {0} does not exist")]
    UnknownPool(IpNetwork),
    #[error("network {0} is already bound")]
    AlreadyBound(String),
    #[error("pool {0} is disabled")]
    PoolDisabled(IpNetwork),
    #[error("invalid pool: {0}")]
    InvalidPool(String),
    #[error("invalid network: {0}")]
    InvalidNetwork(String),
    #[error("block {0} is full")]
    BlockFull(BlockId),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Codec(#[from] serde_json::Error),
}
