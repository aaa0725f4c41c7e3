pub mod affinity;
pub mod binding;
pub mod block;
pub mod config;
pub mod driver;
pub mod error;
pub mod ip;
pub mod keys;
pub mod pool;
pub mod retry;
pub mod service;
pub mod store;

// re-export selected public API
pub use affinity::{Affinity, AffinityManager};
pub use binding::NetworkBinding;
pub use block::{Block, BlockAllocator, BlockId, Owner, Released};
pub use config::{IpamConfig, IpamSettings, load_config};
pub use driver::IpamDriver;
pub use error::{IpamError, Result};
pub use pool::{Pool, PoolId, PoolOptions, PoolStore};
pub use retry::RetryPolicy;
pub use service::{AllocateRequest, Allocation, IpamService};
pub use store::{KvStore, MemoryStore, XlineStore};
