use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use log::info;
use serde::{Deserialize, Serialize};

use crate::keys::DEFAULT_PREFIX;
use crate::pool::BlockSizes;
use crate::retry::RetryPolicy;
use crate::service::IpamService;
use crate::store::{KvStore, MemoryStore, XlineStore};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpamConfig {
    // Allocating host; the system hostname when unset.
    pub hostname: Option<String>,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    pub block_size_v4: Option<u8>,
    pub block_size_v6: Option<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Xline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

fn default_timeout_ms() -> u64 {
    5000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            endpoints: Vec::new(),
            prefix: default_prefix(),
            username: None,
            password: None,
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Everything the service needs besides the store itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpamSettings {
    pub prefix: String,
    pub retry: RetryPolicy,
    pub block_sizes: BlockSizes,
}

impl Default for IpamSettings {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            retry: RetryPolicy::default(),
            block_sizes: BlockSizes::default(),
        }
    }
}

pub fn load_config(path: &str) -> Result<IpamConfig> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read config from {path}"))?;
    let cfg: IpamConfig = serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    cfg.validate()?;
    Ok(cfg)
}

impl IpamConfig {
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.backoff_base_ms > self.retry.backoff_max_ms {
            bail!("retry.backoff_base_ms must not exceed retry.backoff_max_ms");
        }
        if self.store.backend == StoreBackend::Xline && self.store.endpoints.is_empty() {
            bail!("store.endpoints is required for the xline backend");
        }
        if self.block_size_v4.is_some_and(|s| s > 32) {
            bail!("block_size_v4 must be at most 32");
        }
        if self.block_size_v6.is_some_and(|s| s > 128) {
            bail!("block_size_v6 must be at most 128");
        }
        Ok(())
    }

    pub fn hostname(&self) -> Result<String> {
        if let Some(name) = &self.hostname {
            return Ok(name.clone());
        }
        let name = nix::unistd::gethostname().context("Failed to read system hostname")?;
        name.into_string()
            .map_err(|raw| anyhow::anyhow!("hostname {raw:?} is not valid UTF-8"))
    }

    pub fn settings(&self) -> IpamSettings {
        let defaults = BlockSizes::default();
        IpamSettings {
            prefix: self.store.prefix.clone(),
            retry: self.retry.clone(),
            block_sizes: BlockSizes {
                v4: self.block_size_v4.unwrap_or(defaults.v4),
                v6: self.block_size_v6.unwrap_or(defaults.v6),
            },
        }
    }

    /// Opens the configured store and builds a service on top of it.
    pub async fn connect(&self) -> Result<IpamService> {
        let store: Arc<dyn KvStore> = match self.store.backend {
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            StoreBackend::Xline => Arc::new(
                XlineStore::connect(&self.store)
                    .await
                    .context("Failed to connect to xline")?,
            ),
        };
        info!(
            "ipam store: {:?} under {}",
            self.store.backend, self.store.prefix
        );
        Ok(IpamService::new(store, self.settings()))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_full_config() {
        let file = write_config(
            r#"
hostname: node-1
store:
  backend: xline
  endpoints:
    - "http://127.0.0.1:2379"
  prefix: /registry/ipam-test
  username: root
  password: secret
  timeout_ms: 1500
retry:
  max_attempts: 8
  backoff_base_ms: 10
  backoff_max_ms: 200
block_size_v4: 24
"#,
        );
        let cfg = load_config(file.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.hostname().unwrap(), "node-1");
        assert_eq!(cfg.store.backend, StoreBackend::Xline);
        assert_eq!(cfg.store.timeout_ms, 1500);
        assert_eq!(cfg.retry.max_attempts, 8);

        let settings = cfg.settings();
        assert_eq!(settings.prefix, "/registry/ipam-test");
        assert_eq!(settings.block_sizes, BlockSizes { v4: 24, v6: 122 });
    }

    #[test]
    fn test_defaults() {
        let file = write_config("hostname: node-1\n");
        let cfg = load_config(file.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.store.backend, StoreBackend::Memory);
        assert_eq!(cfg.store.prefix, DEFAULT_PREFIX);
        assert_eq!(cfg.retry, RetryPolicy::default());
        assert_eq!(cfg.settings(), IpamSettings::default());
    }

    #[test]
    fn test_hostname_falls_back_to_system() {
        let cfg = IpamConfig::default();
        assert!(!cfg.hostname().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_configs() {
        for content in [
            "store:\n  backend: xline\n",
            "retry:\n  max_attempts: 0\n",
            "retry:\n  backoff_base_ms: 500\n  backoff_max_ms: 100\n",
            "block_size_v4: 40\n",
            "store:\n  backend: consul\n",
        ] {
            let file = write_config(content);
            assert!(
                load_config(file.path().to_str().unwrap()).is_err(),
                "{content}"
            );
        }
        assert!(load_config("/nonexistent/ipam.yaml").is_err());
    }

    #[tokio::test]
    async fn test_connect_memory_backend() {
        let cfg = IpamConfig {
            hostname: Some("node-1".to_string()),
            ..IpamConfig::default()
        };
        let service = cfg.connect().await.unwrap();
        assert!(service.pools().list_pools().await.unwrap().is_empty());
    }
}
