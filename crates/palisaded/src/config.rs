//! TOML configuration of the proxy.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use nodes::NodeConfig;

fn default_listen_addr() -> String {
    "0.0.0.0:2305".to_string()
}

fn default_graceful_stop_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_failover_timeout() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElectionStrategy {
    #[default]
    PerRepository,
    PerVirtualStorage,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Name this proxy instance reports in health observations. Must be
    /// stable across restarts and unique within the fleet.
    pub proxy_name: Option<String>,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    pub tls_listen_addr: Option<String>,
    pub socket_path: Option<PathBuf>,
    pub prometheus_listen_addr: Option<String>,

    /// Address storage nodes use to reach this proxy for vote callbacks.
    /// Defaults to the plain listen address.
    pub advertise_addr: Option<String>,

    #[serde(with = "humantime_serde", default = "default_graceful_stop_timeout")]
    pub graceful_stop_timeout: Duration,

    #[serde(default)]
    pub failover: FailoverConfig,

    /// Assignments stored per repository at creation; 0 assigns every
    /// configured storage.
    #[serde(default)]
    pub default_replication_factor: usize,

    #[serde(default)]
    pub database: Option<DatabaseConfig>,

    #[serde(default)]
    pub tls: Option<TlsConfig>,

    #[serde(rename = "virtual_storage")]
    pub virtual_storages: Vec<VirtualStorageConfig>,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FailoverConfig {
    #[serde(default)]
    pub election_strategy: ElectionStrategy,
    #[serde(with = "humantime_serde", default = "default_failover_timeout")]
    pub failover_timeout: Duration,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            election_strategy: ElectionStrategy::default(),
            failover_timeout: default_failover_timeout(),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    pub certificate_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VirtualStorageConfig {
    pub name: String,
    #[serde(rename = "node")]
    pub nodes: Vec<VirtualStorageNode>,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VirtualStorageNode {
    pub storage: String,
    /// gRPC endpoint, e.g. `http://node-a.internal:2306` or
    /// `unix:///var/run/vault.sock`.
    pub address: String,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.virtual_storages.is_empty(),
            "at least one virtual storage must be configured"
        );
        for virtual_storage in &self.virtual_storages {
            anyhow::ensure!(
                !virtual_storage.nodes.is_empty(),
                "virtual storage {:?} has no nodes",
                virtual_storage.name
            );
            if self.default_replication_factor > virtual_storage.nodes.len() {
                anyhow::bail!(
                    "default replication factor {} exceeds the {} nodes of {:?}",
                    self.default_replication_factor,
                    virtual_storage.nodes.len(),
                    virtual_storage.name
                );
            }
        }
        Ok(())
    }

    /// The flattened node list the pool dials.
    pub fn node_configs(&self) -> Vec<NodeConfig> {
        self.virtual_storages
            .iter()
            .flat_map(|virtual_storage| {
                virtual_storage.nodes.iter().map(|node| NodeConfig {
                    virtual_storage: virtual_storage.name.clone(),
                    storage: node.storage.clone(),
                    address: node.address.clone(),
                })
            })
            .collect()
    }

    /// Storage names per virtual storage, as the stores expect them.
    pub fn configured_storages(&self) -> HashMap<String, Vec<String>> {
        self.virtual_storages
            .iter()
            .map(|virtual_storage| {
                (
                    virtual_storage.name.clone(),
                    virtual_storage
                        .nodes
                        .iter()
                        .map(|node| node.storage.clone())
                        .collect(),
                )
            })
            .collect()
    }

    /// A stable-enough instance name when none is configured.
    pub fn proxy_name(&self) -> String {
        self.proxy_name.clone().unwrap_or_else(|| {
            let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "palisade".to_string());
            format!("{host}:{}", self.listen_addr)
        })
    }

    pub fn advertise_addr(&self) -> String {
        self.advertise_addr
            .clone()
            .unwrap_or_else(|| format!("tcp://{}", self.listen_addr))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const EXAMPLE: &str = r#"
listen_addr = "0.0.0.0:2305"
prometheus_listen_addr = "0.0.0.0:9652"
graceful_stop_timeout = "30s"
default_replication_factor = 2

[failover]
election_strategy = "per_repository"
failover_timeout = "10s"

[database]
url = "postgres://palisade@localhost/palisade"

[[virtual_storage]]
name = "default"

[[virtual_storage.node]]
storage = "node-a"
address = "http://node-a.internal:2306"

[[virtual_storage.node]]
storage = "node-b"
address = "http://node-b.internal:2306"
"#;

    #[test]
    fn parses_the_example_config() {
        let config: Config = toml::from_str(EXAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.graceful_stop_timeout, Duration::from_secs(30));
        assert_eq!(config.failover.failover_timeout, Duration::from_secs(10));
        assert_eq!(config.failover.election_strategy, ElectionStrategy::PerRepository);
        assert_eq!(config.node_configs().len(), 2);
        assert_eq!(
            config.configured_storages()["default"],
            vec!["node-a".to_string(), "node-b".to_string()]
        );
        assert_eq!(config.advertise_addr(), "tcp://0.0.0.0:2305");
    }

    #[test]
    fn rejects_an_oversized_replication_factor() {
        let mut config: Config = toml::from_str(EXAMPLE).unwrap();
        config.default_replication_factor = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_virtual_storages() {
        let config: Config = toml::from_str("[[virtual_storage]]\nname = \"empty\"\nnode = []").unwrap();
        assert!(config.validate().is_err());
    }
}
