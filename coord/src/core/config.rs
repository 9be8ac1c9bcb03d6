use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::info;

use common::constants::DEFAULT_BLOCK_SIZE;
use common::error::{StoreError, StoreResult};

use crate::core::node::NodeSpec;
use crate::core::placement::PlacementConfig;
use crate::core::rebalance::RebalanceConfig;
use crate::core::remote::{RemoteExecutor, probe_latency};

const DEFAULT_LATENCY: f64 = 1.0;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    pub host: String,
    pub capacity: u64,
    /// Round-trip estimate in ms; probed or defaulted when absent.
    #[serde(default)]
    pub latency: Option<f64>,
}

/// Cluster description, read from a JSON file.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ClusterConfig {
    #[serde(default = "default_root_path")]
    pub root_path: String,
    #[serde(default = "default_block_size")]
    pub block_size: u64,
    pub nodes: Vec<NodeConfig>,
    #[serde(flatten)]
    pub placement: PlacementConfig,
    #[serde(flatten)]
    pub rebalance: RebalanceConfig,
    #[serde(default)]
    pub workers: Option<usize>,
    /// Per remote command, e.g. "30s". Unbounded when absent.
    #[serde(default)]
    pub command_timeout: Option<String>,
}

fn default_root_path() -> String {
    "/tmp/psl/".to_string()
}

fn default_block_size() -> u64 {
    DEFAULT_BLOCK_SIZE
}

impl ClusterConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let cfg: ClusterConfig = serde_json::from_slice(&raw)
            .with_context(|| format!("parsing {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.nodes.is_empty() {
            return Err(StoreError::Config("cluster has no nodes".into()));
        }
        if self.block_size == 0 {
            return Err(StoreError::Config("block size must be positive".into()));
        }
        self.placement.validate()?;
        self.rebalance.validate()?;
        self.command_timeout()?;
        Ok(())
    }

    pub fn hosts(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.host.clone()).collect()
    }

    pub fn command_timeout(&self) -> StoreResult<Option<Duration>> {
        self.command_timeout
            .as_deref()
            .map(|s| {
                humantime::parse_duration(s)
                    .map_err(|e| StoreError::Config(format!("command_timeout {s:?}: {e}")))
            })
            .transpose()
    }

    /// Resolves each node's latency. With a `probe` executor, nodes without
    /// a configured latency are measured once.
    pub fn node_specs(&self, probe: Option<&dyn RemoteExecutor>) -> StoreResult<Vec<NodeSpec>> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(id, n)| {
                let latency = match (n.latency, probe) {
                    (Some(l), _) => l,
                    (None, Some(executor)) => {
                        let l = probe_latency(executor, id)?;
                        info!(node = id, host = %n.host, latency_ms = l, "probed latency");
                        l
                    }
                    (None, None) => DEFAULT_LATENCY,
                };
                Ok(NodeSpec {
                    host: n.host.clone(),
                    capacity: n.capacity,
                    latency,
                })
            })
            .collect()
    }
}
