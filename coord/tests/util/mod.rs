#![allow(dead_code)]

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use coord::core::catalog::FileCatalog;
use coord::core::config::{ClusterConfig, NodeConfig};
use coord::core::ledger::ClusterLedger;
use coord::core::meta::{MemoryStore, MetadataStore};
use coord::core::node::{NodeId, NodeSpec};
use coord::core::placement::{PlacementConfig, PlacementPolicy};
use coord::core::rebalance::RebalanceConfig;
use coord::core::remote::{RemoteExecutor, RemoteStatus};
use coord::core::state::CoordinatorState;

pub const ROOT: &str = "/tmp/psl/";

/// Executor that records every call and fails on demand per node.
#[derive(Default)]
pub struct RecordingExecutor {
    commands: Mutex<Vec<(NodeId, String)>>,
    copies: Mutex<Vec<(NodeId, String, PathBuf)>>,
    failing: Mutex<HashSet<NodeId>>,
    delay: Mutex<Option<Duration>>,
}

impl RecordingExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_node(&self, node: NodeId) {
        self.failing.lock().insert(node);
    }

    pub fn heal_node(&self, node: NodeId) {
        self.failing.lock().remove(&node);
    }

    /// Every later command takes at least `delay`.
    pub fn slow_down(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn commands(&self) -> Vec<(NodeId, String)> {
        self.commands.lock().clone()
    }

    pub fn commands_for(&self, node: NodeId) -> Vec<String> {
        self.commands
            .lock()
            .iter()
            .filter(|(n, _)| *n == node)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn copies(&self) -> Vec<(NodeId, String, PathBuf)> {
        self.copies.lock().clone()
    }

    pub fn clear(&self) {
        self.commands.lock().clear();
        self.copies.lock().clear();
    }

    fn status(&self, node: NodeId) -> RemoteStatus {
        if self.failing.lock().contains(&node) {
            RemoteStatus { code: Some(1) }
        } else {
            RemoteStatus::SUCCESS
        }
    }
}

impl RemoteExecutor for RecordingExecutor {
    fn execute(&self, node: NodeId, command: &str) -> io::Result<RemoteStatus> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        self.commands.lock().push((node, command.to_string()));
        Ok(self.status(node))
    }

    fn copy(
        &self,
        node: NodeId,
        remote_path: &str,
        destination: &Path,
    ) -> io::Result<RemoteStatus> {
        self.copies
            .lock()
            .push((node, remote_path.to_string(), destination.to_path_buf()));
        Ok(self.status(node))
    }
}

/// Equal-latency nodes with the given capacities.
pub fn sized(capacities: &[u64]) -> Vec<NodeSpec> {
    capacities
        .iter()
        .enumerate()
        .map(|(i, &capacity)| NodeSpec {
            host: format!("node-{i}"),
            capacity,
            latency: 1.0,
        })
        .collect()
}

pub fn specs(n: usize, capacity: u64, latency: f64) -> Vec<NodeSpec> {
    (0..n)
        .map(|i| NodeSpec {
            host: format!("node-{i}"),
            capacity,
            latency,
        })
        .collect()
}

/// Catalog over `specs` with the default placement policy.
pub fn catalog(specs: &[NodeSpec], block_size: u64) -> (Arc<FileCatalog>, Arc<RecordingExecutor>) {
    let ledger = Arc::new(ClusterLedger::new(specs, block_size).expect("valid specs"));
    let exec = RecordingExecutor::new();
    let catalog = FileCatalog::new(
        ledger,
        PlacementPolicy::default(),
        exec.clone() as Arc<dyn RemoteExecutor>,
        ROOT,
    );
    (Arc::new(catalog), exec)
}

pub fn config(n: usize, capacity: u64, block_size: u64) -> ClusterConfig {
    ClusterConfig {
        root_path: ROOT.to_string(),
        block_size,
        nodes: (0..n)
            .map(|i| NodeConfig {
                host: format!("node-{i}"),
                capacity,
                latency: Some(1.0),
            })
            .collect(),
        placement: PlacementConfig::default(),
        rebalance: RebalanceConfig::default(),
        workers: Some(4),
        command_timeout: None,
    }
}

pub struct TestCoordinator {
    pub state: CoordinatorState,
    pub exec: Arc<RecordingExecutor>,
    pub store: Arc<MemoryStore>,
}

impl TestCoordinator {
    pub fn new(cfg: &ClusterConfig) -> anyhow::Result<Self> {
        let store = Arc::new(MemoryStore::new());
        let exec = RecordingExecutor::new();
        let state = CoordinatorState::open(
            cfg,
            store.clone() as Arc<dyn MetadataStore>,
            exec.clone() as Arc<dyn RemoteExecutor>,
            false,
        )?;
        Ok(Self { state, exec, store })
    }
}
