use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use common::constants::N_PRIORITIES;
use common::error::{StoreError, StoreResult};

use crate::core::catalog::{FileCatalog, FileEntry};
use crate::core::config::ClusterConfig;
use crate::core::ledger::ClusterLedger;
use crate::core::meta::{MetadataStore, PersistedState};
use crate::core::node::{NodeId, NodeView, Priority};
use crate::core::placement::PlacementPolicy;
use crate::core::rebalance::{RebalancePlan, RebalanceReport, RebalancingController};
use crate::core::remote::RemoteExecutor;
use crate::core::scheduler::{BatchHandle, BatchReport, Operation, StepTimings, SubmitMode, TaskScheduler};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NodeStats {
    #[serde(flatten)]
    pub view: NodeView,
    pub files: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ClusterStats {
    pub block_size: u64,
    pub free_fraction: f64,
    /// Cumulative blocks placed per tier since the cluster was created.
    pub placed_blocks: [u64; N_PRIORITIES],
    /// Files currently stored per tier.
    pub live_files: [usize; N_PRIORITIES],
    pub nodes: Vec<NodeStats>,
}

/// Shared handle to the engine: catalog, worker pool, rebalancer and the
/// metadata store they persist into.
#[derive(Clone)]
pub struct CoordinatorState {
    catalog: Arc<FileCatalog>,
    scheduler: Arc<TaskScheduler>,
    rebalancer: Arc<RebalancingController>,
    store: Arc<dyn MetadataStore>,
    // serializes snapshot + save
    persist_lock: Arc<Mutex<()>>,
    // one rebalancing pass at a time
    rebalance_lock: Arc<Mutex<()>>,
}

impl CoordinatorState {
    /// Restores the cluster from `store`, or starts it empty from `cfg`.
    ///
    /// A persisted snapshot wins over the config for capacity, latency and
    /// block size. `probe` measures latencies of a fresh cluster.
    pub fn open(
        cfg: &ClusterConfig,
        store: Arc<dyn MetadataStore>,
        executor: Arc<dyn RemoteExecutor>,
        probe: bool,
    ) -> StoreResult<Self> {
        Self::open_with_timings(cfg, store, executor, probe, None)
    }

    pub fn open_with_timings(
        cfg: &ClusterConfig,
        store: Arc<dyn MetadataStore>,
        executor: Arc<dyn RemoteExecutor>,
        probe: bool,
        timings: Option<Arc<StepTimings>>,
    ) -> StoreResult<Self> {
        cfg.validate()?;

        let (ledger, files) = match store.load()? {
            Some(PersistedState { cluster, files }) => {
                if cluster.hosts.len() != cfg.nodes.len() {
                    return Err(StoreError::Config(format!(
                        "persisted cluster has {} nodes, config has {}",
                        cluster.hosts.len(),
                        cfg.nodes.len()
                    )));
                }
                if cluster.hosts != cfg.hosts() {
                    warn!("config hosts differ from the persisted cluster; using config hosts for dispatch");
                }
                info!(files = files.len(), "restored cluster state");
                (ClusterLedger::from_snapshot(&cluster)?, files)
            }
            None => {
                let probe_with = probe.then_some(executor.as_ref());
                let specs = cfg.node_specs(probe_with)?;
                info!(nodes = specs.len(), "starting empty cluster");
                (ClusterLedger::new(&specs, cfg.block_size)?, BTreeMap::new())
            }
        };

        let policy = PlacementPolicy::new(cfg.placement.clone());
        let catalog = Arc::new(
            FileCatalog::new(Arc::new(ledger), policy.clone(), executor, cfg.root_path.clone())
                .with_entries(files)?,
        );

        let mut scheduler = TaskScheduler::new(catalog.clone(), cfg.workers);
        if let Some(timings) = timings {
            scheduler = scheduler.with_timings(timings);
        }

        Ok(Self {
            catalog,
            scheduler: Arc::new(scheduler),
            rebalancer: Arc::new(RebalancingController::new(cfg.rebalance.clone(), policy)),
            store,
            persist_lock: Arc::new(Mutex::new(())),
            rebalance_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn catalog(&self) -> &Arc<FileCatalog> {
        &self.catalog
    }

    pub fn ledger(&self) -> &Arc<ClusterLedger> {
        self.catalog.ledger()
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    /// Creates a file and persists. Metadata is persisted even when the
    /// remote write failed, since the entry has been recorded.
    pub fn create(
        &self,
        name: &str,
        size: u64,
        priority: Priority,
        node: Option<NodeId>,
    ) -> StoreResult<FileEntry> {
        let res = self.catalog.create(name, size, priority, node);
        self.persist_after(&res)?;
        res
    }

    pub fn delete(&self, name: &str) -> StoreResult<FileEntry> {
        let res = self.catalog.delete(name);
        self.persist_after(&res)?;
        res
    }

    fn persist_after<T>(&self, res: &StoreResult<T>) -> StoreResult<()> {
        match res {
            Ok(_) | Err(StoreError::RemoteExecFailure { .. }) => self.persist(),
            Err(_) => Ok(()),
        }
    }

    pub fn retrieve(&self, name: &str, destination: &Path) -> StoreResult<()> {
        self.catalog.retrieve(name, destination)
    }

    pub fn get(&self, name: &str) -> Option<FileEntry> {
        self.catalog.get(name)
    }

    pub fn list(&self) -> BTreeMap<String, FileEntry> {
        self.catalog.list()
    }

    /// Queues a batch. A blocking batch is persisted once it has drained;
    /// a detached one is left to the caller.
    pub fn submit_batch(&self, ops: Vec<Operation>, mode: SubmitMode) -> StoreResult<BatchHandle> {
        let handle = self.scheduler.submit(ops, mode)?;
        if mode == SubmitMode::Blocking {
            self.persist()?;
        }
        Ok(handle)
    }

    /// Runs a batch to completion and persists.
    pub fn run_batch(&self, ops: Vec<Operation>) -> StoreResult<BatchReport> {
        Ok(self.submit_batch(ops, SubmitMode::Blocking)?.join())
    }

    pub fn needs_rebalance(&self) -> bool {
        self.rebalancer.needs_rebalance(self.ledger())
    }

    pub fn plan_rebalance(&self) -> StoreResult<RebalancePlan> {
        self.rebalancer.plan(&self.catalog)
    }

    /// Runs a rebalancing pass. Persists only if something was moved or
    /// attempted. Concurrent calls run one after the other, each planning
    /// against what the previous one left.
    pub fn rebalance(&self) -> StoreResult<RebalanceReport> {
        let _running = self.rebalance_lock.lock();
        let report = self.rebalancer.run(&self.scheduler)?;
        if report.planned > 0 {
            self.persist()?;
        }
        Ok(report)
    }

    pub fn rebalance_if_needed(&self) -> StoreResult<Option<RebalanceReport>> {
        if !self.needs_rebalance() {
            return Ok(None);
        }
        self.rebalance().map(Some)
    }

    pub fn stats(&self) -> StoreResult<ClusterStats> {
        let ledger = self.ledger();
        let files = self.catalog.files_per_node();
        let nodes = (0..ledger.len())
            .map(|id| {
                Ok(NodeStats {
                    view: ledger.view(id)?,
                    files: files.get(id).copied().unwrap_or(0),
                })
            })
            .collect::<StoreResult<Vec<_>>>()?;

        Ok(ClusterStats {
            block_size: ledger.block_size(),
            free_fraction: ledger.free_fraction(),
            placed_blocks: ledger.placed_blocks(),
            live_files: self.catalog.files_per_priority(),
            nodes,
        })
    }

    /// Saves the ledger and catalog as one unit.
    pub fn persist(&self) -> StoreResult<()> {
        let _guard = self.persist_lock.lock();
        let (cluster, files) = self.catalog.image();
        self.store.save(&PersistedState { cluster, files })
    }
}
