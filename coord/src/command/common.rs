use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};
use clap::Args;
use tracing::info;

use crate::core::config::ClusterConfig;
use crate::core::meta::{JsonFileStore, KvDb, MetadataStore};
use crate::core::remote::{DryRunExecutor, RemoteExecutor, SshExecutor};
use crate::core::state::CoordinatorState;

/// Where the cluster is described and where its state is kept.
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// Cluster configuration (JSON)
    #[arg(long, default_value = "./cluster.json")]
    pub config: PathBuf,

    /// RocksDB index directory
    #[arg(long, conflicts_with = "metadata_json")]
    pub index: Option<PathBuf>,

    /// Keep metadata in a single JSON file instead of RocksDB
    #[arg(long)]
    pub metadata_json: Option<PathBuf>,

    /// Log remote commands instead of running them
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,

    /// Measure node latencies at startup when the config leaves them out
    #[arg(long, default_value_t = false)]
    pub probe_latency: bool,
}

impl StoreArgs {
    pub fn metadata_store(&self) -> Result<Arc<dyn MetadataStore>> {
        match (&self.index, &self.metadata_json) {
            (Some(index), None) => Ok(Arc::new(KvDb::open(index)?)),
            (None, Some(path)) => Ok(Arc::new(JsonFileStore::new(path))),
            (None, None) => Ok(Arc::new(KvDb::open(&PathBuf::from("./data/index"))?)),
            (Some(_), Some(_)) => bail!("--index and --metadata-json are exclusive"),
        }
    }

    pub fn executor(&self, cfg: &ClusterConfig) -> Result<Arc<dyn RemoteExecutor>> {
        if self.dry_run {
            return Ok(Arc::new(DryRunExecutor));
        }
        Ok(Arc::new(SshExecutor::new(cfg.hosts(), cfg.command_timeout()?)))
    }
}

pub fn open_state(args: &StoreArgs) -> Result<CoordinatorState> {
    let cfg = ClusterConfig::load(&args.config)?;
    let store = args.metadata_store()?;
    let executor = args.executor(&cfg)?;
    let state = CoordinatorState::open(&cfg, store, executor, args.probe_latency)?;
    info!(
        nodes = state.ledger().len(),
        files = state.catalog().len(),
        dry_run = args.dry_run,
        "cluster opened"
    );
    Ok(state)
}
