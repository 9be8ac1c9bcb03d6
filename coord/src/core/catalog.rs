use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use common::constants::N_PRIORITIES;
use common::error::{StoreError, StoreResult};
use common::key_utils::{parent_dir, remote_path, validate_name};
use common::time_utils::{EpochMs, utc_now_ms};

use crate::core::ledger::{ClusterLedger, ClusterSnapshot};
use crate::core::node::{NodeId, Priority};
use crate::core::placement::PlacementPolicy;
use crate::core::remote::{RemoteExecutor, check};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FileEntry {
    pub node_id: NodeId,
    pub priority: Priority,
    pub size: u64,
    pub created_at: EpochMs,
    pub modified_at: EpochMs,
}

/// Name → placement record, plus the physical dispatch of each operation.
///
/// Metadata changes are applied before the remote command runs and are not
/// undone if it fails; callers reconcile by re-listing.
pub struct FileCatalog {
    ledger: Arc<ClusterLedger>,
    policy: PlacementPolicy,
    executor: Arc<dyn RemoteExecutor>,
    root_path: String,
    entries: DashMap<String, FileEntry>,
    // shared by every ledger + entry change, exclusive for `image`
    gate: RwLock<()>,
}

impl FileCatalog {
    pub fn new(
        ledger: Arc<ClusterLedger>,
        policy: PlacementPolicy,
        executor: Arc<dyn RemoteExecutor>,
        root_path: impl Into<String>,
    ) -> Self {
        Self {
            ledger,
            policy,
            executor,
            root_path: root_path.into(),
            entries: DashMap::new(),
            gate: RwLock::new(()),
        }
    }

    /// Loads previously persisted entries. Their blocks are assumed to be
    /// already accounted for in the ledger.
    pub fn with_entries(self, entries: BTreeMap<String, FileEntry>) -> StoreResult<Self> {
        for (name, entry) in entries {
            self.ledger.check_node(entry.node_id)?;
            self.entries.insert(name, entry);
        }
        Ok(self)
    }

    pub fn ledger(&self) -> &Arc<ClusterLedger> {
        &self.ledger
    }

    pub fn policy(&self) -> &PlacementPolicy {
        &self.policy
    }

    pub fn path_of(&self, name: &str) -> String {
        remote_path(&self.root_path, name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<FileEntry> {
        self.entries.get(name).map(|e| e.value().clone())
    }

    /// Ordered snapshot of every entry.
    pub fn list(&self) -> BTreeMap<String, FileEntry> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Ledger snapshot and entries taken together, with no placement,
    /// removal or move half applied in between.
    pub fn image(&self) -> (ClusterSnapshot, BTreeMap<String, FileEntry>) {
        let _gate = self.gate.write();
        (self.ledger.snapshot(), self.list())
    }

    /// Places and records a new file, then writes it on its node.
    ///
    /// With `node` set, the block is billed straight to that node and the
    /// placement policy and priority counters are bypassed.
    #[tracing::instrument(name = "catalog.create", skip(self))]
    pub fn create(
        &self,
        name: &str,
        size: u64,
        priority: Priority,
        node: Option<NodeId>,
    ) -> StoreResult<FileEntry> {
        validate_name(name)?;

        let gate = self.gate.read();
        // the shard entry stays locked until the record is in, so two
        // creates of one name cannot both reserve
        let entry = match self.entries.entry(name.to_string()) {
            Entry::Occupied(_) => return Err(StoreError::AlreadyExists(name.to_string())),
            Entry::Vacant(slot) => {
                let node_id = match node {
                    Some(id) => {
                        self.ledger.reserve(id)?;
                        id
                    }
                    None => self.policy.place(&self.ledger, priority)?,
                };
                let now = utc_now_ms();
                let entry = FileEntry {
                    node_id,
                    priority,
                    size,
                    created_at: now,
                    modified_at: now,
                };
                slot.insert(entry.clone());
                entry
            }
        };
        drop(gate);

        self.write_remote(name, size, entry.node_id)?;
        Ok(entry)
    }

    fn write_remote(&self, name: &str, size: u64, node_id: NodeId) -> StoreResult<()> {
        let dir = remote_path(&self.root_path, parent_dir(name));
        check(
            node_id,
            self.executor.execute(node_id, &format!("mkdir -p \"{dir}\"")),
        )?;
        check(
            node_id,
            self.executor.execute(
                node_id,
                &format!("head -c {size} </dev/urandom > \"{}\"", self.path_of(name)),
            ),
        )
    }

    /// Drops the record, credits its block back and removes the file.
    #[tracing::instrument(name = "catalog.delete", skip(self))]
    pub fn delete(&self, name: &str) -> StoreResult<FileEntry> {
        let entry = self.forget(name)?;
        self.remove_remote(name, entry.node_id)?;
        Ok(entry)
    }

    fn forget(&self, name: &str) -> StoreResult<FileEntry> {
        let _gate = self.gate.read();
        let (_, entry) = self
            .entries
            .remove(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        self.ledger.release(entry.node_id)?;
        Ok(entry)
    }

    fn remove_remote(&self, name: &str, node_id: NodeId) -> StoreResult<()> {
        check(
            node_id,
            self.executor
                .execute(node_id, &format!("rm -rf \"{}\"", self.path_of(name))),
        )
    }

    /// Copies a file to a local destination. Capacity is untouched.
    #[tracing::instrument(name = "catalog.retrieve", skip(self, destination), fields(dest = %destination.display()))]
    pub fn retrieve(&self, name: &str, destination: &Path) -> StoreResult<()> {
        let node_id = {
            let mut entry = self
                .entries
                .get_mut(name)
                .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
            entry.modified_at = utc_now_ms();
            entry.node_id
        };

        check(
            node_id,
            self.executor.copy(node_id, &self.path_of(name), destination),
        )
    }

    /// Moves a file to `target` with the same size and priority.
    ///
    /// The target block is reserved before the record changes, so a move
    /// that finds the target full leaves the file where it was. The copy on
    /// the target is written before the source copy is removed; if that
    /// write fails, the source copy is left in place.
    #[tracing::instrument(name = "catalog.move", skip(self))]
    pub fn move_file(&self, name: &str, target: NodeId) -> StoreResult<FileEntry> {
        let (old, new) = {
            let _gate = self.gate.read();
            let mut slot = self
                .entries
                .get_mut(name)
                .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
            if slot.node_id == target {
                return Ok(slot.clone());
            }
            self.ledger.reserve(target)?;

            let old = slot.clone();
            let now = utc_now_ms();
            slot.node_id = target;
            slot.created_at = now;
            slot.modified_at = now;
            let new = slot.clone();
            drop(slot);
            self.ledger.release(old.node_id)?;
            (old, new)
        };

        self.write_remote(name, new.size, target)?;
        self.remove_remote(name, old.node_id).inspect_err(|e| {
            warn!(name, error = %e, "old copy may remain on source node");
        })?;
        info!(name, from = old.node_id, to = target, "moved file");
        Ok(new)
    }

    /// Number of live files per node, indexed by `NodeId`.
    pub fn files_per_node(&self) -> Vec<usize> {
        let mut counts = vec![0; self.ledger.len()];
        for e in self.entries.iter() {
            if let Some(c) = counts.get_mut(e.node_id) {
                *c += 1;
            }
        }
        counts
    }

    /// Number of live files per priority tier.
    pub fn files_per_priority(&self) -> [usize; N_PRIORITIES] {
        let mut counts = [0; N_PRIORITIES];
        for e in self.entries.iter() {
            counts[e.priority.index()] += 1;
        }
        counts
    }
}
