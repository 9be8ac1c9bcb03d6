use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use common::error::{StoreError, StoreResult};

use crate::core::catalog::FileCatalog;
use crate::core::ledger::ClusterLedger;
use crate::core::node::{NodeId, Priority};
use crate::core::placement::PlacementPolicy;
use crate::core::scheduler::{OpFailure, Operation, SubmitMode, TaskScheduler};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RebalanceConfig {
    /// Cluster (and per-node) utilization above which rebalancing is due and
    /// a node stops receiving moved files.
    pub reassign_threshold: f64,
    /// A simulated target this close (in node index) to the current node
    /// keeps the file where it is.
    pub damping: usize,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            reassign_threshold: 0.70,
            damping: 1,
        }
    }
}

impl RebalanceConfig {
    pub fn validate(&self) -> StoreResult<()> {
        if !(0.0..=1.0).contains(&self.reassign_threshold) {
            return Err(StoreError::Config(format!(
                "reassign threshold must lie in [0, 1]: {}",
                self.reassign_threshold
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PlannedMove {
    pub name: String,
    pub priority: Priority,
    pub from: NodeId,
    pub to: NodeId,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RebalancePlan {
    pub moves: Vec<PlannedMove>,
    /// Moves left out because their target would end up over the threshold
    /// or out of room.
    pub dropped: usize,
}

impl RebalancePlan {
    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RebalanceReport {
    pub planned: usize,
    pub dropped: usize,
    pub moved: usize,
    pub failures: Vec<OpFailure>,
}

/// Upper bound on replanning rounds before a plan is taken as is.
const MAX_PLAN_ROUNDS: usize = 16;

struct Tracked {
    name: String,
    priority: Priority,
    node: NodeId,
}

/// Bytes in use per node on the live cluster, with planned moves applied.
struct Projection {
    used: Vec<u64>,
    capacity: Vec<u64>,
    block_size: u64,
}

impl Projection {
    fn of(ledger: &ClusterLedger) -> StoreResult<Self> {
        let mut used = Vec::with_capacity(ledger.len());
        let mut capacity = Vec::with_capacity(ledger.len());
        for id in 0..ledger.len() {
            let view = ledger.view(id)?;
            used.push(view.capacity - view.available);
            capacity.push(view.capacity);
        }
        Ok(Self {
            used,
            capacity,
            block_size: ledger.block_size(),
        })
    }

    /// Whether one more block fits on `node` without pushing it past
    /// `threshold` or draining it.
    fn accepts(&self, node: NodeId, threshold: f64) -> bool {
        let after = self.used[node] + self.block_size;
        after < self.capacity[node] && after as f64 / self.capacity[node] as f64 <= threshold
    }

    fn shift(&mut self, from: NodeId, to: NodeId) {
        self.used[from] = self.used[from].saturating_sub(self.block_size);
        self.used[to] += self.block_size;
    }
}

#[derive(Default)]
struct Pass {
    moves: Vec<(usize, NodeId)>,
    dropped: usize,
}

/// Replays every placement against an empty shadow of the cluster and moves
/// the files that would land elsewhere today.
#[derive(Clone, Debug, Default)]
pub struct RebalancingController {
    cfg: RebalanceConfig,
    policy: PlacementPolicy,
}

impl RebalancingController {
    pub fn new(cfg: RebalanceConfig, policy: PlacementPolicy) -> Self {
        Self { cfg, policy }
    }

    pub fn config(&self) -> &RebalanceConfig {
        &self.cfg
    }

    pub fn needs_rebalance(&self, ledger: &ClusterLedger) -> bool {
        1.0 - ledger.free_fraction() > self.cfg.reassign_threshold
    }

    /// Computes the move set without touching the live cluster.
    ///
    /// Replay passes run against the cluster as it will look once the
    /// moves found so far are done, until a pass finds nothing new. The
    /// result is then stable: planning again after executing it yields no
    /// moves.
    #[tracing::instrument(name = "rebalance.plan", skip_all)]
    pub fn plan(&self, catalog: &FileCatalog) -> StoreResult<RebalancePlan> {
        let live = catalog.ledger();

        let mut files: Vec<Tracked> = catalog
            .list()
            .into_iter()
            .map(|(name, entry)| Tracked {
                name,
                priority: entry.priority,
                node: entry.node_id,
            })
            .collect();
        files.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        let origin: Vec<NodeId> = files.iter().map(|f| f.node).collect();

        let mut projected = Projection::of(live)?;
        let mut dropped = 0;
        let mut settled = false;
        for round in 0..MAX_PLAN_ROUNDS {
            let pass = self.pass(live, &files, &mut projected)?;
            dropped = pass.dropped;
            if pass.moves.is_empty() {
                settled = true;
                break;
            }
            debug!(round, moves = pass.moves.len(), "replan");
            for (i, to) in pass.moves {
                files[i].node = to;
            }
        }
        if !settled {
            warn!(rounds = MAX_PLAN_ROUNDS, "rebalance plan did not settle");
        }

        let moves: Vec<PlannedMove> = files
            .into_iter()
            .zip(origin)
            .filter(|(f, from)| f.node != *from)
            .map(|(f, from)| PlannedMove {
                name: f.name,
                priority: f.priority,
                from,
                to: f.node,
            })
            .collect();

        info!(moves = moves.len(), dropped, "rebalance planned");
        Ok(RebalancePlan { moves, dropped })
    }

    /// One replay of every file, in order, against a fresh shadow.
    fn pass(
        &self,
        live: &ClusterLedger,
        files: &[Tracked],
        projected: &mut Projection,
    ) -> StoreResult<Pass> {
        let shadow = live.shadow();
        let mut pass = Pass::default();

        for (i, f) in files.iter().enumerate() {
            let current = f.node;
            let mut chosen = match self.policy.choose(&shadow, f.priority) {
                Ok(candidate) if candidate.abs_diff(current) > self.cfg.damping => candidate,
                Ok(_) | Err(StoreError::NoCapacity) => current,
                Err(e) => return Err(e),
            };

            if chosen != current && !projected.accepts(chosen, self.cfg.reassign_threshold) {
                debug!(name = %f.name, to = chosen, "target would cross the threshold, move dropped");
                pass.dropped += 1;
                chosen = current;
            }

            // dropped and damped files are charged where they stay
            match shadow.reserve(chosen) {
                Ok(()) => shadow.record_placement(f.priority),
                Err(StoreError::NoCapacity) => {}
                Err(e) => return Err(e),
            }

            if chosen != current {
                projected.shift(current, chosen);
                pass.moves.push((i, chosen));
            }
        }
        Ok(pass)
    }

    /// Plans and executes the moves as blocking batches. Completed moves
    /// stay in place when others fail.
    #[tracing::instrument(name = "rebalance.run", skip_all)]
    pub fn run(&self, scheduler: &TaskScheduler) -> StoreResult<RebalanceReport> {
        let catalog = scheduler.catalog();
        let plan = self.plan(catalog)?;
        let mut report = RebalanceReport {
            planned: plan.moves.len(),
            dropped: plan.dropped,
            ..Default::default()
        };

        let mut pending = plan.moves;
        while !pending.is_empty() {
            let ops = pending
                .iter()
                .map(|m| Operation::Move {
                    name: m.name.clone(),
                    target: m.to,
                })
                .collect();
            let batch = scheduler.submit(ops, SubmitMode::Blocking)?.join();
            report.moved += batch.succeeded;

            // a move can find its target full while the moves off that
            // target are still queued; it gets another round once they are done
            let mut retry = Vec::new();
            for failure in batch.errors {
                let waiting = match pending.iter().find(|m| m.name == failure.name) {
                    Some(m) if batch.succeeded > 0 => still_waiting(catalog, m)?.then(|| m.clone()),
                    _ => None,
                };
                match waiting {
                    Some(m) => retry.push(m),
                    None => report.failures.push(failure),
                }
            }
            pending = retry;
        }

        info!(moved = report.moved, failed = report.failures.len(), "rebalance done");
        Ok(report)
    }
}

/// The file has not left its source and the target has room again.
fn still_waiting(catalog: &FileCatalog, m: &PlannedMove) -> StoreResult<bool> {
    let at_source = catalog.get(&m.name).is_some_and(|e| e.node_id == m.from);
    Ok(at_source && catalog.ledger().has_room(m.to)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::node::NodeSpec;

    #[test]
    fn test_needs_rebalance_past_threshold() {
        let specs: Vec<NodeSpec> = (0..2)
            .map(|i| NodeSpec {
                host: format!("n{i}"),
                capacity: 10,
                latency: 1.0,
            })
            .collect();
        let ledger = ClusterLedger::new(&specs, 1).unwrap();
        let ctl = RebalancingController::default();

        for _ in 0..7 {
            ledger.reserve(0).unwrap();
            ledger.reserve(1).unwrap();
        }
        // exactly 70% used
        assert!(!ctl.needs_rebalance(&ledger));
        ledger.reserve(0).unwrap();
        assert!(ctl.needs_rebalance(&ledger));
    }

    #[test]
    fn test_rejects_bad_threshold() {
        let cfg = RebalanceConfig {
            reassign_threshold: 1.5,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
