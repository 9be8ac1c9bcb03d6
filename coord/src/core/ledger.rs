use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use common::constants::N_PRIORITIES;
use common::error::{StoreError, StoreResult};

use crate::core::node::{NodeId, NodeSpec, NodeView, Priority};

/// Serializable image of the ledger. Per-node fields are parallel arrays
/// indexed by `NodeId`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ClusterSnapshot {
    pub block_size: u64,
    pub hosts: Vec<String>,
    pub capacity: Vec<u64>,
    pub available: Vec<u64>,
    pub latency: Vec<f64>,
    pub effective: Vec<f64>,
    pub placed_blocks: [u64; N_PRIORITIES],
}

#[derive(Debug)]
struct NodeState {
    available: u64,
    effective: f64,
}

#[derive(Debug)]
struct LedgerNode {
    host: String,
    capacity: u64,
    latency: f64,
    state: Mutex<NodeState>,
}

/// Capacity ledger of the cluster.
///
/// Each node's mutable state sits behind its own mutex, so reservations on
/// different nodes never contend. `capacity`, `latency` and the normalisation
/// unit are fixed at construction.
#[derive(Debug)]
pub struct ClusterLedger {
    nodes: Vec<LedgerNode>,
    block_size: u64,
    worst_latency_unit: f64,
    // cumulative, never decremented on delete
    placed_blocks: [AtomicU64; N_PRIORITIES],
}

/// Cost of placing onto a node in the given state; lower is better.
pub fn effectiveness_score(
    capacity: u64,
    available: u64,
    latency: f64,
    block_size: u64,
    worst_latency_unit: f64,
) -> f64 {
    if available == capacity {
        return 2.0 * latency / worst_latency_unit;
    }
    let used = (capacity - available) as f64;
    let used_blocks_penalty = 0.5 * used * latency / block_size as f64;
    used_blocks_penalty.max(latency) / worst_latency_unit
}

/// `max(latency) * capacity[argmax(latency)] / block_size`; ties on the
/// maximum latency resolve to the lowest index.
fn worst_latency_unit(specs: &[(u64, f64)], block_size: u64) -> f64 {
    let mut worst = 0;
    for (i, (_, latency)) in specs.iter().enumerate() {
        if *latency > specs[worst].1 {
            worst = i;
        }
    }
    let (capacity, latency) = specs[worst];
    latency * capacity as f64 / block_size as f64
}

impl ClusterLedger {
    /// Builds an empty ledger: every node at full availability.
    pub fn new(specs: &[NodeSpec], block_size: u64) -> StoreResult<Self> {
        validate_specs(specs, block_size)?;
        let caps: Vec<(u64, f64)> = specs.iter().map(|s| (s.capacity, s.latency)).collect();
        let unit = worst_latency_unit(&caps, block_size);

        let nodes = specs
            .iter()
            .map(|s| LedgerNode {
                host: s.host.clone(),
                capacity: s.capacity,
                latency: s.latency,
                state: Mutex::new(NodeState {
                    available: s.capacity,
                    effective: effectiveness_score(
                        s.capacity, s.capacity, s.latency, block_size, unit,
                    ),
                }),
            })
            .collect();

        Ok(Self {
            nodes,
            block_size,
            worst_latency_unit: unit,
            placed_blocks: Default::default(),
        })
    }

    /// Rebuilds a ledger from its persisted image. Effectiveness is
    /// recomputed rather than trusted.
    pub fn from_snapshot(snap: &ClusterSnapshot) -> StoreResult<Self> {
        let n = snap.hosts.len();
        if snap.capacity.len() != n || snap.available.len() != n || snap.latency.len() != n {
            return Err(StoreError::Config(format!(
                "snapshot arrays disagree on node count ({n} hosts)"
            )));
        }

        let specs: Vec<NodeSpec> = (0..n)
            .map(|i| NodeSpec {
                host: snap.hosts[i].clone(),
                capacity: snap.capacity[i],
                latency: snap.latency[i],
            })
            .collect();
        let ledger = Self::new(&specs, snap.block_size)?;

        for (i, node) in ledger.nodes.iter().enumerate() {
            let available = snap.available[i];
            if available > node.capacity {
                return Err(StoreError::Config(format!(
                    "snapshot node {i}: available {available} exceeds capacity {}",
                    node.capacity
                )));
            }
            let mut st = node.state.lock();
            st.available = available;
            st.effective = ledger.score(node, available);
        }
        for (counter, v) in ledger.placed_blocks.iter().zip(snap.placed_blocks) {
            counter.store(v, Ordering::Relaxed);
        }

        Ok(ledger)
    }

    /// A fresh ledger over the same nodes: full availability, zeroed counters.
    pub fn shadow(&self) -> Self {
        let nodes = self
            .nodes
            .iter()
            .map(|n| LedgerNode {
                host: n.host.clone(),
                capacity: n.capacity,
                latency: n.latency,
                state: Mutex::new(NodeState {
                    available: n.capacity,
                    effective: self.score(n, n.capacity),
                }),
            })
            .collect();
        Self {
            nodes,
            block_size: self.block_size,
            worst_latency_unit: self.worst_latency_unit,
            placed_blocks: Default::default(),
        }
    }

    pub fn snapshot(&self) -> ClusterSnapshot {
        let mut snap = ClusterSnapshot {
            block_size: self.block_size,
            hosts: Vec::with_capacity(self.nodes.len()),
            capacity: Vec::with_capacity(self.nodes.len()),
            available: Vec::with_capacity(self.nodes.len()),
            latency: Vec::with_capacity(self.nodes.len()),
            effective: Vec::with_capacity(self.nodes.len()),
            placed_blocks: self.placed_blocks(),
        };
        for node in &self.nodes {
            let st = node.state.lock();
            snap.hosts.push(node.host.clone());
            snap.capacity.push(node.capacity);
            snap.available.push(st.available);
            snap.latency.push(node.latency);
            snap.effective.push(st.effective);
        }
        snap
    }

    fn score(&self, node: &LedgerNode, available: u64) -> f64 {
        effectiveness_score(
            node.capacity,
            available,
            node.latency,
            self.block_size,
            self.worst_latency_unit,
        )
    }

    fn node(&self, id: NodeId) -> StoreResult<&LedgerNode> {
        self.nodes.get(id).ok_or(StoreError::InvalidNode(id))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn check_node(&self, id: NodeId) -> StoreResult<()> {
        self.node(id).map(|_| ())
    }

    pub fn host(&self, id: NodeId) -> StoreResult<&str> {
        Ok(self.node(id)?.host.as_str())
    }

    pub fn available(&self, id: NodeId) -> StoreResult<u64> {
        Ok(self.node(id)?.state.lock().available)
    }

    pub fn effective(&self, id: NodeId) -> StoreResult<f64> {
        Ok(self.node(id)?.state.lock().effective)
    }

    pub fn view(&self, id: NodeId) -> StoreResult<NodeView> {
        let node = self.node(id)?;
        let st = node.state.lock();
        Ok(NodeView {
            id,
            host: node.host.clone(),
            capacity: node.capacity,
            available: st.available,
            latency: node.latency,
            effective: st.effective,
        })
    }

    /// Node ids ordered by ascending effectiveness (best first), ties by id.
    pub fn rank(&self) -> Vec<NodeId> {
        self.ranked(|_| true)
    }

    /// Like [`rank`](Self::rank), but only nodes a reservation would
    /// currently succeed on.
    pub fn rank_with_room(&self) -> Vec<NodeId> {
        self.ranked(|st| st.available > self.block_size)
    }

    fn ranked(&self, keep: impl Fn(&NodeState) -> bool) -> Vec<NodeId> {
        let mut scored: Vec<(f64, NodeId)> = self
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(id, n)| {
                let st = n.state.lock();
                keep(&*st).then_some((st.effective, id))
            })
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        scored.into_iter().map(|(_, id)| id).collect()
    }

    /// Charges one block against `id`. The reservation must leave the node
    /// with strictly positive availability, otherwise nothing changes and
    /// `NoCapacity` is returned.
    pub fn reserve(&self, id: NodeId) -> StoreResult<()> {
        let node = self.node(id)?;
        let mut st = node.state.lock();
        match st.available.checked_sub(self.block_size) {
            Some(rest) if rest > 0 => {
                st.available = rest;
                st.effective = self.score(node, rest);
                Ok(())
            }
            _ => Err(StoreError::NoCapacity),
        }
    }

    /// Whether a reservation on `id` would currently succeed.
    pub fn has_room(&self, id: NodeId) -> StoreResult<bool> {
        Ok(self.available(id)? > self.block_size)
    }

    /// Credits one block back to `id`, never past its capacity.
    pub fn release(&self, id: NodeId) -> StoreResult<()> {
        let node = self.node(id)?;
        let mut st = node.state.lock();
        st.available = st.available.saturating_add(self.block_size).min(node.capacity);
        st.effective = self.score(node, st.available);
        Ok(())
    }

    pub fn record_placement(&self, priority: Priority) {
        self.placed_blocks[priority.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn placed_blocks(&self) -> [u64; N_PRIORITIES] {
        std::array::from_fn(|i| self.placed_blocks[i].load(Ordering::Relaxed))
    }

    pub fn total_capacity(&self) -> u64 {
        self.nodes.iter().map(|n| n.capacity).sum()
    }

    pub fn total_available(&self) -> u64 {
        self.nodes.iter().map(|n| n.state.lock().available).sum()
    }

    /// Number of block slots in the whole cluster.
    pub fn total_blocks(&self) -> f64 {
        self.total_capacity() as f64 / self.block_size as f64
    }

    pub fn free_fraction(&self) -> f64 {
        self.total_available() as f64 / self.total_capacity() as f64
    }

    /// Fraction of `id`'s capacity currently in use.
    pub fn utilization(&self, id: NodeId) -> StoreResult<f64> {
        let node = self.node(id)?;
        let available = node.state.lock().available;
        Ok((node.capacity - available) as f64 / node.capacity as f64)
    }
}

fn validate_specs(specs: &[NodeSpec], block_size: u64) -> StoreResult<()> {
    if specs.is_empty() {
        return Err(StoreError::Config("cluster has no nodes".into()));
    }
    if block_size == 0 {
        return Err(StoreError::Config("block size must be positive".into()));
    }
    for (i, s) in specs.iter().enumerate() {
        if s.capacity == 0 {
            return Err(StoreError::Config(format!("node {i} ({}) has zero capacity", s.host)));
        }
        if !s.latency.is_finite() || s.latency < 0.0 {
            return Err(StoreError::Config(format!(
                "node {i} ({}) has invalid latency {}",
                s.host, s.latency
            )));
        }
    }
    if specs.iter().all(|s| s.latency == 0.0) {
        return Err(StoreError::Config("at least one node needs a positive latency".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs(latencies: &[f64], capacity: u64) -> Vec<NodeSpec> {
        latencies
            .iter()
            .enumerate()
            .map(|(i, &latency)| NodeSpec {
                host: format!("node-{i}"),
                capacity,
                latency,
            })
            .collect()
    }

    #[test]
    fn test_worst_unit_uses_slowest_node() {
        let caps = [(100, 1.0), (200, 4.0), (300, 4.0)];
        // first of the tied maxima wins
        assert_eq!(worst_latency_unit(&caps, 10), 4.0 * 200.0 / 10.0);
    }

    #[test]
    fn test_empty_node_scores_twice_its_latency() {
        let ledger = ClusterLedger::new(&specs(&[1.0, 2.0], 100), 1).unwrap();
        let unit = 2.0 * 100.0;
        assert_eq!(ledger.effective(0).unwrap(), 2.0 * 1.0 / unit);
        assert_eq!(ledger.effective(1).unwrap(), 2.0 * 2.0 / unit);
    }

    #[test]
    fn test_penalty_kicks_in_after_two_blocks() {
        let ledger = ClusterLedger::new(&specs(&[1.0], 100), 1).unwrap();
        let unit = 100.0;
        ledger.reserve(0).unwrap();
        assert_eq!(ledger.effective(0).unwrap(), 1.0 / unit);
        ledger.reserve(0).unwrap();
        assert_eq!(ledger.effective(0).unwrap(), 1.0 / unit);
        ledger.reserve(0).unwrap();
        assert_eq!(ledger.effective(0).unwrap(), 1.5 / unit);
    }

    #[test]
    fn test_reserve_never_drains_node() {
        let ledger = ClusterLedger::new(&specs(&[1.0], 3), 1).unwrap();
        ledger.reserve(0).unwrap();
        ledger.reserve(0).unwrap();
        assert_eq!(ledger.available(0).unwrap(), 1);
        assert!(matches!(ledger.reserve(0), Err(StoreError::NoCapacity)));
        assert_eq!(ledger.available(0).unwrap(), 1);
        assert!(!ledger.has_room(0).unwrap());
    }

    #[test]
    fn test_release_saturates_at_capacity() {
        let ledger = ClusterLedger::new(&specs(&[1.0], 10), 4).unwrap();
        ledger.release(0).unwrap();
        assert_eq!(ledger.available(0).unwrap(), 10);
    }

    #[test]
    fn test_rank_breaks_ties_by_id() {
        let ledger = ClusterLedger::new(&specs(&[1.0, 1.0, 1.0], 100), 1).unwrap();
        assert_eq!(ledger.rank(), vec![0, 1, 2]);
        ledger.reserve(2).unwrap();
        assert_eq!(ledger.rank(), vec![2, 0, 1]);
    }

    #[test]
    fn test_rank_with_room_skips_full_nodes() {
        // the small node stays the better score while it fills up
        let ledger = ClusterLedger::new(
            &[
                NodeSpec { host: "small".into(), capacity: 4, latency: 1.0 },
                NodeSpec { host: "large".into(), capacity: 100, latency: 1.0 },
            ],
            1,
        )
        .unwrap();
        for _ in 0..3 {
            ledger.reserve(0).unwrap();
        }
        assert_eq!(ledger.rank(), vec![0, 1]);
        assert_eq!(ledger.rank_with_room(), vec![1]);
    }

    #[test]
    fn test_snapshot_restores_state() {
        let ledger = ClusterLedger::new(&specs(&[1.0, 3.0], 50), 5).unwrap();
        ledger.reserve(1).unwrap();
        ledger.record_placement(Priority::Low);
        let snap = ledger.snapshot();

        let restored = ClusterLedger::from_snapshot(&snap).unwrap();
        assert_eq!(restored.snapshot(), snap);
        assert_eq!(restored.placed_blocks(), [0, 0, 1]);
    }

    #[test]
    fn test_rejects_bad_specs() {
        assert!(ClusterLedger::new(&[], 1).is_err());
        assert!(ClusterLedger::new(&specs(&[1.0], 0), 1).is_err());
        assert!(ClusterLedger::new(&specs(&[0.0, 0.0], 10), 1).is_err());
        assert!(ClusterLedger::new(&specs(&[f64::NAN], 10), 1).is_err());
        assert!(ClusterLedger::new(&specs(&[1.0], 10), 0).is_err());
    }
}
