use serde::{Deserialize, Serialize};
use tracing::debug;

use common::constants::N_PRIORITIES;
use common::error::{StoreError, StoreResult};

use crate::core::ledger::ClusterLedger;
use crate::core::node::{NodeId, Priority};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlacementConfig {
    /// Desired long-run share of cluster block slots per tier (high, medium, low).
    pub target_shares: [f64; N_PRIORITIES],
    /// Below this cluster-wide free fraction every request takes the best node.
    pub emergency_free_fraction: f64,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            target_shares: [0.01, 0.09, 0.99],
            emergency_free_fraction: 0.10,
        }
    }
}

impl PlacementConfig {
    pub fn validate(&self) -> StoreResult<()> {
        let shares_ok = self
            .target_shares
            .iter()
            .all(|s| s.is_finite() && (0.0..=1.0).contains(s));
        if !shares_ok {
            return Err(StoreError::Config(format!(
                "target shares must lie in [0, 1]: {:?}",
                self.target_shares
            )));
        }
        if !(0.0..=1.0).contains(&self.emergency_free_fraction) {
            return Err(StoreError::Config(format!(
                "emergency free fraction must lie in [0, 1]: {}",
                self.emergency_free_fraction
            )));
        }
        Ok(())
    }
}

/// Priority-tiered node selection.
///
/// High-priority writes always land on the best-ranked node. Medium and low
/// writes are pushed down the ranking while the tiers above them are short of
/// their target share, keeping the best nodes free for those tiers.
#[derive(Clone, Debug, Default)]
pub struct PlacementPolicy {
    cfg: PlacementConfig,
}

impl PlacementPolicy {
    pub fn new(cfg: PlacementConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &PlacementConfig {
        &self.cfg
    }

    /// Share of each tier still missing before the tier at `priority` may
    /// take the best node. Zero when every higher tier is at target.
    pub fn missing_share(&self, ledger: &ClusterLedger, priority: Priority) -> f64 {
        let total_blocks = ledger.total_blocks();
        let placed = ledger.placed_blocks();
        (0..priority.index())
            .map(|tier| {
                let share = placed[tier] as f64 / total_blocks;
                (self.cfg.target_shares[tier] - share).max(0.0)
            })
            .sum()
    }

    /// Picks the target node for a new block without reserving anything.
    /// Only nodes that can still take a block are ranked.
    pub fn choose(&self, ledger: &ClusterLedger, priority: Priority) -> StoreResult<NodeId> {
        let ranked = ledger.rank_with_room();
        let Some(&best) = ranked.first() else {
            return Err(StoreError::NoCapacity);
        };

        if priority == Priority::High
            || ledger.free_fraction() < self.cfg.emergency_free_fraction
        {
            return Ok(best);
        }

        let missing = self.missing_share(ledger, priority);
        if missing <= 0.0 {
            return Ok(best);
        }
        Ok(ranked[displaced_rank(missing, ranked.len())])
    }

    /// Chooses a node, reserves a block on it and counts the placement.
    /// Fails with `NoCapacity` once no node can take a block.
    pub fn place(&self, ledger: &ClusterLedger, priority: Priority) -> StoreResult<NodeId> {
        // a node filled by a concurrent reservation drops out of the next ranking
        for _ in 0..ledger.len() {
            let node = self.choose(ledger, priority)?;
            match ledger.reserve(node) {
                Ok(()) => {
                    ledger.record_placement(priority);
                    debug!(node, %priority, "placed block");
                    return Ok(node);
                }
                Err(StoreError::NoCapacity) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::NoCapacity)
    }
}

/// Rank a displaced request lands on: `max(floor(missing * n), 1)`, clamped
/// to the last node.
pub fn displaced_rank(missing: f64, n: usize) -> usize {
    let rank = ((missing * n as f64).floor() as usize).max(1);
    rank.min(n.saturating_sub(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::node::NodeSpec;

    fn ledger(n: usize, capacity_blocks: u64) -> ClusterLedger {
        let specs: Vec<NodeSpec> = (0..n)
            .map(|i| NodeSpec {
                host: format!("n{i}"),
                capacity: capacity_blocks,
                latency: 1.0,
            })
            .collect();
        ClusterLedger::new(&specs, 1).unwrap()
    }

    #[test]
    fn test_displaced_rank() {
        assert_eq!(displaced_rank(0.01, 4), 1);
        assert_eq!(displaced_rank(0.5, 4), 2);
        assert_eq!(displaced_rank(0.99, 4), 3);
        assert_eq!(displaced_rank(5.0, 4), 3);
        assert_eq!(displaced_rank(0.5, 1), 0);
    }

    #[test]
    fn test_missing_share_sums_higher_tiers() {
        let l = ledger(4, 100);
        let p = PlacementPolicy::default();
        assert_eq!(p.missing_share(&l, Priority::High), 0.0);
        assert!((p.missing_share(&l, Priority::Medium) - 0.01).abs() < 1e-12);
        assert!((p.missing_share(&l, Priority::Low) - 0.10).abs() < 1e-12);

        // 4 high blocks = 1% of 400 slots: high tier satisfied
        for _ in 0..4 {
            l.record_placement(Priority::High);
        }
        assert_eq!(p.missing_share(&l, Priority::Medium), 0.0);
        assert!((p.missing_share(&l, Priority::Low) - 0.09).abs() < 1e-12);
    }

    #[test]
    fn test_medium_is_displaced_while_high_is_short() {
        let l = ledger(4, 100);
        let p = PlacementPolicy::default();
        assert_eq!(p.choose(&l, Priority::High).unwrap(), 0);
        assert_eq!(p.choose(&l, Priority::Medium).unwrap(), 1);
        assert_eq!(p.choose(&l, Priority::Low).unwrap(), 1);
    }

    #[test]
    fn test_emergency_bypass() {
        let l = ledger(2, 40);
        for _ in 0..30 {
            l.reserve(0).unwrap();
            l.reserve(1).unwrap();
        }
        // 20 of 80 free: low priority is still displaced
        assert_eq!(p_choose(&l, Priority::Low), 1);
        for _ in 0..7 {
            l.reserve(0).unwrap();
            l.reserve(1).unwrap();
        }
        // 6 of 80 free: everyone takes the best node
        assert_eq!(p_choose(&l, Priority::Low), 0);
        assert_eq!(p_choose(&l, Priority::Medium), 0);
    }

    fn p_choose(l: &ClusterLedger, priority: Priority) -> NodeId {
        PlacementPolicy::default().choose(l, priority).unwrap()
    }

    #[test]
    fn test_full_nodes_are_not_ranked() {
        let l = ledger(3, 4);
        for _ in 0..3 {
            l.reserve(0).unwrap();
        }
        let p = PlacementPolicy::default();
        // node 0 still scores best but has no room left
        assert_eq!(l.rank()[0], 0);
        assert_eq!(p.choose(&l, Priority::High).unwrap(), 1);
        // displacement indexes the nodes that remain
        assert_eq!(p.choose(&l, Priority::Low).unwrap(), 2);

        for id in 1..3 {
            for _ in 0..3 {
                l.reserve(id).unwrap();
            }
        }
        assert!(matches!(p.choose(&l, Priority::High), Err(StoreError::NoCapacity)));
    }

    #[test]
    fn test_place_counts_only_successes() {
        let l = ledger(1, 1);
        let p = PlacementPolicy::default();
        assert!(matches!(p.place(&l, Priority::High), Err(StoreError::NoCapacity)));
        assert_eq!(l.placed_blocks(), [0, 0, 0]);
    }
}
