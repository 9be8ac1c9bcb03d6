use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use rand::Rng;
use tracing::{info, warn};

use common::constants::{DEFAULT_FILE_SIZE, N_PRIORITIES};

use crate::command::common::{StoreArgs, open_state};
use crate::core::node::Priority;
use crate::core::scheduler::{BatchHandle, BatchReport, Operation, SubmitMode};
use crate::core::state::CoordinatorState;

/// Share of created files per tier (high, medium); low takes the rest.
const FILE_FREQUENCY: [f64; 2] = [0.01, 0.09];
/// Share of accesses per tier (high, medium); low takes the rest.
const ACCESS_FREQUENCY: [f64; 2] = [0.15, 0.35];

#[derive(Parser, Debug, Clone)]
pub struct SimulateArgs {
    #[command(flatten)]
    store: StoreArgs,

    #[arg(long, default_value_t = 1000)]
    num_files: usize,

    /// Bytes per simulated file
    #[arg(long, default_value_t = DEFAULT_FILE_SIZE)]
    size_per_file: u64,

    /// How long to keep accessing files
    #[arg(long, default_value = "60s")]
    duration: humantime::Duration,

    #[arg(long, default_value_t = 10)]
    accesses_per_tick: usize,

    #[arg(long, default_value = "1s")]
    tick: humantime::Duration,

    /// Rebalance at the end if the cluster is past the threshold
    #[arg(long, default_value_t = false)]
    rebalance: bool,

    /// Write the final cluster stats (JSON) here
    #[arg(long)]
    output: Option<PathBuf>,
}

/// Draws a priority with the simulated file frequencies.
pub fn draw_priority<R: Rng>(rng: &mut R) -> Priority {
    let x: f64 = rng.random();
    if x < FILE_FREQUENCY[0] {
        Priority::High
    } else if x < FILE_FREQUENCY[0] + FILE_FREQUENCY[1] {
        Priority::Medium
    } else {
        Priority::Low
    }
}

/// Picks `n` names, tier first by access frequency, then uniformly inside
/// the tier. A drawn tier with no files falls through to the lower tiers.
pub fn draw_access_sample<R: Rng>(
    by_tier: &[Vec<String>; N_PRIORITIES],
    n: usize,
    rng: &mut R,
) -> Vec<String> {
    let all: Vec<&String> = by_tier.iter().flatten().collect();
    if all.is_empty() {
        return Vec::new();
    }

    let pick = |names: &[String], rng: &mut R| names[rng.random_range(0..names.len())].clone();
    (0..n)
        .map(|_| {
            let x: f64 = rng.random();
            let [hi, med, lo] = by_tier;
            if x < ACCESS_FREQUENCY[0] && !hi.is_empty() {
                pick(hi, rng)
            } else if x < ACCESS_FREQUENCY[0] + ACCESS_FREQUENCY[1] && !med.is_empty() {
                pick(med, rng)
            } else if !lo.is_empty() {
                pick(lo, rng)
            } else {
                all[rng.random_range(0..all.len())].clone()
            }
        })
        .collect()
}

fn files_by_tier(state: &CoordinatorState) -> [Vec<String>; N_PRIORITIES] {
    let mut tiers: [Vec<String>; N_PRIORITIES] = Default::default();
    for (name, entry) in state.list() {
        tiers[entry.priority.index()].push(name);
    }
    tiers
}

pub async fn simulate(args: SimulateArgs) -> Result<()> {
    let state = open_state(&args.store)?;

    // start from an empty cluster
    let ops: Vec<Operation> = state
        .list()
        .into_keys()
        .map(|name| Operation::Delete { name })
        .collect();
    info!(files = ops.len(), "deleting existing files");
    let report = run_blocking(&state, ops).await?;
    info!(deleted = report.succeeded, failed = report.failed, "cluster cleared");

    let mut rng = rand::rng();
    let ops: Vec<Operation> = (0..args.num_files)
        .map(|i| Operation::Create {
            name: format!("{i}.psl"),
            size: args.size_per_file,
            priority: draw_priority(&mut rng),
            node: None,
        })
        .collect();
    info!(files = ops.len(), size = args.size_per_file, "populating cluster");
    let report = run_blocking(&state, ops).await?;
    info!(created = report.succeeded, failed = report.failed, "cluster populated");

    let tiers = files_by_tier(&state);
    let duration: Duration = args.duration.into();
    let mut ticker = tokio::time::interval(args.tick.into());
    let mut pending: Vec<BatchHandle> = Vec::new();
    let start = tokio::time::Instant::now();

    info!(?duration, accesses_per_tick = args.accesses_per_tick, "simulating accesses");
    while start.elapsed() < duration {
        ticker.tick().await;
        let ops = draw_access_sample(&tiers, args.accesses_per_tick, &mut rng)
            .into_iter()
            .map(|name| Operation::Retrieve {
                name,
                dest: PathBuf::from("/dev/null"),
            })
            .collect();
        pending.push(state.submit_batch(ops, SubmitMode::Detached)?);
    }

    let (retrieved, failed) = tokio::task::spawn_blocking(move || {
        pending.into_iter().fold((0, 0), |(ok, err), h| {
            let r = h.join();
            (ok + r.succeeded, err + r.failed)
        })
    })
    .await?;
    info!(retrieved, failed, "accesses drained");

    let st = state.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        st.persist()?;
        if args.rebalance {
            match st.rebalance_if_needed()? {
                Some(r) => info!(moved = r.moved, failed = r.failures.len(), "rebalanced"),
                None => info!("no rebalance needed"),
            }
        }
        Ok(())
    })
    .await??;

    let stats = state.stats()?;
    for node in &stats.nodes {
        info!(
            node = node.view.id,
            host = %node.view.host,
            files = node.files,
            available = node.view.available,
            effective = node.view.effective,
            "node"
        );
    }
    info!(
        free_fraction = stats.free_fraction,
        placed = ?stats.placed_blocks,
        live = ?stats.live_files,
        "simulation done"
    );
    if let Some(path) = &args.output {
        if let Err(e) = std::fs::write(path, serde_json::to_vec_pretty(&stats)?) {
            warn!(path = %path.display(), error = %e, "could not write stats");
        }
    }
    Ok(())
}

async fn run_blocking(
    state: &CoordinatorState,
    ops: Vec<Operation>,
) -> Result<BatchReport> {
    let st = state.clone();
    Ok(tokio::task::spawn_blocking(move || st.run_batch(ops)).await??)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn names(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{prefix}{i}")).collect()
    }

    #[test]
    fn test_priority_draws_follow_frequencies() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut counts = [0usize; N_PRIORITIES];
        for _ in 0..10_000 {
            counts[draw_priority(&mut rng).index()] += 1;
        }
        assert!(counts[0] < 300, "{counts:?}");
        assert!((500..1300).contains(&counts[1]), "{counts:?}");
        assert!(counts[2] > 8_000, "{counts:?}");
    }

    #[test]
    fn test_empty_tiers_fall_through() {
        let mut rng = StdRng::seed_from_u64(1);
        let tiers = [Vec::new(), Vec::new(), names("lo", 3)];
        let sample = draw_access_sample(&tiers, 50, &mut rng);
        assert_eq!(sample.len(), 50);
        assert!(sample.iter().all(|n| n.starts_with("lo")));

        let tiers = [names("hi", 2), Vec::new(), Vec::new()];
        let sample = draw_access_sample(&tiers, 50, &mut rng);
        assert!(sample.iter().all(|n| n.starts_with("hi")));
    }

    #[test]
    fn test_no_files_no_sample() {
        let mut rng = StdRng::seed_from_u64(1);
        let tiers: [Vec<String>; N_PRIORITIES] = Default::default();
        assert!(draw_access_sample(&tiers, 10, &mut rng).is_empty());
    }
}
