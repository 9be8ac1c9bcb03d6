use std::thread;

mod util;
use util::*;

use coord::core::node::Priority;

#[test]
fn test_second_rebalance_is_a_noop() -> anyhow::Result<()> {
    let coord = TestCoordinator::new(&config(4, 100, 1))?;
    let state = &coord.state;

    // everything piled on the last node
    for i in 0..12 {
        state.create(&format!("f{i:02}"), 1, Priority::Low, Some(3))?;
    }
    state.create("hot", 1, Priority::High, Some(3))?;

    let first = state.rebalance()?;
    assert!(first.planned > 0);
    assert_eq!(first.moved, first.planned);
    assert!(first.failures.is_empty());
    assert!(state.catalog().files_per_node()[3] < 13);

    let second = state.rebalance()?;
    assert_eq!(second.planned, 0);
    assert_eq!(second.moved, 0);
    assert!(state.plan_rebalance()?.is_empty());
    Ok(())
}

#[test]
fn test_rebalance_keeps_capacity_consistent() -> anyhow::Result<()> {
    let coord = TestCoordinator::new(&config(3, 50, 1))?;
    let state = &coord.state;
    for i in 0..20 {
        state.create(&format!("f{i}"), 1, Priority::ALL[i % 3], Some(i % 2))?;
    }
    let placed_before = state.ledger().placed_blocks();

    state.rebalance()?;

    let counts = state.catalog().files_per_node();
    assert_eq!(counts.iter().sum::<usize>(), 20);
    for (id, files) in counts.iter().enumerate() {
        assert_eq!(state.ledger().available(id)?, 50 - *files as u64);
    }
    // moves are explicit placements
    assert_eq!(state.ledger().placed_blocks(), placed_before);
    Ok(())
}

#[test]
fn test_rebalance_never_adds_to_over_threshold_node() -> anyhow::Result<()> {
    let mut cfg = config(2, 10, 1);
    cfg.rebalance.damping = 0;
    let coord = TestCoordinator::new(&cfg)?;
    let state = &coord.state;

    for i in 0..8 {
        state.create(&format!("a{i}"), 1, Priority::Low, Some(0))?;
    }
    for i in 0..3 {
        state.create(&format!("b{i}"), 1, Priority::Low, Some(1))?;
    }
    assert!(state.ledger().utilization(0)? > cfg.rebalance.reassign_threshold);
    let before = state.catalog().files_per_node()[0];

    let plan = state.plan_rebalance()?;
    assert!(plan.moves.iter().all(|m| m.to != 0), "{plan:?}");

    state.rebalance()?;
    assert!(state.catalog().files_per_node()[0] <= before);
    Ok(())
}

#[test]
fn test_empty_plan_does_not_persist() -> anyhow::Result<()> {
    let coord = TestCoordinator::new(&config(2, 10, 1))?;

    let report = coord.state.rebalance()?;
    assert_eq!(report.planned, 0);
    assert!(coord.store.last_saved().is_none());
    Ok(())
}

#[test]
fn test_rebalance_if_needed_respects_threshold() -> anyhow::Result<()> {
    let coord = TestCoordinator::new(&config(2, 10, 1))?;
    let state = &coord.state;

    for i in 0..14 {
        state.create(&format!("f{i}"), 1, Priority::Low, Some(i % 2))?;
    }
    // 14 of 20 used: exactly at threshold
    assert!(!state.needs_rebalance());
    assert!(state.rebalance_if_needed()?.is_none());

    state.create("f14", 1, Priority::Low, Some(0))?;
    assert!(state.needs_rebalance());
    assert!(state.rebalance_if_needed()?.is_some());
    Ok(())
}

#[test]
fn test_failed_moves_are_reported() -> anyhow::Result<()> {
    let coord = TestCoordinator::new(&config(4, 100, 1))?;
    let state = &coord.state;
    for i in 0..6 {
        state.create(&format!("f{i}"), 1, Priority::Low, Some(3))?;
    }
    coord.exec.fail_node(3);

    let report = state.rebalance()?;
    assert!(report.planned > 0);
    assert_eq!(report.failures.len(), report.planned);
    assert!(report.failures.iter().all(|f| f.step == "move"));
    // the failed removal does not undo the recreate
    assert_eq!(
        state.catalog().files_per_node()[3] + report.planned,
        6
    );
    Ok(())
}

#[test]
fn test_rebalance_with_dropped_moves_settles_in_one_run() -> anyhow::Result<()> {
    let mut cfg = config(2, 10, 1);
    cfg.rebalance.damping = 0;
    let coord = TestCoordinator::new(&cfg)?;
    let state = &coord.state;

    for i in 0..8 {
        state.create(&format!("a{i}"), 1, Priority::Low, Some(0))?;
    }
    for i in 0..3 {
        state.create(&format!("b{i}"), 1, Priority::Low, Some(1))?;
    }

    let first = state.rebalance()?;
    assert!(first.planned > 0);
    assert!(first.dropped > 0, "{first:?}");
    assert_eq!(first.moved, first.planned);
    assert!(first.failures.is_empty());
    // the receiving node stops at the threshold
    assert!(state.ledger().utilization(1)? <= cfg.rebalance.reassign_threshold);

    let second = state.rebalance()?;
    assert_eq!(second.planned, 0, "{second:?}");
    assert_eq!(second.moved, 0);
    Ok(())
}

#[test]
fn test_concurrent_rebalances_do_not_double_move() -> anyhow::Result<()> {
    let coord = TestCoordinator::new(&config(4, 100, 1))?;
    let state = &coord.state;
    for i in 0..12 {
        state.create(&format!("f{i:02}"), 1, Priority::Low, Some(3))?;
    }
    state.create("hot", 1, Priority::High, Some(3))?;

    let reports = thread::scope(|s| {
        let runs: Vec<_> = (0..2).map(|_| s.spawn(|| state.rebalance())).collect();
        runs.into_iter()
            .map(|h| h.join().expect("rebalance thread"))
            .collect::<Result<Vec<_>, _>>()
    })?;

    let busy: Vec<_> = reports.iter().filter(|r| r.planned > 0).collect();
    assert_eq!(busy.len(), 1, "{reports:?}");
    assert_eq!(busy[0].moved, busy[0].planned);
    assert!(busy[0].failures.is_empty());

    let counts = state.catalog().files_per_node();
    assert_eq!(counts.iter().sum::<usize>(), 13);
    for (id, files) in counts.iter().enumerate() {
        assert_eq!(state.ledger().available(id)?, 100 - *files as u64);
    }
    Ok(())
}
