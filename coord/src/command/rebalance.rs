use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use crate::command::common::{StoreArgs, open_state};

#[derive(Parser, Debug, Clone)]
pub struct RebalanceArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Only run when cluster utilization is past the reassignment threshold
    #[arg(long, default_value_t = false)]
    if_needed: bool,

    /// Write the move plan (JSON) here instead of running it
    #[arg(long)]
    plan_out: Option<PathBuf>,
}

pub fn rebalance(args: RebalanceArgs) -> Result<()> {
    let state = open_state(&args.store)?;

    if args.if_needed && !state.needs_rebalance() {
        info!("cluster below threshold, nothing to do");
        return Ok(());
    }

    if let Some(path) = &args.plan_out {
        let plan = state.plan_rebalance()?;
        fs::write(path, serde_json::to_vec_pretty(&plan)?)
            .with_context(|| format!("writing plan to {}", path.display()))?;
        info!(moves = plan.moves.len(), path = %path.display(), "plan written");
        return Ok(());
    }

    let report = state.rebalance()?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
