use clap::{Parser, Subcommand};

use common::telemetry::init_telemetry;

use coord::command::files::{
    CreateArgs, DeleteArgs, ListArgs, RetrieveArgs, StatsArgs, create, delete, list, retrieve,
    stats,
};
use coord::command::rebalance::{RebalanceArgs, rebalance};
use coord::command::serve::{ServeArgs, serve};
use coord::command::simulate::{SimulateArgs, simulate};

#[derive(Parser, Debug, Clone)]
#[command(version, about)]
struct Args {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug, Clone)]
enum Cmd {
    /// Run the HTTP server
    Serve(ServeArgs),
    /// Place and write a new file
    Create(CreateArgs),
    /// Delete a file
    Delete(DeleteArgs),
    /// Copy a file to a local path
    Retrieve(RetrieveArgs),
    /// List all files
    List(ListArgs),
    /// Print cluster statistics
    Stats(StatsArgs),
    /// Move misplaced files
    Rebalance(RebalanceArgs),
    /// Run a synthetic workload against the cluster
    Simulate(SimulateArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_telemetry("coord");

    let args = Args::parse();

    match args.cmd {
        Cmd::Serve(serve_args) => {
            serve(serve_args).await?;
        }
        Cmd::Create(create_args) => {
            create(create_args)?;
        }
        Cmd::Delete(delete_args) => {
            delete(delete_args)?;
        }
        Cmd::Retrieve(retrieve_args) => {
            retrieve(retrieve_args)?;
        }
        Cmd::List(list_args) => {
            list(list_args)?;
        }
        Cmd::Stats(stats_args) => {
            stats(stats_args)?;
        }
        Cmd::Rebalance(rebalance_args) => {
            rebalance(rebalance_args)?;
        }
        Cmd::Simulate(simulate_args) => {
            simulate(simulate_args).await?;
        }
    }

    Ok(())
}
