use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use serde::Serialize;

use common::constants::DEFAULT_FILE_SIZE;

use crate::command::common::{StoreArgs, open_state};
use crate::core::node::{NodeId, Priority};
use crate::core::routes::FileRecord;

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[derive(Parser, Debug, Clone)]
pub struct CreateArgs {
    #[command(flatten)]
    store: StoreArgs,

    name: String,

    /// File size in bytes
    #[arg(long, default_value_t = DEFAULT_FILE_SIZE)]
    size: u64,

    /// 0 = high, 1 = medium, 2 = low
    #[arg(long, default_value_t = 2)]
    priority: u8,

    /// Skip placement and put the file on this node
    #[arg(long)]
    node: Option<NodeId>,
}

pub fn create(args: CreateArgs) -> Result<()> {
    let priority = Priority::try_from(args.priority)?;
    let state = open_state(&args.store)?;
    let entry = state.create(&args.name, args.size, priority, args.node)?;
    print_json(&FileRecord {
        name: args.name,
        entry,
    })
}

#[derive(Parser, Debug, Clone)]
pub struct DeleteArgs {
    #[command(flatten)]
    store: StoreArgs,

    name: String,
}

pub fn delete(args: DeleteArgs) -> Result<()> {
    let state = open_state(&args.store)?;
    state.delete(&args.name)?;
    Ok(())
}

#[derive(Parser, Debug, Clone)]
pub struct RetrieveArgs {
    #[command(flatten)]
    store: StoreArgs,

    name: String,

    /// Local destination path
    #[arg(long)]
    dest: PathBuf,
}

pub fn retrieve(args: RetrieveArgs) -> Result<()> {
    let state = open_state(&args.store)?;
    state.retrieve(&args.name, &args.dest)?;
    // keep the refreshed modified_at
    state.persist()?;
    Ok(())
}

#[derive(Parser, Debug, Clone)]
pub struct ListArgs {
    #[command(flatten)]
    store: StoreArgs,
}

pub fn list(args: ListArgs) -> Result<()> {
    let state = open_state(&args.store)?;
    let files: Vec<FileRecord> = state
        .list()
        .into_iter()
        .map(|(name, entry)| FileRecord { name, entry })
        .collect();
    print_json(&files)
}

#[derive(Parser, Debug, Clone)]
pub struct StatsArgs {
    #[command(flatten)]
    store: StoreArgs,
}

pub fn stats(args: StatsArgs) -> Result<()> {
    let state = open_state(&args.store)?;
    print_json(&state.stats()?)
}
