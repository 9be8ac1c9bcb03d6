pub mod catalog;
pub mod config;
pub mod ledger;
pub mod meta;
pub mod node;
pub mod placement;
pub mod rebalance;
pub mod remote;
pub mod routes;
pub mod scheduler;
pub mod state;
