pub mod common;
pub mod files;
pub mod rebalance;
pub mod serve;
pub mod simulate;
