use std::fmt;

use serde::{Deserialize, Serialize};

use common::constants::N_PRIORITIES;
use common::error::StoreError;

/// Index into the cluster's node table, `0..N`.
pub type NodeId = usize;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NodeSpec {
    /// ssh destination
    pub host: String,
    /// Bytes.
    pub capacity: u64,
    /// Round-trip estimate in milliseconds.
    pub latency: f64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(try_from = "u8", into = "u8")]
pub enum Priority {
    High = 0,
    Medium = 1,
    Low = 2,
}

impl Priority {
    pub const ALL: [Priority; N_PRIORITIES] = [Priority::High, Priority::Medium, Priority::Low];

    pub fn index(self) -> usize {
        self as usize
    }
}

impl TryFrom<u8> for Priority {
    type Error = StoreError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Priority::High),
            1 => Ok(Priority::Medium),
            2 => Ok(Priority::Low),
            other => Err(StoreError::InvalidPriority(other)),
        }
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> u8 {
        p as u8
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// Point-in-time view of one node, as reported by `stats()`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NodeView {
    pub id: NodeId,
    pub host: String,
    pub capacity: u64,
    pub available: u64,
    pub latency: f64,
    pub effective: f64,
}
