use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateQuery {
    pub size: Option<u64>,
    pub priority: Option<u8>,
    pub node: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieveQuery {
    pub dest: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RebalanceQuery {
    /// Only run when cluster utilization is past the reassignment threshold.
    #[serde(default)]
    pub if_needed: bool,
}
