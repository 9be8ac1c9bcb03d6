pub const MAX_NAME_LEN: usize = 2048;

/// Key under which the cluster snapshot is persisted. Never a valid file name.
pub const RESERVED_SYSTEM_KEY: &str = "__cluster__";

pub const META_KEY_PREFIX: &str = "meta";
pub const CLUSTER_KEY: &str = "cluster";

pub const DEFAULT_BLOCK_SIZE: u64 = 1024 * 1024;
pub const DEFAULT_FILE_SIZE: u64 = 1024 * 1024;

pub const N_PRIORITIES: usize = 3;
