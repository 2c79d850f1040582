/// Default partition count of a cluster.
pub const DEFAULT_PARTITION_COUNT: u32 = 271;

/// Settings shared by every member of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeConfig {
    pub partition_count: u32,

    /// Consecutive claim contentions a worker accepts before giving up.
    /// Unbounded when `None`.
    pub contention_retry_limit: Option<u64>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            partition_count: DEFAULT_PARTITION_COUNT,
            contention_retry_limit: None,
        }
    }
}

impl NodeConfig {
    pub fn with_partition_count(mut self, partition_count: u32) -> Self {
        self.partition_count = partition_count;
        self
    }

    pub fn with_contention_retry_limit(mut self, limit: u64) -> Self {
        self.contention_retry_limit = Some(limit);
        self
    }
}
