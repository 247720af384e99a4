use std::time::Duration;

/// Engine configuration. One `Config` is shared by a `Server` and every
/// keyspace it opens.
#[derive(Debug, Clone)]
pub struct Config {
    /// Per-type instance count at which a fresh current-shard is opened.
    pub sharding_threshold: u64,
    /// Maximum wait for a background ID block fetch before the caller gives
    /// up and the fetch is cancelled or parked.
    pub id_renew_timeout: Duration,
    /// Fraction of a block remaining at which prefetch of the next block
    /// starts. Must lie in (0.0, 1.0].
    pub id_renew_buffer_percentage: f64,
    /// Exclusive maximum ID per (partition, namespace).
    pub id_upper_bound: u64,
    /// Number of IDs handed out per authority block.
    pub id_block_size: u64,
    /// Capacity of each session's attribute-by-value cache.
    pub attribute_cache_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sharding_threshold: 10_000,
            id_renew_timeout: Duration::from_secs(2),
            id_renew_buffer_percentage: 0.3,
            id_upper_bound: u64::MAX,
            id_block_size: 10_000,
            attribute_cache_capacity: 10_000,
        }
    }
}

impl Config {
    /// Small blocks and a short renew timeout, for tests that exercise the
    /// pool's renewal path aggressively.
    pub fn small_blocks() -> Self {
        Self {
            id_block_size: 16,
            id_renew_timeout: Duration::from_millis(200),
            ..Self::default()
        }
    }
}
