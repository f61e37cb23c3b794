//! Engine configuration.
//!
//! Resolved once at engine-construction time rather than baked in at compile
//! time, since the slab class table needs to be populated from runtime
//! values (memory budget, partition count, ...).

use std::env;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Memory budget for the slab allocator, in bytes.
    pub max_bytes: u64,
    /// Slab growth factor between adjacent size classes.
    pub factor: f64,
    /// Smallest slab-class chunk size, in bytes.
    pub chunk_size_min: usize,
    /// Largest slab-class chunk size, in bytes.
    pub chunk_size_max: usize,
    /// If true, carve the full budget into slabs at startup.
    pub prealloc: bool,
    /// Enable CAS issuance (adds 8 bytes of accounting per item).
    pub use_cas: bool,
    /// If false, allocation failures return `OutOfMemory` without evicting.
    pub evict_to_free: bool,
    /// Shard count. Overridden by the `PARTITION_SIZE` environment variable.
    pub num_partitions: usize,
    /// Buckets migrated per maintenance wake during a resize.
    pub hash_bulk_move: usize,
    /// Deferred-delete grace window, in seconds.
    pub delete_lock_window_secs: u64,
    /// Maintenance-loop wake period, in seconds.
    pub maintenance_interval_secs: u64,
    /// Starting bucket count per partition's hash table (must be a power of two).
    pub initial_buckets: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_bytes: 64 * 1024 * 1024,
            factor: 1.25,
            chunk_size_min: 80,
            chunk_size_max: 1024 * 1024,
            prealloc: false,
            use_cas: true,
            evict_to_free: true,
            num_partitions: default_num_partitions(),
            hash_bulk_move: 1,
            delete_lock_window_secs: 4,
            maintenance_interval_secs: 5,
            initial_buckets: 64,
        }
    }
}

fn default_num_partitions() -> usize {
    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (workers * 4).max(1)
}

impl EngineConfig {
    /// Start from defaults and apply the `PARTITION_SIZE` environment
    /// override, mirroring the `num_partitions` / `PARTITION_SIZE` pair.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(val) = env::var("PARTITION_SIZE")
            && let Ok(n) = val.parse::<usize>()
            && n > 0
        {
            cfg.num_partitions = n;
        }
        cfg
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn with_num_partitions(mut self, n: usize) -> Self {
        self.num_partitions = n.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = EngineConfig::default();
        assert!(cfg.num_partitions >= 1);
        assert!(cfg.factor > 1.0);
        assert!(cfg.chunk_size_max >= cfg.chunk_size_min);
    }

    #[test]
    fn builder_overrides_apply() {
        let cfg = EngineConfig::default()
            .with_max_bytes(1024)
            .with_num_partitions(7);
        assert_eq!(cfg.max_bytes, 1024);
        assert_eq!(cfg.num_partitions, 7);
    }
}
