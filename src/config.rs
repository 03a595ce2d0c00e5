//! Filesystem configuration.

use serde::{Deserialize, Serialize};

/// One backing device.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Number of allocation buckets on this device.
    pub nr_buckets: u32,
    /// Sectors per bucket. Must be a multiple of the btree node size.
    pub bucket_sectors: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            nr_buckets: 128,
            bucket_sectors: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub devices: Vec<DeviceConfig>,
    /// Btree node size in sectors.
    pub btree_node_sectors: u32,
    pub sector_bytes: u32,
    /// Replica count for metadata (btree node) writes.
    pub metadata_replicas: u8,
    /// Emit v2 pointer keys.
    pub ptr_v2: bool,
    /// Run node writes inline on the issuing thread instead of on the
    /// background worker. Deterministic; used by tests.
    pub inline_io: bool,
    /// Journal pre-reservation capacity, in u64s.
    pub journal_u64s: u64,
    /// In-memory node descriptors the cache may hold before cannibalising.
    pub cache_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            devices: vec![DeviceConfig::default()],
            btree_node_sectors: 64,
            sector_bytes: 512,
            metadata_replicas: 1,
            ptr_v2: true,
            inline_io: false,
            journal_u64s: 1 << 16,
            cache_capacity: 256,
        }
    }
}

/// Fixed per-node overhead of the packed image, in u64s.
pub const BSET_OVERHEAD_U64S: usize = 8;

/// Minimum pool kept in the per-update node reserve cache.
pub const BTREE_NODE_RESERVE: usize = 8;

impl Config {
    pub fn btree_bytes(&self) -> usize {
        (self.btree_node_sectors * self.sector_bytes) as usize
    }

    /// Key payload capacity of one node, in u64s.
    pub fn btree_node_u64s(&self) -> usize {
        self.btree_bytes() / 8 - BSET_OVERHEAD_U64S
    }

    /// Above this a rewritten node is split rather than compacted.
    pub fn split_threshold(&self) -> usize {
        self.btree_node_u64s() * 3 / 4
    }

    pub fn foreground_merge_threshold(&self) -> usize {
        self.btree_node_u64s() / 3
    }

    pub fn foreground_merge_hysteresis(&self) -> usize {
        let t = self.foreground_merge_threshold();
        t + (t >> 2)
    }
}
