//! Mount-time configuration and volume geometry.
//!
//! Both are plain serde structs so the embedding system can keep them in
//! whatever JSON blob it already parses for mount options.

use serde::{Deserialize, Serialize};

use crate::{
    error::{FatError, FatResult},
    record::RECORD_SIZE,
    types::{Cluster, FatVariant, FIRST_CLUSTER},
};

/// Smallest FAT block cache that is ever built.
pub const MIN_CACHE_BLOCKS: usize = 16;

/// Number of slots in the log ring when the layout does not say otherwise.
pub const DEFAULT_LOG_SLOTS: u32 = 256;

/// Tunables of the metadata engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    /// Capacity of the FAT block cache, clamped to `[16, fat blocks]`.
    pub cache_blocks: usize,
    /// Blocks read per cache miss. 1 disables read-ahead.
    pub read_ahead: usize,
    /// Clusters reserved at once by deferred-commit transactions.
    pub pre_alloc_max: u32,
    /// Attempts at flushing the cache before an eviction gives up.
    pub evict_retries: u32,
    /// Spins a different owner waits for the log lock before `Busy`.
    pub lock_spin_limit: u64,
    /// Flip to read-only on corruption instead of stopping.
    pub remount_ro_on_corrupt: bool,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            cache_blocks: 128,
            read_ahead: 8,
            pre_alloc_max: 32,
            evict_retries: 3,
            lock_spin_limit: 1 << 24,
            remount_ro_on_corrupt: true,
        }
    }
}

impl FsConfig {
    pub fn from_json(data: &[u8]) -> FatResult<Self> {
        serde_json::from_slice(data).map_err(|e| {
            log::error!("bad mount configuration: {}", e);
            FatError::Config
        })
    }
}

/// Geometry of the volume, normally taken from the boot sector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeLayout {
    pub variant: FatVariant,
    /// Size of one FAT block as cached.
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    /// Byte offset of the first FAT copy.
    pub fat_base: u64,
    #[serde(default = "default_fat_copies")]
    pub fat_copies: u8,
    /// Bytes reserved for each FAT copy.
    pub fat_size: u64,
    /// Number of FAT entries, reserved entries 0 and 1 included.
    pub num_clusters: u32,
    /// Byte offset of cluster 2.
    pub data_base: u64,
    pub cluster_size: u32,
    /// First cluster of the log file.
    pub log_start: Cluster,
    #[serde(default = "default_log_slots")]
    pub log_slots: u32,
}

fn default_block_size() -> u32 {
    512
}

fn default_fat_copies() -> u8 {
    2
}

fn default_log_slots() -> u32 {
    DEFAULT_LOG_SLOTS
}

impl VolumeLayout {
    pub fn from_json(data: &[u8]) -> FatResult<Self> {
        let layout: Self = serde_json::from_slice(data).map_err(|e| {
            log::error!("bad volume layout: {}", e);
            FatError::Config
        })?;
        layout.validate()?;
        Ok(layout)
    }

    /// Checks that the geometry is self-consistent.
    pub fn validate(&self) -> FatResult<()> {
        let width = self.variant.entry_width() as u64;
        let sane = self.block_size >= 512
            && self.block_size.is_power_of_two()
            && self.cluster_size >= RECORD_SIZE as u32
            && self.cluster_size.is_power_of_two()
            && self.fat_copies >= 1
            && self.num_clusters > FIRST_CLUSTER
            && self.num_clusters <= self.variant.max_clusters()
            && self.fat_size >= self.num_clusters as u64 * width
            && self.fat_size % self.block_size as u64 == 0
            && self.log_slots >= 4
            && self.log_start >= FIRST_CLUSTER
            && self.log_start + self.log_clusters() <= self.num_clusters
            && self.data_base >= self.fat_base + self.fat_size * self.fat_copies as u64;
        if sane {
            Ok(())
        } else {
            log::error!("inconsistent volume layout: {:?}", self);
            Err(FatError::InvalidParam)
        }
    }

    /// Number of cache blocks needed to hold one FAT copy.
    pub fn fat_blocks(&self) -> u64 {
        let bytes = self.num_clusters as u64 * self.variant.entry_width() as u64;
        bytes.div_ceil(self.block_size as u64)
    }

    /// Clusters reserved for the log ring.
    pub fn log_clusters(&self) -> u32 {
        let bytes = self.log_slots as u64 * RECORD_SIZE as u64;
        bytes.div_ceil(self.cluster_size as u64) as u32
    }

    /// Byte offset of log slot 0.
    pub fn log_base(&self) -> u64 {
        self.cluster_offset(self.log_start)
    }

    pub fn cluster_offset(&self, cluster: Cluster) -> u64 {
        self.data_base + (cluster - FIRST_CLUSTER) as u64 * self.cluster_size as u64
    }

    /// Total bytes the volume needs on the device.
    pub fn volume_size(&self) -> u64 {
        self.cluster_offset(self.num_clusters)
    }
}
