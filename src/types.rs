//! Cluster indices, FAT entry values and the small value types built on them.

use serde::{Deserialize, Serialize};

/// Index of a cluster in the FAT. 0 and 1 are reserved.
pub type Cluster = u32;

/// First cluster index that can belong to a chain.
pub const FIRST_CLUSTER: Cluster = 2;

/// Table flavour, picked once at mount. It fixes the on-disk entry width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FatVariant {
    Fat16,
    Fat32,
}

const FAT16_BAD: u32 = 0xFFF7;
const FAT16_TAIL: u32 = 0xFFFF;
const FAT32_MASK: u32 = 0x0FFF_FFFF;
const FAT32_BAD: u32 = 0x0FFF_FFF7;
const FAT32_TAIL: u32 = 0x0FFF_FFFF;

impl FatVariant {
    /// Bytes per FAT entry.
    pub const fn entry_width(self) -> u32 {
        match self {
            FatVariant::Fat16 => 2,
            FatVariant::Fat32 => 4,
        }
    }

    /// Largest cluster count this variant can address.
    pub const fn max_clusters(self) -> u32 {
        match self {
            FatVariant::Fat16 => FAT16_BAD,
            FatVariant::Fat32 => FAT32_BAD,
        }
    }

    /// Decodes a raw on-disk value. Anything that does not name a usable
    /// cluster comes back as [`FatEntry::Reserved`].
    pub fn decode(self, raw: u32, num_clusters: u32) -> FatEntry {
        let (value, bad) = match self {
            FatVariant::Fat16 => (raw & 0xFFFF, FAT16_BAD),
            FatVariant::Fat32 => (raw & FAT32_MASK, FAT32_BAD),
        };
        match value {
            0 => FatEntry::Free,
            v if v == bad => FatEntry::Bad,
            v if v > bad => FatEntry::Tail,
            v if v >= FIRST_CLUSTER && v < num_clusters => FatEntry::Next(v),
            v => FatEntry::Reserved(v),
        }
    }

    /// Encodes an entry into its raw value. For FAT32 the caller keeps the
    /// top four bits of the previous value.
    pub fn encode(self, entry: FatEntry) -> u32 {
        match (self, entry) {
            (_, FatEntry::Free) => 0,
            (FatVariant::Fat16, FatEntry::Tail) => FAT16_TAIL,
            (FatVariant::Fat32, FatEntry::Tail) => FAT32_TAIL,
            (FatVariant::Fat16, FatEntry::Bad) => FAT16_BAD,
            (FatVariant::Fat32, FatEntry::Bad) => FAT32_BAD,
            (FatVariant::Fat16, FatEntry::Next(v) | FatEntry::Reserved(v)) => v & 0xFFFF,
            (FatVariant::Fat32, FatEntry::Next(v) | FatEntry::Reserved(v)) => v & FAT32_MASK,
        }
    }
}

/// Decoded FAT entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatEntry {
    Free,
    /// End of chain.
    Tail,
    Bad,
    Next(Cluster),
    /// Raw value that is neither a sentinel nor an in-range cluster.
    Reserved(u32),
}

impl FatEntry {
    pub fn is_free(&self) -> bool {
        matches!(self, FatEntry::Free)
    }
}

/// A run of consecutive clusters scheduled for deallocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub start: Cluster,
    pub count: u32,
}

impl Chunk {
    pub fn new(start: Cluster) -> Self {
        Self { start, count: 1 }
    }

    /// One past the last cluster of the run.
    pub fn end(&self) -> Cluster {
        self.start + self.count
    }

    /// Extends the run by `cluster` if it is the next consecutive index.
    pub fn try_extend(&mut self, cluster: Cluster) -> bool {
        if cluster == self.end() {
            self.count += 1;
            true
        } else {
            false
        }
    }

    pub fn clusters(&self) -> core::ops::Range<Cluster> {
        self.start..self.end()
    }
}

/// A chain piece parked in the journal's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub start: Cluster,
    pub last: Cluster,
}
