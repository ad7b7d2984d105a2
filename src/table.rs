//! FAT entry access on top of the block cache, and the chain iterator.

use alloc::vec::Vec;

use log::error;

use crate::{
    cache::FatCache,
    config::VolumeLayout,
    error::{FatError, FatResult},
    types::{Cluster, FatEntry, FatVariant, FIRST_CLUSTER},
};

pub struct FatTable {
    cache: FatCache,
    variant: FatVariant,
    num_clusters: u32,
}

impl FatTable {
    pub fn new(cache: FatCache, layout: &VolumeLayout) -> Self {
        Self {
            cache,
            variant: layout.variant,
            num_clusters: layout.num_clusters,
        }
    }

    pub fn variant(&self) -> FatVariant {
        self.variant
    }

    pub fn num_clusters(&self) -> u32 {
        self.num_clusters
    }

    pub fn cache(&self) -> &FatCache {
        &self.cache
    }

    pub fn is_valid(&self, cluster: Cluster) -> bool {
        cluster >= FIRST_CLUSTER && cluster < self.num_clusters
    }

    fn locate(&self, cluster: Cluster) -> (u64, usize) {
        let byte = cluster as u64 * self.variant.entry_width() as u64;
        let bs = self.cache.block_size() as u64;
        (byte / bs, (byte % bs) as usize)
    }

    fn read_raw(&mut self, cluster: Cluster) -> FatResult<u32> {
        let (block, at) = self.locate(cluster);
        let buf = self.cache.get(block)?;
        Ok(match self.variant {
            FatVariant::Fat16 => crate::le_u16!(buf, at) as u32,
            FatVariant::Fat32 => crate::le_u32!(buf, at),
        })
    }

    pub fn read_entry(&mut self, cluster: Cluster) -> FatResult<FatEntry> {
        if !self.is_valid(cluster) {
            return Err(FatError::InvalidParam);
        }
        let raw = self.read_raw(cluster)?;
        Ok(self.variant.decode(raw, self.num_clusters))
    }

    pub fn write_entry(&mut self, cluster: Cluster, entry: FatEntry) -> FatResult<()> {
        if !self.is_valid(cluster) {
            return Err(FatError::InvalidParam);
        }
        if let FatEntry::Next(next) = entry {
            if !self.is_valid(next) {
                return Err(FatError::InvalidParam);
            }
        }
        self.write_raw_entry(cluster, entry)
    }

    /// Writes any value, reserved entries 0 and 1 included. Used by format.
    pub(crate) fn write_raw_entry(&mut self, cluster: Cluster, entry: FatEntry) -> FatResult<()> {
        let (block, at) = self.locate(cluster);
        let value = self.variant.encode(entry);
        let variant = self.variant;
        let buf = self.cache.get_mut(block)?;
        match variant {
            FatVariant::Fat16 => buf[at..at + 2].copy_from_slice(&(value as u16).to_le_bytes()),
            FatVariant::Fat32 => {
                let kept = crate::le_u32!(buf, at) & 0xF000_0000;
                buf[at..at + 4].copy_from_slice(&(kept | value).to_le_bytes());
            }
        }
        self.cache.mark_dirty(block)
    }

    pub fn sync(&mut self, flush: bool) -> FatResult<()> {
        self.cache.sync(flush)
    }

    /// Iterates the chain starting at `start`.
    pub fn chain(&mut self, start: Cluster) -> ChainIter<'_> {
        ChainIter {
            table: self,
            next: Some(start),
            steps: 0,
        }
    }

    /// Collects a whole chain.
    pub fn collect_chain(&mut self, start: Cluster) -> FatResult<Vec<Cluster>> {
        self.chain(start).collect()
    }

    /// Last cluster of the chain and its length.
    pub fn chain_end(&mut self, start: Cluster) -> FatResult<(Cluster, u32)> {
        let mut last = start;
        let mut len = 0;
        for cluster in self.chain(start) {
            last = cluster?;
            len += 1;
        }
        Ok((last, len))
    }
}

/// Walks a chain, checking every link once.
///
/// Yields each cluster of the chain. A link to a free, bad or out-of-range
/// entry, or a walk longer than the table (a cycle), yields `Corrupt` and
/// ends the iteration.
pub struct ChainIter<'a> {
    table: &'a mut FatTable,
    next: Option<Cluster>,
    steps: u32,
}

impl Iterator for ChainIter<'_> {
    type Item = FatResult<Cluster>;

    fn next(&mut self) -> Option<Self::Item> {
        let cur = self.next.take()?;
        self.steps += 1;
        if self.steps > self.table.num_clusters {
            error!("fat chain loops back on itself at cluster {}", cur);
            return Some(Err(FatError::Corrupt));
        }
        match self.table.read_entry(cur) {
            Ok(FatEntry::Next(n)) => self.next = Some(n),
            Ok(FatEntry::Tail) => {}
            Ok(other) => {
                error!("fat chain broken at cluster {}: {:?}", cur, other);
                return Some(Err(FatError::Corrupt));
            }
            Err(e) => return Some(Err(e)),
        }
        Some(Ok(cur))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{small_layout, small_table};

    #[test]
    fn entries_round_trip_through_cache() {
        let (_, mut table) = small_table();
        table.write_entry(10, FatEntry::Next(11)).unwrap();
        table.write_entry(11, FatEntry::Tail).unwrap();
        assert_eq!(table.read_entry(10).unwrap(), FatEntry::Next(11));
        assert_eq!(table.read_entry(11).unwrap(), FatEntry::Tail);
        assert_eq!(table.read_entry(12).unwrap(), FatEntry::Free);
    }

    #[test]
    fn reserved_indices_are_rejected() {
        let (_, mut table) = small_table();
        assert_eq!(table.read_entry(0), Err(FatError::InvalidParam));
        assert_eq!(table.read_entry(1), Err(FatError::InvalidParam));
        let n = small_layout().num_clusters;
        assert_eq!(table.read_entry(n), Err(FatError::InvalidParam));
        assert_eq!(table.write_entry(5, FatEntry::Next(1)), Err(FatError::InvalidParam));
    }

    #[test]
    fn chain_walk_stops_at_tail() {
        let (_, mut table) = small_table();
        table.write_entry(4, FatEntry::Next(9)).unwrap();
        table.write_entry(9, FatEntry::Next(5)).unwrap();
        table.write_entry(5, FatEntry::Tail).unwrap();
        assert_eq!(table.collect_chain(4).unwrap(), [4, 9, 5]);
        assert_eq!(table.chain_end(4).unwrap(), (5, 3));
    }

    #[test]
    fn chain_into_free_entry_is_corrupt() {
        let (_, mut table) = small_table();
        table.write_entry(4, FatEntry::Next(9)).unwrap();
        assert_eq!(table.collect_chain(4), Err(FatError::Corrupt));
    }

    #[test]
    fn chain_cycle_is_corrupt() {
        let (_, mut table) = small_table();
        table.write_entry(4, FatEntry::Next(5)).unwrap();
        table.write_entry(5, FatEntry::Next(4)).unwrap();
        assert_eq!(table.collect_chain(4), Err(FatError::Corrupt));
    }
}
