//! Directory entry and extended attribute access, as seen by the journal.
//!
//! Name encoding and directory layout belong to the layer above. The journal
//! only needs to flip delete markers, rewrite start clusters and save or
//! restore attribute bytes, so that is all [`EntryStore`] exposes.

use crate::{error::FatResult, types::Cluster};

/// Size of one on-disk directory slot.
pub const DIR_ENTRY_SIZE: usize = 32;
/// Marker byte of a deleted slot.
pub const DELETED_MARKER: u8 = 0xE5;
/// Marker byte of a slot that was never used.
pub const UNUSED_MARKER: u8 = 0x00;

const MARKER_AT: usize = 0;
const CLUSTER_HIGH_AT: usize = 20;
const CLUSTER_LOW_AT: usize = 26;

/// Position of a directory slot: the directory's first cluster and the slot
/// index inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EntryRef {
    pub parent: Cluster,
    pub index: u32,
}

impl EntryRef {
    pub const fn new(parent: Cluster, index: u32) -> Self {
        Self { parent, index }
    }
}

/// Raw bytes of one directory slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawDirEntry(pub [u8; DIR_ENTRY_SIZE]);

impl Default for RawDirEntry {
    fn default() -> Self {
        Self([0; DIR_ENTRY_SIZE])
    }
}

impl RawDirEntry {
    /// A short entry with the given 8.3 name and attribute byte.
    pub fn new(name: &[u8; 11], attr: u8) -> Self {
        let mut raw = [0u8; DIR_ENTRY_SIZE];
        raw[..11].copy_from_slice(name);
        raw[11] = attr;
        Self(raw)
    }

    pub fn marker(&self) -> u8 {
        self.0[MARKER_AT]
    }

    pub fn set_marker(&mut self, marker: u8) {
        self.0[MARKER_AT] = marker;
    }

    pub fn is_live(&self) -> bool {
        !matches!(self.marker(), DELETED_MARKER | UNUSED_MARKER)
    }

    /// First cluster of the entry's chain, `None` for an empty file.
    pub fn start_cluster(&self) -> Option<Cluster> {
        let high = crate::le_u16!(self.0, CLUSTER_HIGH_AT) as u32;
        let low = crate::le_u16!(self.0, CLUSTER_LOW_AT) as u32;
        match high << 16 | low {
            0 => None,
            c => Some(c),
        }
    }

    pub fn set_start_cluster(&mut self, cluster: Option<Cluster>) {
        let c = cluster.unwrap_or(0);
        self.0[CLUSTER_HIGH_AT..CLUSTER_HIGH_AT + 2].copy_from_slice(&((c >> 16) as u16).to_le_bytes());
        self.0[CLUSTER_LOW_AT..CLUSTER_LOW_AT + 2].copy_from_slice(&(c as u16).to_le_bytes());
    }
}

/// Bookkeeping fields at the front of an xattr cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XattrHeader {
    pub entry_count: u16,
    pub used_bytes: u32,
    pub free_offset: u32,
}

/// Directory entry and xattr storage, owned by the layer above.
pub trait EntryStore: Send + Sync {
    fn read_entry(&self, at: EntryRef) -> FatResult<RawDirEntry>;
    fn write_entry(&self, at: EntryRef, entry: &RawDirEntry) -> FatResult<()>;
    fn read_xattr(&self, cluster: Cluster, offset: u32, buf: &mut [u8]) -> FatResult<()>;
    fn write_xattr(&self, cluster: Cluster, offset: u32, data: &[u8]) -> FatResult<()>;
    fn xattr_header(&self, cluster: Cluster) -> FatResult<XattrHeader>;
    fn set_xattr_header(&self, cluster: Cluster, header: &XattrHeader) -> FatResult<()>;
    /// Makes every entry and xattr write durable.
    fn flush(&self) -> FatResult<()>;

    fn marker(&self, at: EntryRef) -> FatResult<u8> {
        Ok(self.read_entry(at)?.marker())
    }

    fn set_marker(&self, at: EntryRef, marker: u8) -> FatResult<()> {
        let mut entry = self.read_entry(at)?;
        if entry.marker() == marker {
            return Ok(());
        }
        entry.set_marker(marker);
        self.write_entry(at, &entry)
    }

    fn start_cluster(&self, at: EntryRef) -> FatResult<Option<Cluster>> {
        Ok(self.read_entry(at)?.start_cluster())
    }

    fn set_start_cluster(&self, at: EntryRef, cluster: Option<Cluster>) -> FatResult<()> {
        let mut entry = self.read_entry(at)?;
        if entry.start_cluster() == cluster {
            return Ok(());
        }
        entry.set_start_cluster(cluster);
        self.write_entry(at, &entry)
    }
}
