//! In-memory doubles for the device and the directory layer.

use alloc::{collections::BTreeMap, sync::Arc, vec, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spin::Mutex;

use crate::{
    allocator::ClusterAllocator,
    cache::FatCache,
    config::{FsConfig, VolumeLayout},
    device::BlockDevice,
    dirent::{EntryRef, EntryStore, RawDirEntry, XattrHeader},
    error::{FatError, FatResult},
    fs::FileSystem,
    journal::{ActiveTx, Journal},
    record::TxKind,
    table::FatTable,
    txn::{FatState, TxContext},
    types::{Cluster, FatVariant},
};

/// FAT16, 32 FAT blocks per copy, two copies, 512-byte clusters and the
/// log in clusters 2..258.
pub fn small_layout() -> VolumeLayout {
    VolumeLayout {
        variant: FatVariant::Fat16,
        block_size: 512,
        fat_base: 512,
        fat_copies: 2,
        fat_size: 32 * 512,
        num_clusters: 8192,
        data_base: 512 + 2 * 32 * 512,
        cluster_size: 512,
        log_start: 2,
        log_slots: 256,
    }
}

/// A table over an all-zero device.
pub fn small_table() -> (Arc<MemDevice>, FatTable) {
    let layout = small_layout();
    let dev = MemDevice::for_layout(&layout);
    let cache = FatCache::new(dev.clone(), &layout, &FsConfig::default());
    (dev, FatTable::new(cache, &layout))
}

/// A freshly formatted and mounted volume.
pub fn mounted() -> (Arc<MemDevice>, Arc<MemEntries>, FileSystem) {
    let layout = small_layout();
    let dev = MemDevice::for_layout(&layout);
    FileSystem::format(dev.clone(), &layout).unwrap();
    let entries = MemEntries::new();
    let fs = FileSystem::mount(dev.clone(), entries.clone(), layout, FsConfig::default()).unwrap();
    (dev, entries, fs)
}

pub fn remount(dev: &Arc<MemDevice>, entries: &Arc<MemEntries>) -> FileSystem {
    FileSystem::mount(dev.clone(), entries.clone(), small_layout(), FsConfig::default()).unwrap()
}

/// Both FAT copies as raw bytes.
pub fn fat_bytes(dev: &MemDevice) -> Vec<u8> {
    let layout = small_layout();
    dev.region(layout.fat_base, (layout.fat_size * layout.fat_copies as u64) as usize)
}

pub struct MemDevice {
    data: Mutex<Vec<u8>>,
    flushes: AtomicUsize,
    // writes still persisted before the simulated power cut
    budget: Mutex<Option<usize>>,
    fail: AtomicBool,
}

impl MemDevice {
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(vec![0; size]),
            flushes: AtomicUsize::new(0),
            budget: Mutex::new(None),
            fail: AtomicBool::new(false),
        })
    }

    pub fn for_layout(layout: &VolumeLayout) -> Arc<Self> {
        Self::new(layout.volume_size() as usize)
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn byte(&self, pos: u64) -> u8 {
        self.data.lock()[pos as usize]
    }

    pub fn region(&self, pos: u64, len: usize) -> Vec<u8> {
        self.data.lock()[pos as usize..pos as usize + len].to_vec()
    }

    /// Flips every bit of one byte in place.
    pub fn corrupt(&self, pos: u64) {
        self.data.lock()[pos as usize] ^= 0xFF;
    }

    pub fn fail_writes(&self, on: bool) {
        self.fail.store(on, Ordering::SeqCst);
    }

    /// Lets `writes` more writes reach the medium; later ones report
    /// success and are lost.
    pub fn cut_power_after(&self, writes: usize) {
        *self.budget.lock() = Some(writes);
    }

    pub fn restore_power(&self) {
        *self.budget.lock() = None;
    }

    /// An independent copy of the medium.
    pub fn snapshot(&self) -> Arc<Self> {
        let copy = Self::new(0);
        *copy.data.lock() = self.data.lock().clone();
        copy
    }
}

impl BlockDevice for MemDevice {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> FatResult<usize> {
        let data = self.data.lock();
        let start = pos as usize;
        let end = (start + buf.len()).min(data.len());
        if start >= end {
            return Ok(0);
        }
        buf[..end - start].copy_from_slice(&data[start..end]);
        Ok(end - start)
    }

    fn write_at(&self, pos: u64, buf: &[u8]) -> FatResult<usize> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(FatError::Io);
        }
        let mut budget = self.budget.lock();
        match budget.as_mut() {
            Some(0) => return Ok(buf.len()),
            Some(left) => *left -= 1,
            None => {}
        }
        let mut data = self.data.lock();
        let start = pos as usize;
        let end = (start + buf.len()).min(data.len());
        if start >= end {
            return Ok(0);
        }
        data[start..end].copy_from_slice(&buf[..end - start]);
        Ok(end - start)
    }

    fn size(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn flush(&self) -> FatResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(FatError::Io);
        }
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemEntries {
    slots: Mutex<BTreeMap<EntryRef, RawDirEntry>>,
    xattrs: Mutex<BTreeMap<Cluster, Vec<u8>>>,
    headers: Mutex<BTreeMap<Cluster, XattrHeader>>,
}

impl MemEntries {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put(&self, at: EntryRef, entry: RawDirEntry) {
        self.slots.lock().insert(at, entry);
    }

    pub fn snapshot(&self) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(self.slots.lock().clone()),
            xattrs: Mutex::new(self.xattrs.lock().clone()),
            headers: Mutex::new(self.headers.lock().clone()),
        })
    }
}

impl EntryStore for MemEntries {
    fn read_entry(&self, at: EntryRef) -> FatResult<RawDirEntry> {
        Ok(self.slots.lock().get(&at).copied().unwrap_or_default())
    }

    fn write_entry(&self, at: EntryRef, entry: &RawDirEntry) -> FatResult<()> {
        self.slots.lock().insert(at, *entry);
        Ok(())
    }

    fn read_xattr(&self, cluster: Cluster, offset: u32, buf: &mut [u8]) -> FatResult<()> {
        buf.fill(0);
        if let Some(data) = self.xattrs.lock().get(&cluster) {
            let start = (offset as usize).min(data.len());
            let end = (start + buf.len()).min(data.len());
            buf[..end - start].copy_from_slice(&data[start..end]);
        }
        Ok(())
    }

    fn write_xattr(&self, cluster: Cluster, offset: u32, bytes: &[u8]) -> FatResult<()> {
        let mut xattrs = self.xattrs.lock();
        let data = xattrs.entry(cluster).or_default();
        let end = offset as usize + bytes.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(bytes);
        Ok(())
    }

    fn xattr_header(&self, cluster: Cluster) -> FatResult<XattrHeader> {
        Ok(self.headers.lock().get(&cluster).copied().unwrap_or_default())
    }

    fn set_xattr_header(&self, cluster: Cluster, header: &XattrHeader) -> FatResult<()> {
        self.headers.lock().insert(cluster, *header);
        Ok(())
    }

    fn flush(&self) -> FatResult<()> {
        Ok(())
    }
}

/// The pieces of a mounted volume, loose, for driving a [`TxContext`]
/// directly.
pub struct Rig {
    pub layout: VolumeLayout,
    pub dev: Arc<MemDevice>,
    pub entries: Arc<MemEntries>,
    pub journal: Journal,
    pub fat: FatState,
}

impl Rig {
    pub fn new() -> Self {
        let layout = small_layout();
        let dev = MemDevice::for_layout(&layout);
        FileSystem::format(dev.clone(), &layout).unwrap();
        let cache = FatCache::new(dev.clone(), &layout, &FsConfig::default());
        let mut table = FatTable::new(cache, &layout);
        let alloc = ClusterAllocator::mount(&mut table).unwrap();
        let mut journal = Journal::new(dev.clone(), &layout);
        journal.scan().unwrap();
        Self {
            layout,
            dev,
            entries: MemEntries::new(),
            journal,
            fat: FatState { table, alloc },
        }
    }

    pub fn open(&mut self, kind: TxKind, target: u64) {
        self.journal.open_tx(ActiveTx::new(kind, target));
    }

    pub fn ctx(&mut self) -> TxContext<'_> {
        TxContext::new(&mut self.journal, &mut self.fat, &*self.entries, 32)
    }
}
