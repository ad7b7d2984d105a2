//! The mounted volume and its transaction handle.
//!
//! Locks are always taken log first, then FAT. A [`Transaction`] holds the
//! log lock for its whole life and takes the FAT lock per operation.

use alloc::{sync::Arc, vec, vec::Vec};
use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use log::{debug, error, info, warn};
use spin::{Mutex, MutexGuard};

use crate::{
    allocator::ClusterAllocator,
    cache::{CacheStats, FatCache},
    config::{FsConfig, VolumeLayout},
    device::{write_all_at, BlockDevice},
    dirent::{EntryRef, EntryStore, RawDirEntry, XattrHeader},
    error::{FatError, FatResult},
    journal::{ActiveTx, Journal, JournalStats, LogGuard, LogLock, OwnerId, TxFlags},
    recovery::{self, RecoveryReport},
    record::{PoolState, TxKind},
    table::FatTable,
    txn::{FatState, TxContext},
    types::{Cluster, FatEntry, FatVariant, Segment},
};

bitflags! {
    pub struct MountFlags: u32 {
        /// Set after a corruption; no new transactions are accepted.
        const READ_ONLY = 1 << 0;
    }
}

pub struct FileSystem {
    layout: VolumeLayout,
    config: FsConfig,
    fat: Mutex<FatState>,
    journal: LogLock<Journal>,
    entries: Arc<dyn EntryStore>,
    flags: AtomicU32,
    report: RecoveryReport,
}

impl FileSystem {
    /// Initialises a blank volume: empty FAT copies, the reserved entries,
    /// the log file's chain and a zeroed log.
    pub fn format(device: Arc<dyn BlockDevice>, layout: &VolumeLayout) -> FatResult<()> {
        layout.validate()?;
        if device.size() < layout.volume_size() {
            return Err(FatError::InvalidParam);
        }
        let bs = layout.block_size as u64;
        let zero = vec![0u8; layout.block_size as usize];
        for copy in 0..layout.fat_copies as u64 {
            for block in 0..layout.fat_size / bs {
                let pos = layout.fat_base + copy * layout.fat_size + block * bs;
                write_all_at(&*device, pos, &zero)?;
            }
        }

        let cache = FatCache::new(device.clone(), layout, &FsConfig::default());
        let mut table = FatTable::new(cache, layout);
        let media = match layout.variant {
            FatVariant::Fat16 => 0xFFF8,
            FatVariant::Fat32 => 0x0FFF_FFF8,
        };
        table.write_raw_entry(0, FatEntry::Reserved(media))?;
        table.write_raw_entry(1, FatEntry::Tail)?;
        let first = layout.log_start;
        let last = first + layout.log_clusters() - 1;
        for cluster in first..last {
            table.write_entry(cluster, FatEntry::Next(cluster + 1))?;
        }
        table.write_entry(last, FatEntry::Tail)?;
        table.sync(true)?;

        Journal::new(device, layout).format()?;
        info!(
            "format: {:?}, {} clusters, log at {}..={}",
            layout.variant, layout.num_clusters, first, last
        );
        Ok(())
    }

    /// Loads the FAT, replays the log and drains the pool. A corrupt log
    /// leaves the volume read-only, or stops, depending on the config.
    pub fn mount(
        device: Arc<dyn BlockDevice>,
        entries: Arc<dyn EntryStore>,
        layout: VolumeLayout,
        config: FsConfig,
    ) -> FatResult<Self> {
        layout.validate()?;
        if device.size() < layout.volume_size() {
            error!("mount: device is smaller than the volume");
            return Err(FatError::InvalidParam);
        }
        let cache = FatCache::new(device.clone(), &layout, &config);
        let mut table = FatTable::new(cache, &layout);
        let alloc = ClusterAllocator::mount(&mut table)?;
        let mut fat = FatState { table, alloc };
        let mut journal = Journal::new(device, &layout);

        let recovered = {
            let mut ctx = TxContext::new(&mut journal, &mut fat, &*entries, config.pre_alloc_max);
            recovery::recover(&mut ctx)
        };
        let (report, flags) = match recovered {
            Ok(report) => (report, MountFlags::empty()),
            Err(e) if e.is_corruption() => {
                error!("mount: log replay hit corruption: {}", e);
                if !config.remount_ro_on_corrupt {
                    panic!("fat metadata corrupt at mount: {}", e);
                }
                warn!("mount: continuing read-only");
                (RecoveryReport::default(), MountFlags::READ_ONLY)
            }
            Err(e) => return Err(e),
        };
        info!(
            "mount: {} free clusters, next record {}",
            fat.alloc.free_clusters(),
            journal.next_sequence()
        );
        let lock_spin_limit = config.lock_spin_limit;
        Ok(Self {
            layout,
            config,
            fat: Mutex::new(fat),
            journal: LogLock::new(journal, lock_spin_limit),
            entries,
            flags: AtomicU32::new(flags.bits()),
            report,
        })
    }

    pub fn layout(&self) -> &VolumeLayout {
        &self.layout
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    pub fn recovery_report(&self) -> RecoveryReport {
        self.report
    }

    pub fn mount_flags(&self) -> MountFlags {
        MountFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn is_read_only(&self) -> bool {
        self.mount_flags().contains(MountFlags::READ_ONLY)
    }

    /// Opens a transaction for `owner`. A deferred transaction parked in
    /// the log is folded in when kind and target match and committed
    /// otherwise.
    pub fn begin(&self, owner: OwnerId, kind: TxKind, target: u64) -> FatResult<Transaction<'_>> {
        if self.is_read_only() {
            return Err(FatError::ReadOnly);
        }
        if kind == TxKind::Recovery {
            return Err(FatError::InvalidParam);
        }
        let mut journal = self.journal.lock(owner)?;
        let parked = journal.tx().map(|tx| (tx.kind, tx.target));
        match parked {
            Some((k, t)) if k == kind && t == target => {
                if let Some(tx) = journal.tx_mut() {
                    tx.depth = 1;
                }
                debug!("journal: folding {:?} on {} into the deferred transaction", kind, target);
            }
            Some((k, t)) => {
                warn!("journal: committing deferred {:?} on {} before {:?}", k, t, kind);
                self.flush_parked(&mut journal)?;
                journal.open_tx(ActiveTx::new(kind, target));
            }
            None => journal.open_tx(ActiveTx::new(kind, target)),
        }
        Ok(Transaction {
            fs: self,
            journal,
            ended: false,
        })
    }

    /// Runs `f` in its own transaction and ends it with `f`'s outcome.
    pub fn run<R>(
        &self,
        owner: OwnerId,
        kind: TxKind,
        target: u64,
        f: impl FnOnce(&mut Transaction<'_>) -> FatResult<R>,
    ) -> FatResult<R> {
        let mut tx = self.begin(owner, kind, target)?;
        match f(&mut tx) {
            Ok(value) => {
                tx.end(Ok(()))?;
                Ok(value)
            }
            Err(e) => {
                // end reports the original error; a failed rollback has
                // already been escalated
                let _ = tx.end(Err(e));
                Err(e)
            }
        }
    }

    /// Commits a parked deferred transaction and writes the FAT back.
    pub fn sync(&self, owner: OwnerId) -> FatResult<()> {
        let mut journal = self.journal.lock(owner)?;
        self.flush_parked(&mut journal)?;
        self.lock_fat()?.table.sync(true).map_err(|e| self.escalate(e))?;
        self.entries.flush()
    }

    /// Syncs and leaves a final commit so the next mount has nothing to do.
    pub fn unmount(self, owner: OwnerId) -> FatResult<()> {
        self.sync(owner)?;
        if !self.is_read_only() {
            let mut journal = self.journal.lock(owner)?;
            journal.write_commit()?;
        }
        info!("unmount: clean");
        Ok(())
    }

    fn flush_parked(&self, journal: &mut LogGuard<'_, Journal>) -> FatResult<()> {
        if journal.tx().is_none() {
            return Ok(());
        }
        let mut fat = self.lock_fat()?;
        let committed = {
            let mut ctx = TxContext::new(journal, &mut fat, &*self.entries, self.config.pre_alloc_max);
            let result = ctx.commit_records();
            if result.is_err() {
                if let Err(e) = ctx.rollback() {
                    error!("journal: rollback of deferred transaction failed: {}", e);
                }
            }
            result
        };
        journal.take_tx();
        committed.map_err(|e| self.escalate(e))
    }

    /// Applies the corruption policy to `e` and hands it back.
    fn escalate(&self, e: FatError) -> FatError {
        if e.is_corruption() {
            error!("fat metadata corrupt: {}", e);
            if !self.config.remount_ro_on_corrupt {
                panic!("fat metadata corrupt: {}", e);
            }
            self.flags
                .fetch_or(MountFlags::READ_ONLY.bits(), Ordering::AcqRel);
            warn!("volume is now read-only");
        }
        e
    }

    /// Takes the FAT lock, waiting at most `lock_spin_limit` spins.
    fn lock_fat(&self) -> FatResult<MutexGuard<'_, FatState>> {
        let limit = self.config.lock_spin_limit.max(1);
        for _ in 0..limit {
            if let Some(guard) = self.fat.try_lock() {
                return Ok(guard);
            }
            core::hint::spin_loop();
        }
        warn!("fat lock: gave up after {} spins", limit);
        Err(FatError::Busy)
    }

    pub fn fat_entry(&self, cluster: Cluster) -> FatResult<FatEntry> {
        self.lock_fat()?.table.read_entry(cluster)
    }

    pub fn chain(&self, start: Cluster) -> FatResult<Vec<Cluster>> {
        self.lock_fat()?.table.collect_chain(start)
    }

    pub fn free_clusters(&self) -> FatResult<u32> {
        Ok(self.lock_fat()?.alloc.free_clusters())
    }

    pub fn cache_stats(&self) -> FatResult<CacheStats> {
        Ok(self.lock_fat()?.table.cache().stats())
    }

    pub fn journal_stats(&self) -> FatResult<JournalStats> {
        self.journal.inspect(|j| j.stats())
    }

    pub fn next_sequence(&self) -> FatResult<u64> {
        self.journal.inspect(|j| j.next_sequence())
    }

    pub fn pool(&self) -> FatResult<(PoolState, Vec<Segment>)> {
        self.journal
            .inspect(|j| (j.pool(), j.segments().iter().copied().collect()))
    }
}

/// An open transaction. Ends with [`Transaction::end`]; dropping it
/// unended rolls it back.
pub struct Transaction<'a> {
    fs: &'a FileSystem,
    journal: LogGuard<'a, Journal>,
    ended: bool,
}

impl Transaction<'_> {
    pub fn kind(&self) -> Option<TxKind> {
        self.journal.tx().map(|tx| tx.kind)
    }

    pub fn depth(&self) -> u32 {
        self.journal.tx().map_or(0, |tx| tx.depth)
    }

    pub fn journal_stats(&self) -> JournalStats {
        self.journal.stats()
    }

    fn with<R>(&mut self, f: impl FnOnce(&mut TxContext<'_>) -> FatResult<R>) -> FatResult<R> {
        if self.ended {
            return Err(FatError::InvalidParam);
        }
        let fs = self.fs;
        let mut fat = fs.lock_fat()?;
        let mut ctx = TxContext::new(&mut self.journal, &mut fat, &*fs.entries, fs.config.pre_alloc_max);
        f(&mut ctx).map_err(|e| fs.escalate(e))
    }

    /// Nests another operation in this transaction. A different kind or
    /// target on top of a deferred transaction commits the deferred part
    /// first.
    pub fn start(&mut self, kind: TxKind, target: u64) -> FatResult<()> {
        let current = self
            .journal
            .tx()
            .map(|tx| (tx.kind, tx.target))
            .ok_or(FatError::InvalidParam)?;
        if self.ended || kind == TxKind::Recovery {
            return Err(FatError::InvalidParam);
        }
        if current != (kind, target) && current.0.is_deferred() {
            self.with(|ctx| ctx.checkpoint())?;
            if let Some(tx) = self.journal.tx_mut() {
                tx.kind = kind;
                tx.target = target;
            }
        }
        if let Some(tx) = self.journal.tx_mut() {
            tx.depth += 1;
        }
        Ok(())
    }

    /// Closes one level. The outermost `end` commits, parks a deferred
    /// transaction, or rolls back on `Err`, and returns `result`.
    pub fn end(&mut self, result: FatResult<()>) -> FatResult<()> {
        if self.ended {
            return Err(FatError::InvalidParam);
        }
        let depth = self.depth();
        if depth > 1 {
            if let Some(tx) = self.journal.tx_mut() {
                tx.depth -= 1;
            }
            return result;
        }
        self.finish(result)
    }

    fn finish(&mut self, result: FatResult<()>) -> FatResult<()> {
        match result {
            Ok(()) => {
                let outcome = self.complete();
                self.ended = true;
                outcome
            }
            Err(e) => {
                let rolled = self.with(|ctx| ctx.rollback());
                self.ended = true;
                self.journal.take_tx();
                if let Err(re) = rolled {
                    error!("journal: rollback failed: {}", re);
                }
                Err(e)
            }
        }
    }

    fn complete(&mut self) -> FatResult<()> {
        let Some(tx) = self.journal.tx() else {
            return Ok(());
        };
        if !tx.flags.contains(TxFlags::DIRTY) {
            self.with(|ctx| {
                ctx.release_window();
                Ok(())
            })?;
            self.journal.take_tx();
            return Ok(());
        }
        if tx.kind.is_deferred() {
            debug!("journal: deferring commit of {:?} on {}", tx.kind, tx.target);
            if let Some(tx) = self.journal.tx_mut() {
                tx.depth = 0;
            }
            return Ok(());
        }
        let committed = self.with(|ctx| {
            let result = ctx.commit_records();
            if result.is_err() {
                if let Err(e) = ctx.rollback() {
                    error!("journal: rollback after failed commit: {}", e);
                }
            }
            result
        });
        self.journal.take_tx();
        committed
    }

    pub fn alloc_chain(&mut self, entry: EntryRef, prev_tail: Option<Cluster>, n: u32) -> FatResult<Vec<Cluster>> {
        self.with(|ctx| ctx.alloc_chain(entry, prev_tail, n))
    }

    pub fn append_cluster(&mut self, entry: EntryRef, last: Option<Cluster>) -> FatResult<Cluster> {
        self.with(|ctx| ctx.append_cluster(entry, last))
    }

    pub fn build_entry(&mut self, parent: Cluster, slots: &[(u32, RawDirEntry)]) -> FatResult<()> {
        self.with(|ctx| ctx.build_entry(parent, slots))
    }

    pub fn remove_entry(&mut self, parent: Cluster, indices: &[u32]) -> FatResult<()> {
        self.with(|ctx| ctx.remove_entry(parent, indices))
    }

    pub fn move_to_pool(&mut self, entry: EntryRef, start: Cluster) -> FatResult<()> {
        self.with(|ctx| ctx.move_to_pool(entry, start))
    }

    pub fn release_segment(&mut self, start: Cluster) -> FatResult<u32> {
        self.with(|ctx| ctx.release_segment(start))
    }

    pub fn truncate(&mut self, entry: EntryRef, start: Option<Cluster>, keep: u32) -> FatResult<u32> {
        self.with(|ctx| ctx.truncate(entry, start, keep))
    }

    pub fn free_chain(&mut self, start: Cluster) -> FatResult<u32> {
        self.with(|ctx| ctx.free_chain(start))
    }

    pub fn set_xattr(
        &mut self,
        entry: EntryRef,
        cluster: Cluster,
        offset: u32,
        data: &[u8],
        header: XattrHeader,
    ) -> FatResult<()> {
        self.with(|ctx| ctx.set_xattr(entry, cluster, offset, data, header))
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.ended {
            error!("journal: transaction dropped without end, rolling back");
            let _ = self.finish(Err(FatError::InvalidParam));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dirent::DELETED_MARKER,
        testutil::{mounted, small_layout, MemDevice, MemEntries},
    };

    const ME: OwnerId = OwnerId(1);
    const DIR: Cluster = 300;

    fn file(index: u32) -> EntryRef {
        EntryRef::new(DIR, index)
    }

    #[test]
    fn format_reserves_log_clusters() {
        let (_, _, fs) = mounted();
        let layout = small_layout();
        let log = fs.chain(layout.log_start).unwrap();
        assert_eq!(log.len() as u32, layout.log_clusters());
        let data = layout.num_clusters - 2 - layout.log_clusters();
        assert_eq!(fs.free_clusters().unwrap(), data);
        // mount counted every entry through the cache
        assert!(fs.cache_stats().unwrap().misses > 0);
    }

    #[test]
    fn committed_alloc_survives_remount() {
        let (dev, entries, fs) = mounted();
        entries.put(file(0), RawDirEntry::new(b"A       TXT", 0x20));
        let chain = fs
            .run(ME, TxKind::Create, 1, |tx| tx.alloc_chain(file(0), None, 4))
            .unwrap();
        drop(fs);
        let fs = FileSystem::mount(dev, entries.clone(), small_layout(), FsConfig::default()).unwrap();
        assert_eq!(fs.chain(chain[0]).unwrap(), chain);
        assert_eq!(fs.recovery_report().undone, 0);
        assert_eq!(entries.start_cluster(file(0)).unwrap(), Some(chain[0]));
    }

    #[test]
    fn clean_transaction_writes_nothing() {
        let (_, _, fs) = mounted();
        let before = fs.journal_stats().unwrap();
        fs.run(ME, TxKind::Create, 1, |_| Ok(())).unwrap();
        assert_eq!(fs.journal_stats().unwrap(), before);
    }

    #[test]
    fn failed_transaction_is_rolled_back() {
        let (_, entries, fs) = mounted();
        entries.put(file(1), RawDirEntry::new(b"B       TXT", 0x20));
        let free = fs.free_clusters().unwrap();
        let result: FatResult<()> = fs.run(ME, TxKind::Remove, 1, |tx| {
            tx.remove_entry(DIR, &[1])?;
            tx.alloc_chain(file(1), None, 2)?;
            Err(FatError::NoSpace)
        });
        assert_eq!(result, Err(FatError::NoSpace));
        assert_eq!(fs.free_clusters().unwrap(), free);
        assert_ne!(entries.marker(file(1)).unwrap(), DELETED_MARKER);
        assert_eq!(entries.start_cluster(file(1)).unwrap(), None);
        assert_eq!(fs.journal_stats().unwrap().aborts, 1);
    }

    #[test]
    fn dropped_handle_rolls_back() {
        let (_, entries, fs) = mounted();
        entries.put(file(2), RawDirEntry::new(b"C       TXT", 0x20));
        let free = fs.free_clusters().unwrap();
        {
            let mut tx = fs.begin(ME, TxKind::Create, 2).unwrap();
            tx.alloc_chain(file(2), None, 3).unwrap();
        }
        assert_eq!(fs.free_clusters().unwrap(), free);
        assert!(fs.run(ME, TxKind::Create, 2, |_| Ok(())).is_ok());
    }

    #[test]
    fn nested_start_shares_one_commit() {
        let (_, entries, fs) = mounted();
        entries.put(file(3), RawDirEntry::new(b"D       TXT", 0x20));
        let mut tx = fs.begin(ME, TxKind::Create, 3).unwrap();
        tx.build_entry(DIR, &[(3, RawDirEntry::new(b"D       TXT", 0x20))]).unwrap();
        tx.start(TxKind::Create, 3).unwrap();
        assert_eq!(tx.depth(), 2);
        tx.alloc_chain(file(3), None, 1).unwrap();
        tx.end(Ok(())).unwrap();
        assert_eq!(tx.journal_stats().commits, 0);
        tx.end(Ok(())).unwrap();
        drop(tx);
        assert_eq!(fs.journal_stats().unwrap().commits, 1);
    }

    #[test]
    fn same_owner_cannot_begin_twice() {
        let (_, _, fs) = mounted();
        let _tx = fs.begin(ME, TxKind::Create, 1).unwrap();
        assert_eq!(fs.begin(ME, TxKind::Create, 2).map(|_| ()), Err(FatError::InvalidParam));
    }

    #[test]
    fn other_owner_times_out() {
        let layout = small_layout();
        let dev = MemDevice::for_layout(&layout);
        FileSystem::format(dev.clone(), &layout).unwrap();
        let config = FsConfig {
            lock_spin_limit: 64,
            ..FsConfig::default()
        };
        let fs = FileSystem::mount(dev, MemEntries::new(), layout, config).unwrap();
        let _tx = fs.begin(ME, TxKind::Create, 1).unwrap();
        assert_eq!(fs.begin(OwnerId(2), TxKind::Create, 2).map(|_| ()), Err(FatError::Busy));
    }

    #[test]
    fn held_fat_lock_times_out() {
        let layout = small_layout();
        let dev = MemDevice::for_layout(&layout);
        FileSystem::format(dev.clone(), &layout).unwrap();
        let config = FsConfig {
            lock_spin_limit: 64,
            ..FsConfig::default()
        };
        let entries = MemEntries::new();
        entries.put(file(0), RawDirEntry::new(b"A       TXT", 0x20));
        let fs = FileSystem::mount(dev, entries, layout, config).unwrap();
        let held = fs.fat.lock();
        assert_eq!(fs.fat_entry(2), Err(FatError::Busy));
        assert_eq!(fs.free_clusters(), Err(FatError::Busy));
        let result = fs.run(ME, TxKind::Create, 1, |tx| tx.alloc_chain(file(0), None, 1));
        assert_eq!(result.map(|_| ()), Err(FatError::Busy));
        drop(held);
        assert!(fs.free_clusters().is_ok());
        assert!(!fs.is_read_only());
    }

    #[test]
    fn deferred_write_folds_and_commits_on_sync() {
        let (_, entries, fs) = mounted();
        entries.put(file(4), RawDirEntry::new(b"E       LOG", 0x20));
        let mut last = None;
        for _ in 0..3 {
            last = Some(
                fs.run(ME, TxKind::Write, 4, |tx| tx.append_cluster(file(4), last))
                    .unwrap(),
            );
        }
        let stats = fs.journal_stats().unwrap();
        assert_eq!(stats.commits, 0);
        // start plus one pre-allocation record
        assert_eq!(stats.records, 2);
        fs.sync(ME).unwrap();
        assert_eq!(fs.journal_stats().unwrap().commits, 1);
        let start = entries.start_cluster(file(4)).unwrap().unwrap();
        assert_eq!(fs.chain(start).unwrap().len(), 3);
    }

    #[test]
    fn other_kind_commits_parked_write() {
        let (_, entries, fs) = mounted();
        entries.put(file(5), RawDirEntry::new(b"F       LOG", 0x20));
        fs.run(ME, TxKind::Write, 5, |tx| tx.append_cluster(file(5), None))
            .unwrap();
        assert_eq!(fs.journal_stats().unwrap().commits, 0);
        fs.run(ME, TxKind::Create, 6, |tx| {
            tx.build_entry(DIR, &[(6, RawDirEntry::new(b"G       TXT", 0x20))])
        })
        .unwrap();
        assert_eq!(fs.journal_stats().unwrap().commits, 2);
    }

    #[test]
    fn truncate_keeps_head_of_chain() {
        let (_, entries, fs) = mounted();
        entries.put(file(7), RawDirEntry::new(b"H       BIN", 0x20));
        let chain = fs
            .run(ME, TxKind::Create, 7, |tx| tx.alloc_chain(file(7), None, 6))
            .unwrap();
        let freed = fs
            .run(ME, TxKind::Truncate, 7, |tx| tx.truncate(file(7), Some(chain[0]), 2))
            .unwrap();
        assert_eq!(freed, 4);
        assert_eq!(fs.chain(chain[0]).unwrap(), chain[..2]);
        let none = fs
            .run(ME, TxKind::Truncate, 7, |tx| tx.truncate(file(7), Some(chain[0]), 5))
            .unwrap();
        assert_eq!(none, 0);
        fs.run(ME, TxKind::Truncate, 7, |tx| tx.truncate(file(7), Some(chain[0]), 0))
            .unwrap();
        assert_eq!(entries.start_cluster(file(7)).unwrap(), None);
        assert_eq!(fs.fat_entry(chain[0]).unwrap(), FatEntry::Free);
    }

    #[test]
    fn undo_after_dealloc_is_refused() {
        let (_, entries, fs) = mounted();
        entries.put(file(8), RawDirEntry::new(b"I       BIN", 0x20));
        let chain = fs
            .run(ME, TxKind::Create, 8, |tx| tx.alloc_chain(file(8), None, 2))
            .unwrap();
        let result = fs.run(ME, TxKind::Remove, 8, |tx| {
            tx.free_chain(chain[0])?;
            tx.remove_entry(DIR, &[8])
        });
        assert_eq!(result, Err(FatError::InvalidParam));
        // the dealloc is completed by the rollback, not undone
        assert_eq!(fs.fat_entry(chain[0]).unwrap(), FatEntry::Free);
    }

    #[test]
    fn corruption_flips_read_only() {
        let (_, _, fs) = mounted();
        let n = fs.layout().num_clusters;
        let result = fs.run(ME, TxKind::Remove, 1, |tx| tx.free_chain(n - 1));
        assert_eq!(result, Err(FatError::Corrupt));
        assert!(fs.is_read_only());
        assert_eq!(fs.begin(ME, TxKind::Create, 1).map(|_| ()), Err(FatError::ReadOnly));
    }

    #[test]
    fn unmount_leaves_nothing_to_replay() {
        let (dev, entries, fs) = mounted();
        entries.put(file(9), RawDirEntry::new(b"J       LOG", 0x20));
        fs.run(ME, TxKind::Write, 9, |tx| tx.append_cluster(file(9), None))
            .unwrap();
        fs.unmount(ME).unwrap();
        let fs = FileSystem::mount(dev, entries.clone(), small_layout(), FsConfig::default()).unwrap();
        let report = fs.recovery_report();
        assert_eq!(report.undone + report.redone, 0);
        assert!(entries.start_cluster(file(9)).unwrap().is_some());
    }
}
