//! The circular log, its transaction state and the log lock.
//!
//! The log is a ring of fixed 512-byte slots inside the log file. Record
//! `seq` always lives in slot `seq % slots`, and every record is flushed to
//! the device before the table change it describes is made. A transaction
//! writes its `Start` record lazily with its first real record, so
//! transactions that never change anything cost nothing.

use alloc::{collections::VecDeque, sync::Arc};
use core::{
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU64, Ordering},
};

use bitflags::bitflags;
use log::{debug, warn};
use spin::{Mutex, MutexGuard};

use crate::{
    config::VolumeLayout,
    device::{read_exact_at, write_all_at, BlockDevice},
    dirent::EntryRef,
    error::{FatError, FatResult},
    record::{LogRecord, PoolState, RecordBody, RecordHeader, TxKind, RECORD_SIZE},
    segment::SegmentList,
    types::Cluster,
};

/// Proof that a transaction is open. Every call that changes the FAT takes
/// one by reference.
pub struct TxToken {
    _private: (),
}

impl TxToken {
    pub(crate) fn new() -> Self {
        Self { _private: () }
    }
}

bitflags! {
    pub struct TxFlags: u32 {
        /// The `Start` record is on disk.
        const STARTED = 1 << 0;
        /// Something was logged; ending needs a commit.
        const DIRTY = 1 << 1;
        /// A dealloc spans several records and still owes its
        /// multi-record commit.
        const NEED_MRC = 1 << 2;
        /// A dealloc record was logged; only redo records may follow.
        const REDO_PHASE = 1 << 3;
    }
}

/// Clusters reserved ahead of need by a deferred transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreAlloc {
    pub entry: EntryRef,
    /// Cluster the next reserved cluster gets linked after.
    pub last: Option<Cluster>,
    pub clusters: VecDeque<Cluster>,
}

/// State of the transaction holding, or parked in, the log.
#[derive(Debug)]
pub struct ActiveTx {
    pub kind: TxKind,
    pub target: u64,
    /// Open `start` calls. Zero means a deferred transaction waiting for
    /// its commit.
    pub depth: u32,
    pub flags: TxFlags,
    pub undo_records: u32,
    pub window: Option<PreAlloc>,
}

impl ActiveTx {
    pub fn new(kind: TxKind, target: u64) -> Self {
        Self {
            kind,
            target,
            depth: 1,
            flags: TxFlags::empty(),
            undo_records: 0,
            window: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.depth == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JournalStats {
    pub records: u64,
    pub flushes: u64,
    pub commits: u64,
    pub aborts: u64,
}

pub struct Journal {
    device: Arc<dyn BlockDevice>,
    base: u64,
    slots: u32,
    next_seq: u64,
    pool: PoolState,
    segments: SegmentList,
    tx: Option<ActiveTx>,
    stats: JournalStats,
}

impl Journal {
    pub fn new(device: Arc<dyn BlockDevice>, layout: &VolumeLayout) -> Self {
        Self {
            device,
            base: layout.log_base(),
            slots: layout.log_slots,
            next_seq: 0,
            pool: PoolState::default(),
            segments: SegmentList::new(),
            tx: None,
            stats: JournalStats::default(),
        }
    }

    pub fn slots(&self) -> u32 {
        self.slots
    }

    /// Sequence number the next record will get.
    pub fn next_sequence(&self) -> u64 {
        self.next_seq
    }

    /// Undo-type records one transaction may hold in the ring.
    pub fn undo_limit(&self) -> u32 {
        self.slots / 2
    }

    pub fn pool(&self) -> PoolState {
        self.pool
    }

    pub(crate) fn set_pool(&mut self, pool: PoolState) {
        self.pool = pool;
    }

    pub fn segments(&self) -> &SegmentList {
        &self.segments
    }

    pub(crate) fn segments_mut(&mut self) -> &mut SegmentList {
        &mut self.segments
    }

    pub fn stats(&self) -> JournalStats {
        self.stats
    }

    pub fn tx(&self) -> Option<&ActiveTx> {
        self.tx.as_ref()
    }

    pub(crate) fn tx_mut(&mut self) -> Option<&mut ActiveTx> {
        self.tx.as_mut()
    }

    pub(crate) fn open_tx(&mut self, tx: ActiveTx) {
        self.tx = Some(tx);
    }

    pub(crate) fn take_tx(&mut self) -> Option<ActiveTx> {
        self.tx.take()
    }

    fn slot_pos(&self, slot: u32) -> u64 {
        self.base + slot as u64 * RECORD_SIZE as u64
    }

    /// Zero-fills the ring.
    pub fn format(&mut self) -> FatResult<()> {
        let blank = [0u8; RECORD_SIZE];
        for slot in 0..self.slots {
            write_all_at(&*self.device, self.slot_pos(slot), &blank)?;
        }
        self.device.flush()?;
        self.stats.flushes += 1;
        self.next_seq = 0;
        self.pool = PoolState::default();
        self.segments.clear();
        self.tx = None;
        Ok(())
    }

    pub fn read_slot(&self, slot: u32) -> FatResult<[u8; RECORD_SIZE]> {
        if slot >= self.slots {
            return Err(FatError::InvalidParam);
        }
        let mut raw = [0u8; RECORD_SIZE];
        read_exact_at(&*self.device, self.slot_pos(slot), &mut raw)?;
        Ok(raw)
    }

    /// Writes one slot and flushes the device.
    pub fn write_slot(&mut self, slot: u32, raw: &[u8; RECORD_SIZE]) -> FatResult<()> {
        if slot >= self.slots {
            return Err(FatError::InvalidParam);
        }
        write_all_at(&*self.device, self.slot_pos(slot), raw)?;
        self.device.flush()?;
        self.stats.flushes += 1;
        Ok(())
    }

    /// Reads every slot once and returns the valid record with the highest
    /// sequence number. Positions the ring after it and takes the pool
    /// state from its header.
    pub fn scan(&mut self) -> FatResult<Option<LogRecord>> {
        let mut latest: Option<LogRecord> = None;
        for slot in 0..self.slots {
            let raw = self.read_slot(slot)?;
            if raw.iter().all(|&b| b == 0) {
                continue;
            }
            match LogRecord::decode(&raw) {
                Ok(record) if record.sequence() % self.slots as u64 == slot as u64 => {
                    if latest.as_ref().map_or(true, |l| record.sequence() > l.sequence()) {
                        latest = Some(record);
                    }
                }
                Ok(record) => warn!(
                    "journal: record {} found in slot {}, skipped",
                    record.sequence(),
                    slot
                ),
                Err(_) => warn!("journal: damaged record in slot {}, skipped", slot),
            }
        }
        match &latest {
            Some(record) => {
                self.next_seq = record.sequence() + 1;
                self.pool = record.header.pool;
            }
            None => {
                self.next_seq = 0;
                self.pool = PoolState::default();
            }
        }
        Ok(latest)
    }

    /// Reads back record `seq`. Anything else in its slot is `Corrupt`.
    pub fn read_record(&self, seq: u64) -> FatResult<LogRecord> {
        let slot = (seq % self.slots as u64) as u32;
        let record = LogRecord::decode(&self.read_slot(slot)?)?;
        if record.sequence() != seq {
            warn!("journal: slot {} holds {} instead of {}", slot, record.sequence(), seq);
            return Err(FatError::Corrupt);
        }
        Ok(record)
    }

    /// Writes `body` as the next record, stamped with the current
    /// transaction and pool state.
    pub(crate) fn append(&mut self, body: RecordBody) -> FatResult<u64> {
        let (tx_kind, target) = self
            .tx
            .as_ref()
            .map_or((TxKind::Recovery, 0), |tx| (tx.kind, tx.target));
        let seq = self.next_seq;
        let record = LogRecord {
            header: RecordHeader {
                tx_kind,
                sequence: seq,
                target,
                pool: self.pool,
            },
            body,
        };
        let raw = record.encode()?;
        self.write_slot((seq % self.slots as u64) as u32, &raw)?;
        self.next_seq += 1;
        self.stats.records += 1;
        debug!("journal: record {} {:?}", seq, record.body);
        Ok(seq)
    }

    /// Logs a record of the open transaction, writing its `Start` first if
    /// needed. Undo-type records are refused once the transaction is in its
    /// redo phase or has used up its share of the ring.
    pub(crate) fn log(&mut self, body: RecordBody) -> FatResult<u64> {
        let limit = self.undo_limit();
        let redo = body.is_redo();
        let tx = self.tx.as_ref().ok_or(FatError::InvalidParam)?;
        if tx.is_pending() || body.is_boundary() {
            return Err(FatError::InvalidParam);
        }
        if !redo {
            if tx.flags.contains(TxFlags::REDO_PHASE) {
                warn!("journal: undo record after dealloc in {:?}", tx.kind);
                return Err(FatError::InvalidParam);
            }
            if tx.undo_records >= limit {
                return Err(FatError::NoSpace);
            }
        }
        if !tx.flags.contains(TxFlags::STARTED) {
            self.append(RecordBody::Start)?;
            self.mark(TxFlags::STARTED);
        }
        let seq = self.append(body)?;
        if let Some(tx) = self.tx.as_mut() {
            tx.flags.insert(TxFlags::DIRTY);
            if redo {
                tx.flags.insert(TxFlags::REDO_PHASE);
            } else {
                tx.undo_records += 1;
            }
        }
        Ok(seq)
    }

    /// Makes sure the open transaction has its `Start` on disk.
    pub(crate) fn ensure_started(&mut self) -> FatResult<()> {
        let tx = self.tx.as_ref().ok_or(FatError::InvalidParam)?;
        if !tx.flags.contains(TxFlags::STARTED) {
            self.append(RecordBody::Start)?;
            self.mark(TxFlags::STARTED);
        }
        Ok(())
    }

    pub(crate) fn mark(&mut self, flags: TxFlags) {
        if let Some(tx) = self.tx.as_mut() {
            tx.flags.insert(flags);
        }
    }

    pub(crate) fn unmark(&mut self, flags: TxFlags) {
        if let Some(tx) = self.tx.as_mut() {
            tx.flags.remove(flags);
        }
    }

    pub(crate) fn write_commit(&mut self) -> FatResult<u64> {
        let seq = self.append(RecordBody::Commit)?;
        self.stats.commits += 1;
        Ok(seq)
    }

    pub(crate) fn write_abort(&mut self) -> FatResult<u64> {
        let seq = self.append(RecordBody::Abort)?;
        self.stats.aborts += 1;
        Ok(seq)
    }
}

/// Caller identity for the log lock. 0 means nobody.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct OwnerId(pub u64);

/// Mutual exclusion over the journal with a recorded owner and a bounded
/// wait.
pub struct LogLock<T> {
    owner: AtomicU64,
    spin_limit: u64,
    inner: Mutex<T>,
}

impl<T> LogLock<T> {
    pub fn new(value: T, spin_limit: u64) -> Self {
        Self {
            owner: AtomicU64::new(0),
            spin_limit: spin_limit.max(1),
            inner: Mutex::new(value),
        }
    }

    pub fn owner(&self) -> Option<OwnerId> {
        match self.owner.load(Ordering::Acquire) {
            0 => None,
            id => Some(OwnerId(id)),
        }
    }

    /// Takes the lock for `owner`. Re-entry by the holder goes through the
    /// transaction handle, so asking again here is `InvalidParam`. Another
    /// owner waits up to the spin limit and then gets `Busy`.
    pub fn lock(&self, owner: OwnerId) -> FatResult<LogGuard<'_, T>> {
        if owner.0 == 0 || self.owner.load(Ordering::Acquire) == owner.0 {
            return Err(FatError::InvalidParam);
        }
        let mut spins = 0u64;
        loop {
            if let Some(guard) = self.inner.try_lock() {
                self.owner.store(owner.0, Ordering::Release);
                return Ok(LogGuard {
                    owner: &self.owner,
                    guard,
                });
            }
            spins += 1;
            if spins >= self.spin_limit {
                warn!("log lock: owner {} gave up after {} spins", owner.0, spins);
                return Err(FatError::Busy);
            }
            core::hint::spin_loop();
        }
    }

    /// Reads the protected value without taking ownership of the lock.
    pub fn inspect<R>(&self, f: impl FnOnce(&T) -> R) -> FatResult<R> {
        for _ in 0..self.spin_limit {
            if let Some(guard) = self.inner.try_lock() {
                return Ok(f(&guard));
            }
            core::hint::spin_loop();
        }
        Err(FatError::Busy)
    }
}

pub struct LogGuard<'a, T> {
    owner: &'a AtomicU64,
    guard: MutexGuard<'a, T>,
}

impl<T> Deref for LogGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for LogGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for LogGuard<'_, T> {
    fn drop(&mut self) {
        self.owner.store(0, Ordering::Release);
    }
}
