//! Logged metadata operations.
//!
//! A [`TxContext`] borrows the journal, the FAT state and the entry store
//! for the length of one operation. Each operation logs its record before
//! touching the table; recovery and rollback drive the same context, so a
//! half-finished deallocation is always completed by the code that started
//! it.

use alloc::{collections::VecDeque, vec::Vec};

use log::{debug, error, warn};

use crate::{
    allocator::ClusterAllocator,
    dirent::{EntryRef, EntryStore, RawDirEntry, XattrHeader, DELETED_MARKER},
    error::{FatError, FatResult},
    journal::{Journal, PreAlloc, TxFlags, TxToken},
    record::{
        AllocChain, Dealloc, DeallocOrigin, EntryMarkers, MoveChain, PoolState, RecordBody,
        XattrSet, MAX_ALLOC_CLUSTERS, MAX_DEALLOC_CHUNKS, MAX_ENTRY_SLOTS, MAX_XATTR_UNDO,
    },
    recovery,
    segment::Splice,
    table::FatTable,
    types::{Cluster, FatEntry},
};

/// Everything guarded by the FAT lock.
pub(crate) struct FatState {
    pub table: FatTable,
    pub alloc: ClusterAllocator,
}

/// Where an interrupted deallocation picks up again.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Resume {
    pub first_seq: u64,
    pub index: u32,
}

pub(crate) struct TxContext<'a> {
    pub journal: &'a mut Journal,
    pub fat: &'a mut FatState,
    pub entries: &'a dyn EntryStore,
    pub pre_alloc_max: u32,
    pub token: TxToken,
}

impl<'a> TxContext<'a> {
    pub fn new(
        journal: &'a mut Journal,
        fat: &'a mut FatState,
        entries: &'a dyn EntryStore,
        pre_alloc_max: u32,
    ) -> Self {
        Self {
            journal,
            fat,
            entries,
            pre_alloc_max,
            token: TxToken::new(),
        }
    }

    fn is_deferred(&self) -> bool {
        self.journal.tx().map_or(false, |tx| tx.kind.is_deferred())
    }

    /// Logs an undo-type record. A deferred transaction that has filled its
    /// share of the ring commits what it has and carries on in a fresh one.
    fn log_undo(&mut self, body: RecordBody) -> FatResult<u64> {
        let full = self
            .journal
            .tx()
            .map_or(false, |tx| tx.undo_records >= self.journal.undo_limit());
        if full && self.is_deferred() {
            warn!("journal: deferred transaction reached the undo cap, checkpointing");
            self.checkpoint()?;
        }
        self.journal.log(body)
    }

    /// Commits the open transaction in place, keeping its kind, target and
    /// depth.
    pub fn checkpoint(&mut self) -> FatResult<()> {
        self.commit_records()?;
        if let Some(tx) = self.journal.tx_mut() {
            tx.flags = TxFlags::empty();
            tx.undo_records = 0;
        }
        Ok(())
    }

    /// Flushes metadata and writes the commit record if anything was
    /// logged. Unused reservations go back to the allocator.
    pub fn commit_records(&mut self) -> FatResult<()> {
        self.release_window();
        let Some(tx) = self.journal.tx() else {
            return Ok(());
        };
        if !tx.flags.contains(TxFlags::STARTED) {
            return Ok(());
        }
        let (kind, target) = (tx.kind, tx.target);
        self.fat.table.sync(false)?;
        if kind.commits_entries() {
            self.entries.flush()?;
        }
        let seq = self.journal.write_commit()?;
        debug!("journal: commit {:?} on {} at {}", kind, target, seq);
        Ok(())
    }

    /// Undoes everything the open transaction logged and writes `Abort`.
    pub fn rollback(&mut self) -> FatResult<()> {
        let Some(tx) = self.journal.tx() else {
            return Ok(());
        };
        let started = tx.flags.contains(TxFlags::STARTED);
        let kind = tx.kind;
        if started {
            let latest = self.journal.next_sequence().saturating_sub(1);
            recovery::replay(self, latest)?;
        }
        self.release_window();
        if started {
            self.fat.table.sync(true)?;
            self.entries.flush()?;
            self.journal.write_abort()?;
            debug!("journal: abort {:?}", kind);
        }
        Ok(())
    }

    pub fn release_window(&mut self) {
        let window = self.journal.tx_mut().and_then(|tx| tx.window.take());
        if let Some(window) = window {
            let unused: Vec<Cluster> = window.clusters.into_iter().collect();
            self.fat.alloc.release(&unused);
        }
    }

    /// Allocates `n` clusters, links them after `prev_tail` and, for an
    /// empty file, points the entry at the first one. All or nothing.
    pub fn alloc_chain(
        &mut self,
        entry: EntryRef,
        prev_tail: Option<Cluster>,
        n: u32,
    ) -> FatResult<Vec<Cluster>> {
        if n == 0 {
            return Err(FatError::InvalidParam);
        }
        if self.fat.alloc.free_clusters() < n {
            return Err(FatError::NoSpace);
        }
        let mut out = Vec::with_capacity(n as usize);
        let mut last = prev_tail;
        while out.len() < n as usize {
            let want = (n as usize - out.len()).min(MAX_ALLOC_CLUSTERS) as u32;
            let clusters = self.fat.alloc.find_free(&mut self.fat.table, want)?;
            if clusters.len() < want as usize {
                return Err(FatError::NoSpace);
            }
            self.log_undo(RecordBody::AllocChain(AllocChain {
                entry,
                prev_tail: last,
                clusters: clusters.clone(),
            }))?;
            for &cluster in &clusters {
                self.fat
                    .alloc
                    .link(&mut self.fat.table, &self.token, last, cluster)?;
                if last.is_none() {
                    self.entries.set_start_cluster(entry, Some(cluster))?;
                }
                last = Some(cluster);
            }
            out.extend(clusters);
        }
        Ok(out)
    }

    /// Adds one cluster after `last`. Deferred transactions take it from
    /// their pre-allocation window, logging only when a new window is cut.
    pub fn append_cluster(&mut self, entry: EntryRef, last: Option<Cluster>) -> FatResult<Cluster> {
        if !self.is_deferred() {
            let clusters = self.alloc_chain(entry, last, 1)?;
            return clusters.first().copied().ok_or(FatError::NoSpace);
        }
        let usable = self
            .journal
            .tx()
            .and_then(|tx| tx.window.as_ref())
            .map_or(false, |w| w.entry == entry && w.last == last && !w.clusters.is_empty());
        if !usable {
            self.release_window();
            self.cut_window(entry, last)?;
        }
        let cluster = self
            .journal
            .tx_mut()
            .and_then(|tx| tx.window.as_mut())
            .and_then(|w| {
                let c = w.clusters.pop_front()?;
                w.last = Some(c);
                Some(c)
            })
            .ok_or(FatError::NoSpace)?;
        self.fat
            .alloc
            .link(&mut self.fat.table, &self.token, last, cluster)?;
        if last.is_none() {
            self.entries.set_start_cluster(entry, Some(cluster))?;
        }
        Ok(cluster)
    }

    fn cut_window(&mut self, entry: EntryRef, last: Option<Cluster>) -> FatResult<()> {
        let want = self
            .pre_alloc_max
            .clamp(1, MAX_ALLOC_CLUSTERS as u32);
        let clusters = self.fat.alloc.find_free(&mut self.fat.table, want)?;
        self.log_undo(RecordBody::AllocChain(AllocChain {
            entry,
            prev_tail: last,
            clusters: clusters.clone(),
        }))?;
        self.fat.alloc.reserve(&clusters);
        debug!("journal: pre-allocated {} clusters after {:?}", clusters.len(), last);
        if let Some(tx) = self.journal.tx_mut() {
            tx.window = Some(PreAlloc {
                entry,
                last,
                clusters: VecDeque::from(clusters),
            });
        }
        Ok(())
    }

    /// Writes new directory slots, saving the markers they replace.
    pub fn build_entry(&mut self, parent: Cluster, slots: &[(u32, RawDirEntry)]) -> FatResult<()> {
        if slots.is_empty() || slots.len() > MAX_ENTRY_SLOTS {
            return Err(FatError::InvalidParam);
        }
        let mut markers = Vec::with_capacity(slots.len());
        for &(index, _) in slots {
            markers.push((index, self.entries.marker(EntryRef::new(parent, index))?));
        }
        self.log_undo(RecordBody::BuildEntry(EntryMarkers {
            parent,
            slots: markers,
        }))?;
        for (index, raw) in slots {
            self.entries.write_entry(EntryRef::new(parent, *index), raw)?;
        }
        Ok(())
    }

    /// Marks directory slots deleted.
    pub fn remove_entry(&mut self, parent: Cluster, indices: &[u32]) -> FatResult<()> {
        if indices.is_empty() || indices.len() > MAX_ENTRY_SLOTS {
            return Err(FatError::InvalidParam);
        }
        let mut markers = Vec::with_capacity(indices.len());
        for &index in indices {
            markers.push((index, self.entries.marker(EntryRef::new(parent, index))?));
        }
        self.log_undo(RecordBody::RemoveEntry(EntryMarkers {
            parent,
            slots: markers,
        }))?;
        for &index in indices {
            self.entries
                .set_marker(EntryRef::new(parent, index), DELETED_MARKER)?;
        }
        Ok(())
    }

    /// Overwrites attribute bytes and the xattr header, saving both.
    pub fn set_xattr(
        &mut self,
        entry: EntryRef,
        cluster: Cluster,
        offset: u32,
        data: &[u8],
        header: XattrHeader,
    ) -> FatResult<()> {
        if data.len() > MAX_XATTR_UNDO {
            return Err(FatError::InvalidParam);
        }
        let mut old_bytes = alloc::vec![0u8; data.len()];
        self.entries.read_xattr(cluster, offset, &mut old_bytes)?;
        let old_header = self.entries.xattr_header(cluster)?;
        self.log_undo(RecordBody::XattrSet(XattrSet {
            entry,
            cluster,
            offset,
            old_header,
            old_bytes,
        }))?;
        self.entries.write_xattr(cluster, offset, data)?;
        self.entries.set_xattr_header(cluster, &header)
    }

    /// Parks the chain of a file that was unlinked while still open at the
    /// end of the pool.
    pub fn move_to_pool(&mut self, entry: EntryRef, start: Cluster) -> FatResult<()> {
        if self.journal.segments().lookup(start).is_some() {
            return Err(FatError::InvalidParam);
        }
        let (last, _) = self.fat.table.chain_end(start)?;
        self.log_undo(RecordBody::MoveChain(MoveChain { entry, start, last }))?;
        let pool = self.journal.pool();
        if let Some(tail) = pool.tail {
            self.fat
                .alloc
                .set_next(&mut self.fat.table, &self.token, tail, start)?;
        }
        self.journal.segments_mut().add(start, last);
        self.journal.set_pool(PoolState {
            head: pool.head.or(Some(start)),
            tail: Some(last),
        });
        debug!("journal: chain {}..{} moved to pool", start, last);
        Ok(())
    }

    /// Frees the pooled chain that starts at `start`.
    pub fn release_segment(&mut self, start: Cluster) -> FatResult<u32> {
        let segment = *self
            .journal
            .segments()
            .lookup(start)
            .ok_or(FatError::InvalidParam)?;
        let splice = self
            .journal
            .segments()
            .plan_splice(segment.last)
            .ok_or(FatError::InvalidParam)?;
        let pool = self.journal.pool();
        let (origin, pool_after) = match splice {
            Splice::Only { .. } => (
                DeallocOrigin::Pool {
                    prev_last: None,
                    next_start: None,
                },
                PoolState::default(),
            ),
            Splice::First { new_head, .. } => (
                DeallocOrigin::Pool {
                    prev_last: None,
                    next_start: Some(new_head),
                },
                PoolState {
                    head: Some(new_head),
                    tail: pool.tail,
                },
            ),
            Splice::Middle {
                prev_last,
                next_start,
                ..
            } => (
                DeallocOrigin::Pool {
                    prev_last: Some(prev_last),
                    next_start: Some(next_start),
                },
                pool,
            ),
            Splice::Last { prev_last, .. } => (
                DeallocOrigin::Pool {
                    prev_last: Some(prev_last),
                    next_start: None,
                },
                PoolState {
                    head: pool.head,
                    tail: Some(prev_last),
                },
            ),
        };
        let freed = self.deallocate(segment.start, segment.last, origin, pool_after, None)?;
        self.journal.segments_mut().splice_free(segment.last);
        Ok(freed)
    }

    /// Frees a chain nothing refers to any more.
    pub fn free_chain(&mut self, start: Cluster) -> FatResult<u32> {
        let (last, _) = self.fat.table.chain_end(start)?;
        let pool = self.journal.pool();
        self.deallocate(start, last, DeallocOrigin::Orphan, pool, None)
    }

    /// Cuts a file's chain down to `keep` clusters.
    pub fn truncate(&mut self, entry: EntryRef, start: Option<Cluster>, keep: u32) -> FatResult<u32> {
        let Some(start) = start else {
            return Ok(0);
        };
        let (from, new_last) = if keep == 0 {
            (start, None)
        } else {
            let new_last = match ClusterAllocator::walk(&mut self.fat.table, start, keep - 1) {
                Ok((_, cluster)) => cluster,
                // already no longer than requested
                Err(FatError::ChainTooShort) => return Ok(0),
                Err(e) => return Err(e),
            };
            match self.fat.table.read_entry(new_last)? {
                FatEntry::Tail => return Ok(0),
                FatEntry::Next(next) => (next, Some(new_last)),
                other => {
                    error!("truncate: cluster {} holds {:?}", new_last, other);
                    return Err(FatError::Corrupt);
                }
            }
        };
        let (last, _) = self.fat.table.chain_end(from)?;
        let pool = self.journal.pool();
        self.deallocate(from, last, DeallocOrigin::Truncate { entry, new_last }, pool, None)
    }

    /// Frees the whole pool chain. Used at mount, when no unlinked file can
    /// still be open.
    pub fn drain_pool(&mut self) -> FatResult<u32> {
        let pool = self.journal.pool();
        let (Some(head), Some(tail)) = (pool.head, pool.tail) else {
            return Ok(0);
        };
        let freed = self.deallocate(head, tail, DeallocOrigin::PoolReset, PoolState::default(), None)?;
        self.journal.segments_mut().clear();
        Ok(freed)
    }

    /// The logged dealloc loop: one record per batch of chunks, each batch
    /// freed and synced before the next record is written. The origin's
    /// detach step runs right after the first record. A deallocation that
    /// took more than one record ends with a multi-record commit.
    pub(crate) fn deallocate(
        &mut self,
        mut from: Cluster,
        last: Cluster,
        origin: DeallocOrigin,
        pool_after: PoolState,
        resume: Option<Resume>,
    ) -> FatResult<u32> {
        self.journal.ensure_started()?;
        let (first_seq, mut index) = match resume {
            Some(r) => (r.first_seq, r.index),
            None => (self.journal.next_sequence(), 0),
        };
        let mut freed = 0;
        loop {
            let batch = ClusterAllocator::build_chunks(&mut self.fat.table, from, last, MAX_DEALLOC_CHUNKS)?;
            self.journal.log(RecordBody::Dealloc(Dealloc {
                first_seq,
                index,
                last,
                next: batch.next,
                origin,
                pool_after,
                chunks: batch.chunks.clone(),
            }))?;
            if index == 0 {
                self.apply_origin(origin)?;
                self.journal.set_pool(pool_after);
            } else {
                self.journal.mark(TxFlags::NEED_MRC);
            }
            freed += self
                .fat
                .alloc
                .free_chunks(&mut self.fat.table, &self.token, &batch.chunks)?;
            self.fat.table.sync(true)?;
            index += 1;
            match batch.next {
                Some(next) => from = next,
                None => break,
            }
        }
        self.finish_multi_record(first_seq, index)?;
        debug!("journal: freed {} clusters ending at {}", freed, last);
        Ok(freed)
    }

    /// Writes the multi-record commit a deallocation still owes.
    pub(crate) fn finish_multi_record(&mut self, first_seq: u64, records: u32) -> FatResult<()> {
        let owed = self
            .journal
            .tx()
            .map_or(false, |tx| tx.flags.contains(TxFlags::NEED_MRC));
        if owed {
            self.journal
                .log(RecordBody::MultiRecordCommit { first_seq, records })?;
            self.journal.unmark(TxFlags::NEED_MRC);
        }
        Ok(())
    }

    /// Detaches the clusters a deallocation is about to free from whatever
    /// pointed at them. Safe to repeat.
    pub(crate) fn apply_origin(&mut self, origin: DeallocOrigin) -> FatResult<()> {
        match origin {
            DeallocOrigin::Orphan | DeallocOrigin::PoolReset => Ok(()),
            DeallocOrigin::Truncate {
                new_last: Some(new_last),
                ..
            } => self
                .fat
                .alloc
                .set_tail(&mut self.fat.table, &self.token, new_last),
            DeallocOrigin::Truncate {
                entry,
                new_last: None,
            } => self.entries.set_start_cluster(entry, None),
            DeallocOrigin::Pool {
                prev_last: Some(prev_last),
                next_start: Some(next_start),
            } => self
                .fat
                .alloc
                .set_next(&mut self.fat.table, &self.token, prev_last, next_start),
            DeallocOrigin::Pool {
                prev_last: Some(prev_last),
                next_start: None,
            } => self
                .fat
                .alloc
                .set_tail(&mut self.fat.table, &self.token, prev_last),
            DeallocOrigin::Pool { prev_last: None, .. } => Ok(()),
        }
    }
}
