//! Mount-time replay, also used to roll back aborted transactions.
//!
//! The walk starts at the newest record and goes backwards by sequence
//! number. Undo-type records are reverted one by one until a `Start`,
//! `Commit` or `Abort` shows the state before them was consistent. A
//! dealloc record is never undone: its chain was already detached, so the
//! deallocation is completed instead and the walk stops there.

use log::{error, info};

use crate::{
    error::{FatError, FatResult},
    journal::{ActiveTx, TxFlags},
    record::{Dealloc, RecordBody, RecordHeader, TxKind},
    txn::{Resume, TxContext},
};

/// What mount-time recovery did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Sequence number of the newest valid record found.
    pub latest: Option<u64>,
    pub undone: u32,
    pub redone: u32,
    /// Clusters freed by draining the pool chain.
    pub pool_freed: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Replayed {
    pub undone: u32,
    pub redone: u32,
}

/// Walks back from record `from` and reverts or completes what it finds.
/// Every step is synced before the next, so running it again after a crash
/// gives the same result.
pub(crate) fn replay(ctx: &mut TxContext<'_>, from: u64) -> FatResult<Replayed> {
    let mut out = Replayed::default();
    let mut seq = from;
    loop {
        let record = ctx.journal.read_record(seq).map_err(|e| {
            error!("recovery: record {} unreadable while undoing: {}", seq, e);
            FatError::Corrupt
        })?;
        let header = record.header;
        match record.body {
            RecordBody::Start | RecordBody::Commit | RecordBody::Abort => {
                ctx.journal.set_pool(header.pool);
                break;
            }
            RecordBody::Dealloc(dealloc) => {
                redo_dealloc(ctx, dealloc)?;
                out.redone += 1;
                break;
            }
            RecordBody::MultiRecordCommit { .. } => {
                ctx.journal.set_pool(header.pool);
                out.redone += 1;
                break;
            }
            body => {
                undo(ctx, &header, body)?;
                out.undone += 1;
            }
        }
        ctx.fat.table.sync(true)?;
        ctx.entries.flush()?;
        seq = seq.checked_sub(1).ok_or_else(|| {
            error!("recovery: ran off the start of the log");
            FatError::Corrupt
        })?;
    }
    ctx.fat.table.sync(true)?;
    ctx.entries.flush()?;
    Ok(out)
}

fn undo(ctx: &mut TxContext<'_>, header: &RecordHeader, body: RecordBody) -> FatResult<()> {
    match body {
        RecordBody::AllocChain(alloc) => {
            for &cluster in &alloc.clusters {
                ctx.fat.alloc.unlink(&mut ctx.fat.table, &ctx.token, cluster)?;
            }
            match alloc.prev_tail {
                Some(tail) => ctx.fat.alloc.set_tail(&mut ctx.fat.table, &ctx.token, tail)?,
                None => ctx.entries.set_start_cluster(alloc.entry, None)?,
            }
        }
        RecordBody::MoveChain(moved) => {
            if let Some(tail) = header.pool.tail {
                ctx.fat.alloc.set_tail(&mut ctx.fat.table, &ctx.token, tail)?;
            }
            ctx.journal.segments_mut().splice_free(moved.last);
        }
        RecordBody::BuildEntry(markers) | RecordBody::RemoveEntry(markers) => {
            for (index, marker) in markers.slots {
                ctx.entries
                    .set_marker(crate::dirent::EntryRef::new(markers.parent, index), marker)?;
            }
        }
        RecordBody::XattrSet(xattr) => {
            ctx.entries
                .write_xattr(xattr.cluster, xattr.offset, &xattr.old_bytes)?;
            ctx.entries.set_xattr_header(xattr.cluster, &xattr.old_header)?;
        }
        _ => return Err(FatError::InvalidParam),
    }
    ctx.journal.set_pool(header.pool);
    Ok(())
}

/// Completes an interrupted deallocation from its newest record.
fn redo_dealloc(ctx: &mut TxContext<'_>, dealloc: Dealloc) -> FatResult<()> {
    ctx.fat
        .alloc
        .free_chunks(&mut ctx.fat.table, &ctx.token, &dealloc.chunks)?;
    ctx.apply_origin(dealloc.origin)?;
    ctx.journal.set_pool(dealloc.pool_after);
    ctx.fat.table.sync(true)?;
    ctx.entries.flush()?;
    let resume = Resume {
        first_seq: dealloc.first_seq,
        index: dealloc.index + 1,
    };
    match dealloc.next {
        Some(next) => {
            ctx.deallocate(next, dealloc.last, dealloc.origin, dealloc.pool_after, Some(resume))?;
        }
        None if dealloc.index > 0 => {
            ctx.journal.mark(TxFlags::NEED_MRC);
            ctx.finish_multi_record(resume.first_seq, resume.index)?;
        }
        None => {}
    }
    Ok(())
}

/// Brings the volume back to its last consistent state, then frees every
/// chain still parked in the pool.
pub(crate) fn recover(ctx: &mut TxContext<'_>) -> FatResult<RecoveryReport> {
    let mut report = RecoveryReport::default();
    let Some(latest) = ctx.journal.scan()? else {
        info!("recovery: log is empty");
        return Ok(report);
    };
    report.latest = Some(latest.sequence());

    if !latest.body.is_boundary() {
        info!(
            "recovery: log ends in {:?} record {}, replaying",
            latest.header.tx_kind,
            latest.sequence()
        );
        let mut tx = ActiveTx::new(TxKind::Recovery, 0);
        // the interrupted transaction's Start is already on disk
        tx.flags = TxFlags::STARTED | TxFlags::DIRTY;
        ctx.journal.open_tx(tx);
        let replayed = replay(ctx, latest.sequence());
        let replayed = match replayed {
            Ok(r) => r,
            Err(e) => {
                ctx.journal.take_tx();
                return Err(e);
            }
        };
        ctx.journal.write_commit()?;
        ctx.journal.take_tx();
        report.undone = replayed.undone;
        report.redone = replayed.redone;
    }

    if ctx.journal.pool().head.is_some() {
        ctx.journal.open_tx(ActiveTx::new(TxKind::Recovery, 0));
        let drained = ctx.drain_pool().and_then(|freed| {
            ctx.commit_records()?;
            Ok(freed)
        });
        ctx.journal.take_tx();
        report.pool_freed = drained?;
    }
    info!(
        "recovery: latest {:?}, undone {}, redone {}, pool freed {}",
        report.latest, report.undone, report.redone, report.pool_freed
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dirent::{EntryRef, EntryStore, RawDirEntry, XattrHeader, DELETED_MARKER},
        journal::Journal,
        testutil::Rig,
        types::FatEntry,
    };

    const FILE: EntryRef = EntryRef::new(2, 5);

    fn crash(rig: &mut Rig) {
        // a fresh journal has no memory of the interrupted transaction
        rig.journal = Journal::new(rig.dev.clone(), &rig.layout);
    }

    #[test]
    fn interrupted_alloc_is_undone() {
        let mut rig = Rig::new();
        rig.entries.put(FILE, RawDirEntry::new(b"DATA    BIN", 0x20));
        rig.open(TxKind::Create, 1);
        let chain = rig.ctx().alloc_chain(FILE, None, 3).unwrap();
        assert_eq!(rig.entries.start_cluster(FILE).unwrap(), Some(chain[0]));
        crash(&mut rig);

        let report = recover(&mut rig.ctx()).unwrap();
        assert_eq!(report.undone, 1);
        for c in chain {
            assert_eq!(rig.fat.table.read_entry(c).unwrap(), FatEntry::Free);
        }
        assert_eq!(rig.entries.start_cluster(FILE).unwrap(), None);
    }

    #[test]
    fn entry_and_xattr_changes_are_reverted() {
        let mut rig = Rig::new();
        rig.entries.put(EntryRef::new(2, 7), RawDirEntry::new(b"OLD     TXT", 0x20));
        rig.entries.set_xattr_header(40, &XattrHeader {
            entry_count: 1,
            used_bytes: 8,
            free_offset: 40,
        })
        .unwrap();
        rig.entries.write_xattr(40, 32, b"user.a=1").unwrap();

        rig.open(TxKind::SetXattr, 1);
        let mut ctx = rig.ctx();
        ctx.build_entry(2, &[(3, RawDirEntry::new(b"NEW     TXT", 0x20))]).unwrap();
        ctx.remove_entry(2, &[7]).unwrap();
        ctx.set_xattr(FILE, 40, 32, b"user.a=2", XattrHeader::default()).unwrap();
        assert_eq!(rig.entries.marker(EntryRef::new(2, 7)).unwrap(), DELETED_MARKER);
        crash(&mut rig);

        let report = recover(&mut rig.ctx()).unwrap();
        assert_eq!(report.undone, 3);
        assert!(!rig.entries.read_entry(EntryRef::new(2, 3)).unwrap().is_live());
        assert_eq!(rig.entries.marker(EntryRef::new(2, 7)).unwrap(), b'O');
        let mut buf = [0u8; 8];
        rig.entries.read_xattr(40, 32, &mut buf).unwrap();
        assert_eq!(&buf, b"user.a=1");
        assert_eq!(rig.entries.xattr_header(40).unwrap().entry_count, 1);
    }

    #[test]
    fn rollback_reverts_and_writes_abort() {
        let mut rig = Rig::new();
        rig.entries.put(FILE, RawDirEntry::new(b"DATA    BIN", 0x20));
        rig.open(TxKind::Create, 1);
        let mut ctx = rig.ctx();
        let chain = ctx.alloc_chain(FILE, None, 2).unwrap();
        ctx.rollback().unwrap();
        assert_eq!(rig.fat.table.read_entry(chain[0]).unwrap(), FatEntry::Free);
        assert_eq!(rig.journal.stats().aborts, 1);
        let latest = rig.journal.read_record(rig.journal.next_sequence() - 1).unwrap();
        assert_eq!(latest.body, RecordBody::Abort);
    }

    #[test]
    fn clean_log_is_left_alone() {
        let mut rig = Rig::new();
        rig.entries.put(FILE, RawDirEntry::new(b"DATA    BIN", 0x20));
        rig.open(TxKind::Create, 1);
        rig.ctx().alloc_chain(FILE, None, 1).unwrap();
        rig.ctx().commit_records().unwrap();
        rig.journal.take_tx();
        let records = rig.journal.stats().records;
        crash(&mut rig);
        let report = recover(&mut rig.ctx()).unwrap();
        assert_eq!(report.undone + report.redone, 0);
        assert_eq!(rig.journal.stats().records, 0);
        assert!(records > 0);
    }
}
