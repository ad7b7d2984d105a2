//! Log record types and their fixed 512-byte wire format.
//!
//! ```text
//!   0  kind       u32
//!   4  tx kind    u32
//!   8  sequence   u64
//!  16  target     u64
//!  24  pool head  u32   (0 = empty pool)
//!  28  pool tail  u32
//!  32  payload    476 bytes, layout depends on kind
//! 508  signature  u32   CRC32 of bytes 0..508
//! ```
//!
//! All integers are little endian. Optional clusters are stored as 0, which
//! is never a valid cluster index.

use alloc::vec::Vec;

use crate::{
    dirent::{EntryRef, XattrHeader},
    error::{FatError, FatResult},
    types::{Chunk, Cluster},
};

pub const RECORD_SIZE: usize = 512;
const HEADER_SIZE: usize = 32;
const SIGNATURE_AT: usize = RECORD_SIZE - 4;
pub const PAYLOAD_SIZE: usize = SIGNATURE_AT - HEADER_SIZE;

/// Clusters one `AllocChain` record can carry.
pub const MAX_ALLOC_CLUSTERS: usize = 112;
/// Directory slots one entry record can carry.
pub const MAX_ENTRY_SLOTS: usize = 64;
/// Chunks one `Dealloc` record can carry.
pub const MAX_DEALLOC_CHUNKS: usize = 48;
/// Old xattr bytes one `XattrSet` record can carry.
pub const MAX_XATTR_UNDO: usize = 384;

/// Kind of the logical operation a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TxKind {
    Create = 1,
    Remove = 2,
    Write = 3,
    TruncateForward = 4,
    Truncate = 5,
    Unlink = 6,
    Release = 7,
    SetXattr = 8,
    Recovery = 9,
}

impl TxKind {
    fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            1 => TxKind::Create,
            2 => TxKind::Remove,
            3 => TxKind::Write,
            4 => TxKind::TruncateForward,
            5 => TxKind::Truncate,
            6 => TxKind::Unlink,
            7 => TxKind::Release,
            8 => TxKind::SetXattr,
            9 => TxKind::Recovery,
            _ => return None,
        })
    }

    /// Kinds whose commit is deferred until another transaction needs the
    /// log, and which may pre-allocate clusters.
    pub fn is_deferred(self) -> bool {
        matches!(self, TxKind::Write | TxKind::TruncateForward)
    }

    /// Kinds whose directory entries must reach the disk before commit.
    pub fn commits_entries(self) -> bool {
        !matches!(self, TxKind::Release | TxKind::Recovery)
    }
}

/// Pool chain pointers as stored in every record header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolState {
    pub head: Option<Cluster>,
    pub tail: Option<Cluster>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub tx_kind: TxKind,
    pub sequence: u64,
    pub target: u64,
    /// Pool state when the record was written, before its mutation.
    pub pool: PoolState,
}

/// Clusters reserved or linked onto a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocChain {
    pub entry: EntryRef,
    /// Tail of the chain before the allocation; `None` for an empty file,
    /// in which case the entry's start cluster was set by this record.
    pub prev_tail: Option<Cluster>,
    pub clusters: Vec<Cluster>,
}

/// A file's chain moved into the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveChain {
    pub entry: EntryRef,
    pub start: Cluster,
    pub last: Cluster,
}

/// Directory slots touched by an entry build or remove, with their
/// delete-marker bytes from before the change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMarkers {
    pub parent: Cluster,
    pub slots: Vec<(u32, u8)>,
}

/// Where the clusters of a deallocation came from. Redo re-applies the
/// matching detach step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeallocOrigin {
    /// A chain that no entry or pool refers to any more.
    Orphan,
    /// The tail cut off a file; `new_last` is the file's new last cluster,
    /// `None` when the whole chain went and the start cluster is cleared.
    Truncate {
        entry: EntryRef,
        new_last: Option<Cluster>,
    },
    /// A segment leaving the pool. `prev_last` is relinked to `next_start`,
    /// or becomes the tail when there is no next segment.
    Pool {
        prev_last: Option<Cluster>,
        next_start: Option<Cluster>,
    },
    /// The whole pool chain, freed at mount.
    PoolReset,
}

/// One batch of a possibly multi-record deallocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dealloc {
    /// Sequence number of the first record of this deallocation.
    pub first_seq: u64,
    /// Position of this record within the deallocation, from 0.
    pub index: u32,
    /// Last cluster of the chain being freed.
    pub last: Cluster,
    /// Where the next batch starts, if this is not the final one.
    pub next: Option<Cluster>,
    pub origin: DeallocOrigin,
    /// Pool state once the deallocation is complete.
    pub pool_after: PoolState,
    pub chunks: Vec<Chunk>,
}

/// Pre-write image of an extended attribute update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XattrSet {
    pub entry: EntryRef,
    pub cluster: Cluster,
    pub offset: u32,
    pub old_header: XattrHeader,
    pub old_bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordBody {
    Start,
    Commit,
    Abort,
    AllocChain(AllocChain),
    MoveChain(MoveChain),
    BuildEntry(EntryMarkers),
    RemoveEntry(EntryMarkers),
    Dealloc(Dealloc),
    MultiRecordCommit { first_seq: u64, records: u32 },
    XattrSet(XattrSet),
}

impl RecordBody {
    fn code(&self) -> u32 {
        match self {
            RecordBody::Start => 1,
            RecordBody::Commit => 2,
            RecordBody::Abort => 3,
            RecordBody::AllocChain(_) => 4,
            RecordBody::MoveChain(_) => 5,
            RecordBody::BuildEntry(_) => 6,
            RecordBody::RemoveEntry(_) => 7,
            RecordBody::Dealloc(_) => 8,
            RecordBody::MultiRecordCommit { .. } => 9,
            RecordBody::XattrSet(_) => 10,
        }
    }

    /// Start, commit and abort mark a consistent point.
    pub fn is_boundary(&self) -> bool {
        matches!(self, RecordBody::Start | RecordBody::Commit | RecordBody::Abort)
    }

    /// Records that are replayed forward rather than undone.
    pub fn is_redo(&self) -> bool {
        matches!(
            self,
            RecordBody::Dealloc(_) | RecordBody::MultiRecordCommit { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub header: RecordHeader,
    pub body: RecordBody,
}

impl LogRecord {
    pub fn sequence(&self) -> u64 {
        self.header.sequence
    }

    /// Serialises into one log slot.
    pub fn encode(&self) -> FatResult<[u8; RECORD_SIZE]> {
        let mut slot = [0u8; RECORD_SIZE];
        let mut w = Writer::new(&mut slot[..SIGNATURE_AT]);
        w.u32(self.body.code())?;
        w.u32(self.header.tx_kind as u32)?;
        w.u64(self.header.sequence)?;
        w.u64(self.header.target)?;
        w.pool(self.header.pool)?;
        match &self.body {
            RecordBody::Start | RecordBody::Commit | RecordBody::Abort => {}
            RecordBody::AllocChain(a) => {
                if a.clusters.is_empty() || a.clusters.len() > MAX_ALLOC_CLUSTERS {
                    return Err(FatError::InvalidParam);
                }
                w.entry(a.entry)?;
                w.cluster(a.prev_tail)?;
                w.u16(a.clusters.len() as u16)?;
                for &c in &a.clusters {
                    w.u32(c)?;
                }
            }
            RecordBody::MoveChain(m) => {
                w.entry(m.entry)?;
                w.u32(m.start)?;
                w.u32(m.last)?;
            }
            RecordBody::BuildEntry(e) | RecordBody::RemoveEntry(e) => {
                if e.slots.is_empty() || e.slots.len() > MAX_ENTRY_SLOTS {
                    return Err(FatError::InvalidParam);
                }
                w.u32(e.parent)?;
                w.u16(e.slots.len() as u16)?;
                for &(index, marker) in &e.slots {
                    w.u32(index)?;
                    w.u8(marker)?;
                }
            }
            RecordBody::Dealloc(d) => {
                if d.chunks.is_empty() || d.chunks.len() > MAX_DEALLOC_CHUNKS {
                    return Err(FatError::InvalidParam);
                }
                w.u64(d.first_seq)?;
                w.u32(d.index)?;
                w.u32(d.last)?;
                w.cluster(d.next)?;
                match d.origin {
                    DeallocOrigin::Orphan => w.u8(0)?,
                    DeallocOrigin::Truncate { entry, new_last } => {
                        w.u8(1)?;
                        w.entry(entry)?;
                        w.cluster(new_last)?;
                    }
                    DeallocOrigin::Pool {
                        prev_last,
                        next_start,
                    } => {
                        w.u8(2)?;
                        w.cluster(prev_last)?;
                        w.cluster(next_start)?;
                    }
                    DeallocOrigin::PoolReset => w.u8(3)?,
                }
                w.pool(d.pool_after)?;
                w.u16(d.chunks.len() as u16)?;
                for chunk in &d.chunks {
                    w.u32(chunk.start)?;
                    w.u32(chunk.count)?;
                }
            }
            RecordBody::MultiRecordCommit { first_seq, records } => {
                w.u64(*first_seq)?;
                w.u32(*records)?;
            }
            RecordBody::XattrSet(x) => {
                if x.old_bytes.len() > MAX_XATTR_UNDO {
                    return Err(FatError::InvalidParam);
                }
                w.entry(x.entry)?;
                w.u32(x.cluster)?;
                w.u32(x.offset)?;
                w.u16(x.old_header.entry_count)?;
                w.u32(x.old_header.used_bytes)?;
                w.u32(x.old_header.free_offset)?;
                w.u16(x.old_bytes.len() as u16)?;
                w.bytes(&x.old_bytes)?;
            }
        }
        let signature = crc32(&slot[..SIGNATURE_AT]);
        slot[SIGNATURE_AT..].copy_from_slice(&signature.to_le_bytes());
        Ok(slot)
    }

    /// Parses one log slot. A signature mismatch or an unknown kind is
    /// `Corrupt`.
    pub fn decode(slot: &[u8; RECORD_SIZE]) -> FatResult<Self> {
        let stored = crate::le_u32!(slot, SIGNATURE_AT);
        if crc32(&slot[..SIGNATURE_AT]) != stored {
            return Err(FatError::Corrupt);
        }
        let mut r = Reader::new(&slot[..SIGNATURE_AT]);
        let code = r.u32()?;
        let tx_kind = TxKind::from_u32(r.u32()?).ok_or(FatError::Corrupt)?;
        let header = RecordHeader {
            tx_kind,
            sequence: r.u64()?,
            target: r.u64()?,
            pool: r.pool()?,
        };
        let body = match code {
            1 => RecordBody::Start,
            2 => RecordBody::Commit,
            3 => RecordBody::Abort,
            4 => {
                let entry = r.entry()?;
                let prev_tail = r.cluster()?;
                let n = r.u16()? as usize;
                if n == 0 || n > MAX_ALLOC_CLUSTERS {
                    return Err(FatError::Corrupt);
                }
                let clusters = (0..n).map(|_| r.u32()).collect::<FatResult<Vec<_>>>()?;
                RecordBody::AllocChain(AllocChain {
                    entry,
                    prev_tail,
                    clusters,
                })
            }
            5 => RecordBody::MoveChain(MoveChain {
                entry: r.entry()?,
                start: r.u32()?,
                last: r.u32()?,
            }),
            6 | 7 => {
                let parent = r.u32()?;
                let n = r.u16()? as usize;
                if n == 0 || n > MAX_ENTRY_SLOTS {
                    return Err(FatError::Corrupt);
                }
                let slots = (0..n)
                    .map(|_| Ok((r.u32()?, r.u8()?)))
                    .collect::<FatResult<Vec<_>>>()?;
                let markers = EntryMarkers { parent, slots };
                if code == 6 {
                    RecordBody::BuildEntry(markers)
                } else {
                    RecordBody::RemoveEntry(markers)
                }
            }
            8 => {
                let first_seq = r.u64()?;
                let index = r.u32()?;
                let last = r.u32()?;
                let next = r.cluster()?;
                let origin = match r.u8()? {
                    0 => DeallocOrigin::Orphan,
                    1 => DeallocOrigin::Truncate {
                        entry: r.entry()?,
                        new_last: r.cluster()?,
                    },
                    2 => DeallocOrigin::Pool {
                        prev_last: r.cluster()?,
                        next_start: r.cluster()?,
                    },
                    3 => DeallocOrigin::PoolReset,
                    _ => return Err(FatError::Corrupt),
                };
                let pool_after = r.pool()?;
                let n = r.u16()? as usize;
                if n == 0 || n > MAX_DEALLOC_CHUNKS {
                    return Err(FatError::Corrupt);
                }
                let chunks = (0..n)
                    .map(|_| {
                        Ok(Chunk {
                            start: r.u32()?,
                            count: r.u32()?,
                        })
                    })
                    .collect::<FatResult<Vec<_>>>()?;
                RecordBody::Dealloc(Dealloc {
                    first_seq,
                    index,
                    last,
                    next,
                    origin,
                    pool_after,
                    chunks,
                })
            }
            9 => RecordBody::MultiRecordCommit {
                first_seq: r.u64()?,
                records: r.u32()?,
            },
            10 => {
                let entry = r.entry()?;
                let cluster = r.u32()?;
                let offset = r.u32()?;
                let old_header = XattrHeader {
                    entry_count: r.u16()?,
                    used_bytes: r.u32()?,
                    free_offset: r.u32()?,
                };
                let n = r.u16()? as usize;
                if n > MAX_XATTR_UNDO {
                    return Err(FatError::Corrupt);
                }
                RecordBody::XattrSet(XattrSet {
                    entry,
                    cluster,
                    offset,
                    old_header,
                    old_bytes: r.bytes(n)?.into(),
                })
            }
            _ => return Err(FatError::Corrupt),
        };
        Ok(LogRecord { header, body })
    }
}

/// CRC-32 (IEEE, reflected) used as the record signature.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

struct Writer<'a> {
    buf: &'a mut [u8],
    at: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, at: 0 }
    }

    fn bytes(&mut self, data: &[u8]) -> FatResult<()> {
        let end = self.at + data.len();
        if end > self.buf.len() {
            return Err(FatError::InvalidParam);
        }
        self.buf[self.at..end].copy_from_slice(data);
        self.at = end;
        Ok(())
    }

    fn u8(&mut self, v: u8) -> FatResult<()> {
        self.bytes(&[v])
    }

    fn u16(&mut self, v: u16) -> FatResult<()> {
        self.bytes(&v.to_le_bytes())
    }

    fn u32(&mut self, v: u32) -> FatResult<()> {
        self.bytes(&v.to_le_bytes())
    }

    fn u64(&mut self, v: u64) -> FatResult<()> {
        self.bytes(&v.to_le_bytes())
    }

    fn cluster(&mut self, v: Option<Cluster>) -> FatResult<()> {
        self.u32(v.unwrap_or(0))
    }

    fn entry(&mut self, e: EntryRef) -> FatResult<()> {
        self.u32(e.parent)?;
        self.u32(e.index)
    }

    fn pool(&mut self, p: PoolState) -> FatResult<()> {
        self.cluster(p.head)?;
        self.cluster(p.tail)
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, at: 0 }
    }

    fn bytes(&mut self, n: usize) -> FatResult<&'a [u8]> {
        let end = self.at + n;
        let out = self.buf.get(self.at..end).ok_or(FatError::Corrupt)?;
        self.at = end;
        Ok(out)
    }

    fn u8(&mut self) -> FatResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> FatResult<u16> {
        let b = self.bytes(2)?;
        Ok(crate::le_u16!(b, 0))
    }

    fn u32(&mut self) -> FatResult<u32> {
        let b = self.bytes(4)?;
        Ok(crate::le_u32!(b, 0))
    }

    fn u64(&mut self) -> FatResult<u64> {
        let b = self.bytes(8)?;
        Ok(crate::le_u64!(b, 0))
    }

    fn cluster(&mut self) -> FatResult<Option<Cluster>> {
        Ok(match self.u32()? {
            0 => None,
            c => Some(c),
        })
    }

    fn entry(&mut self) -> FatResult<EntryRef> {
        Ok(EntryRef {
            parent: self.u32()?,
            index: self.u32()?,
        })
    }

    fn pool(&mut self) -> FatResult<PoolState> {
        Ok(PoolState {
            head: self.cluster()?,
            tail: self.cluster()?,
        })
    }
}
