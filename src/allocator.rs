//! Cluster allocation, chain surgery and chunk building for deallocation.
//!
//! Everything that changes the table takes a [`TxToken`], which only the
//! journal hands out while a transaction is open. That keeps the "log first,
//! then mutate" order visible in every signature.

use alloc::{collections::BTreeSet, vec::Vec};

use log::debug;

use crate::{
    error::{FatError, FatResult},
    journal::TxToken,
    table::FatTable,
    types::{Chunk, Cluster, FatEntry, FIRST_CLUSTER},
};

/// One batch of chunks built from a chain walk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkList {
    pub chunks: Vec<Chunk>,
    /// First cluster not covered by this batch, if the walk stopped early.
    pub next: Option<Cluster>,
}

impl ChunkList {
    pub fn clusters(&self) -> u32 {
        self.chunks.iter().map(|c| c.count).sum()
    }
}

pub struct ClusterAllocator {
    cursor: Cluster,
    free: u32,
    // held by pre-allocation windows; still FREE in the table
    reserved: BTreeSet<Cluster>,
}

impl ClusterAllocator {
    /// Counts free clusters once and places the cursor at the start.
    pub fn mount(table: &mut FatTable) -> FatResult<Self> {
        let mut free = 0;
        for cluster in FIRST_CLUSTER..table.num_clusters() {
            if table.read_entry(cluster)?.is_free() {
                free += 1;
            }
        }
        debug!("allocator: {} free clusters", free);
        Ok(Self {
            cursor: FIRST_CLUSTER,
            free,
            reserved: BTreeSet::new(),
        })
    }

    /// Free clusters not held by a reservation.
    pub fn free_clusters(&self) -> u32 {
        self.free.saturating_sub(self.reserved.len() as u32)
    }

    pub fn cursor(&self) -> Cluster {
        self.cursor
    }

    /// Scans forward from the search cursor, wrapping at the end of the
    /// table, for up to `n` free clusters. Returns what it found, or
    /// `NoSpace` if nothing was free.
    pub fn find_free(&mut self, table: &mut FatTable, n: u32) -> FatResult<Vec<Cluster>> {
        let available = self.free_clusters();
        if n == 0 {
            return Err(FatError::InvalidParam);
        }
        if available == 0 {
            return Err(FatError::NoSpace);
        }
        let want = n.min(available) as usize;
        let span = table.num_clusters() - FIRST_CLUSTER;
        let mut found = Vec::with_capacity(want);
        for i in 0..span {
            let cluster = FIRST_CLUSTER + (self.cursor - FIRST_CLUSTER + i) % span;
            if self.reserved.contains(&cluster) {
                continue;
            }
            if table.read_entry(cluster)?.is_free() {
                found.push(cluster);
                if found.len() == want {
                    break;
                }
            }
        }
        match found.last() {
            Some(&last) => {
                self.cursor = if last + 1 >= table.num_clusters() {
                    FIRST_CLUSTER
                } else {
                    last + 1
                };
                Ok(found)
            }
            None => Err(FatError::NoSpace),
        }
    }

    /// Holds free clusters for a pre-allocation window.
    pub fn reserve(&mut self, clusters: &[Cluster]) {
        self.reserved.extend(clusters.iter().copied());
    }

    /// Hands unused reservations back and points the cursor at them.
    pub fn release(&mut self, clusters: &[Cluster]) {
        for cluster in clusters {
            self.reserved.remove(cluster);
        }
        if let Some(&lowest) = clusters.iter().min() {
            self.cursor = self.cursor.min(lowest);
        }
    }

    /// Marks `cluster` as the new tail and links `last` to it.
    pub fn link(
        &mut self,
        table: &mut FatTable,
        _tx: &TxToken,
        last: Option<Cluster>,
        cluster: Cluster,
    ) -> FatResult<()> {
        let was_free = table.read_entry(cluster)?.is_free();
        table.write_entry(cluster, FatEntry::Tail)?;
        if let Some(last) = last {
            table.write_entry(last, FatEntry::Next(cluster))?;
        }
        self.reserved.remove(&cluster);
        if was_free {
            self.free = self.free.saturating_sub(1);
        }
        Ok(())
    }

    /// Points `from` at `to`.
    pub fn set_next(
        &mut self,
        table: &mut FatTable,
        _tx: &TxToken,
        from: Cluster,
        to: Cluster,
    ) -> FatResult<()> {
        self.claim(table, from, FatEntry::Next(to))
    }

    /// Terminates a chain at `cluster`. Undo can hit a cluster whose own
    /// allocation never reached the disk, so a free entry is counted as
    /// taken.
    pub fn set_tail(&mut self, table: &mut FatTable, _tx: &TxToken, cluster: Cluster) -> FatResult<()> {
        self.claim(table, cluster, FatEntry::Tail)
    }

    fn claim(&mut self, table: &mut FatTable, cluster: Cluster, entry: FatEntry) -> FatResult<()> {
        let was_free = table.read_entry(cluster)?.is_free();
        table.write_entry(cluster, entry)?;
        if was_free {
            self.reserved.remove(&cluster);
            self.free = self.free.saturating_sub(1);
        }
        Ok(())
    }

    /// Frees one cluster. Returns whether it was in use. The entry is
    /// rewritten either way so every FAT copy gets it on the next sync.
    pub fn unlink(&mut self, table: &mut FatTable, _tx: &TxToken, cluster: Cluster) -> FatResult<bool> {
        let was_used = !table.read_entry(cluster)?.is_free();
        table.write_entry(cluster, FatEntry::Free)?;
        if was_used {
            self.free += 1;
        }
        Ok(was_used)
    }

    /// Frees every cluster of every chunk. Returns how many were not
    /// already free, so replaying a batch twice is harmless.
    pub fn free_chunks(&mut self, table: &mut FatTable, tx: &TxToken, chunks: &[Chunk]) -> FatResult<u32> {
        let mut freed = 0;
        for chunk in chunks {
            for cluster in chunk.clusters() {
                if self.unlink(table, tx, cluster)? {
                    freed += 1;
                }
            }
        }
        Ok(freed)
    }

    /// Follows `skip` links from `start`. Returns the cluster before the one
    /// reached (if any) and the cluster reached.
    pub fn walk(table: &mut FatTable, start: Cluster, skip: u32) -> FatResult<(Option<Cluster>, Cluster)> {
        let mut chain = table.chain(start);
        let mut prev = None;
        let mut cur = None;
        for _ in 0..=skip {
            match chain.next() {
                Some(cluster) => {
                    prev = cur;
                    cur = Some(cluster?);
                }
                None => return Err(FatError::ChainTooShort),
            }
        }
        cur.map(|c| (prev, c)).ok_or(FatError::ChainTooShort)
    }

    /// Walks from `start` to `last` and coalesces the clusters into runs.
    /// Stops once `max_chunks` runs are full; the caller logs and frees that
    /// batch and calls again from `next`. An error discards the batch.
    pub fn build_chunks(
        table: &mut FatTable,
        start: Cluster,
        last: Cluster,
        max_chunks: usize,
    ) -> FatResult<ChunkList> {
        let mut list = ChunkList::default();
        for cluster in table.chain(start) {
            let cluster = cluster?;
            let extended = list
                .chunks
                .last_mut()
                .map_or(false, |chunk| chunk.try_extend(cluster));
            if !extended {
                if list.chunks.len() == max_chunks {
                    list.next = Some(cluster);
                    return Ok(list);
                }
                list.chunks.push(Chunk::new(cluster));
            }
            if cluster == last {
                return Ok(list);
            }
        }
        Err(FatError::ChainTooShort)
    }
}
