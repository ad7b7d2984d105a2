//! Bounded LRU cache of FAT blocks.
//!
//! Blocks are keyed by their index inside one FAT copy. The access order is
//! kept as a doubly linked list threaded through the map by key, so a touch
//! or an eviction never scans the whole cache. Dirty blocks are written to
//! every FAT copy on [`FatCache::sync`] and are never dropped by eviction:
//! when no clean victim is left the cache flushes itself first.

use alloc::{boxed::Box, collections::BTreeMap, sync::Arc, vec};

use log::{debug, warn};

use crate::{
    config::{FsConfig, VolumeLayout, MIN_CACHE_BLOCKS},
    device::{read_exact_at, write_all_at, BlockDevice},
    error::{FatError, FatResult},
};

/// One cached FAT block.
pub struct CacheBlock {
    pub block: u64,
    pub dirty: bool,
    pub buf: Box<[u8]>,
}

struct Node {
    entry: CacheBlock,
    prev: Option<u64>,
    next: Option<u64>,
}

/// Counters exposed for tuning and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub writebacks: u64,
}

pub struct FatCache {
    device: Arc<dyn BlockDevice>,
    fat_base: u64,
    fat_size: u64,
    fat_copies: u8,
    block_size: usize,
    fat_blocks: u64,
    capacity: usize,
    read_ahead: usize,
    evict_retries: u32,
    nodes: BTreeMap<u64, Node>,
    // least recently used
    head: Option<u64>,
    // most recently used
    tail: Option<u64>,
    stats: CacheStats,
}

impl FatCache {
    pub fn new(device: Arc<dyn BlockDevice>, layout: &VolumeLayout, config: &FsConfig) -> Self {
        let fat_blocks = layout.fat_blocks();
        let capacity = config
            .cache_blocks
            .max(MIN_CACHE_BLOCKS)
            .min(fat_blocks as usize);
        Self {
            device,
            fat_base: layout.fat_base,
            fat_size: layout.fat_size,
            fat_copies: layout.fat_copies,
            block_size: layout.block_size as usize,
            fat_blocks,
            capacity,
            read_ahead: config.read_ahead.max(1),
            evict_retries: config.evict_retries,
            nodes: BTreeMap::new(),
            head: None,
            tail: None,
            stats: CacheStats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn is_cached(&self, block: u64) -> bool {
        self.nodes.contains_key(&block)
    }

    pub fn is_dirty(&self, block: u64) -> bool {
        self.nodes.get(&block).map_or(false, |n| n.entry.dirty)
    }

    /// Returns the block, loading it on a miss, and makes it most recently
    /// used.
    pub fn get(&mut self, block: u64) -> FatResult<&[u8]> {
        self.load(block)?;
        self.nodes
            .get(&block)
            .map(|n| &n.entry.buf[..])
            .ok_or(FatError::InvalidParam)
    }

    /// Like [`FatCache::get`] but writable. The caller marks the block dirty.
    pub fn get_mut(&mut self, block: u64) -> FatResult<&mut [u8]> {
        self.load(block)?;
        self.nodes
            .get_mut(&block)
            .map(|n| &mut n.entry.buf[..])
            .ok_or(FatError::InvalidParam)
    }

    pub fn mark_dirty(&mut self, block: u64) -> FatResult<()> {
        let node = self.nodes.get_mut(&block).ok_or(FatError::InvalidParam)?;
        node.entry.dirty = true;
        Ok(())
    }

    /// Writes every dirty block back to all FAT copies. With `flush` the
    /// device is also asked to make the writes durable.
    pub fn sync(&mut self, flush: bool) -> FatResult<()> {
        let mut written = 0;
        for node in self.nodes.values_mut() {
            if !node.entry.dirty {
                continue;
            }
            let offset = node.entry.block * self.block_size as u64;
            for copy in 0..self.fat_copies as u64 {
                let pos = self.fat_base + copy * self.fat_size + offset;
                write_all_at(&*self.device, pos, &node.entry.buf)?;
            }
            node.entry.dirty = false;
            written += 1;
        }
        self.stats.writebacks += written;
        if flush {
            self.device.flush()?;
        }
        Ok(())
    }

    fn load(&mut self, block: u64) -> FatResult<()> {
        if block >= self.fat_blocks {
            return Err(FatError::InvalidParam);
        }
        if self.nodes.contains_key(&block) {
            self.stats.hits += 1;
            self.touch(block);
            return Ok(());
        }
        self.stats.misses += 1;
        self.make_room()?;

        // Burst: extend the read over following blocks that are neither
        // cached nor past the table, as long as they fit without a flush.
        let mut burst = 1;
        while burst < self.read_ahead
            && block + (burst as u64) < self.fat_blocks
            && !self.nodes.contains_key(&(block + burst as u64))
            && self.nodes.len() + burst < self.capacity
        {
            burst += 1;
        }
        let mut raw = vec![0u8; burst * self.block_size];
        let pos = self.fat_base + block * self.block_size as u64;
        read_exact_at(&*self.device, pos, &mut raw)?;
        if burst > 1 {
            debug!("fat cache: read-ahead {} blocks from {}", burst, block);
        }

        // Read-ahead blocks go in first so the demanded block ends up MRU.
        for i in (1..burst).rev() {
            let start = i * self.block_size;
            let buf = raw[start..start + self.block_size].into();
            self.insert(block + i as u64, buf);
        }
        let buf = raw[..self.block_size].into();
        self.insert(block, buf);
        Ok(())
    }

    fn make_room(&mut self) -> FatResult<()> {
        if self.nodes.len() < self.capacity {
            return Ok(());
        }
        if let Some(victim) = self.lru_clean() {
            self.evict(victim);
            return Ok(());
        }
        // Everything is dirty: write back first, retrying with backoff.
        let mut attempt = 0;
        loop {
            match self.sync(true) {
                Ok(()) => break,
                Err(e) if attempt < self.evict_retries => {
                    warn!("fat cache: flush before eviction failed ({}), retry {}", e, attempt + 1);
                    backoff(attempt);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
        match self.head {
            Some(victim) => {
                self.evict(victim);
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn lru_clean(&self) -> Option<u64> {
        let mut cursor = self.head;
        while let Some(block) = cursor {
            let node = self.nodes.get(&block)?;
            if !node.entry.dirty {
                return Some(block);
            }
            cursor = node.next;
        }
        None
    }

    fn evict(&mut self, block: u64) {
        debug!("fat cache: evict block {}", block);
        self.remove(block);
        self.stats.evictions += 1;
    }

    fn insert(&mut self, block: u64, buf: Box<[u8]>) {
        let node = Node {
            entry: CacheBlock {
                block,
                dirty: false,
                buf,
            },
            prev: None,
            next: None,
        };
        self.nodes.insert(block, node);
        self.attach(block);
    }

    fn remove(&mut self, block: u64) -> Option<CacheBlock> {
        let mut node = self.nodes.remove(&block)?;
        self.detach(node.prev.take(), node.next.take());
        Some(node.entry)
    }

    fn touch(&mut self, block: u64) {
        let Some(node) = self.nodes.get_mut(&block) else {
            return;
        };
        let (prev, next) = (node.prev.take(), node.next.take());
        self.detach(prev, next);
        self.attach(block);
    }

    // Links `block` in as most recently used.
    fn attach(&mut self, block: u64) {
        let old_tail = self.tail.replace(block);
        match old_tail.and_then(|t| self.nodes.get_mut(&t)) {
            Some(last) => last.next = Some(block),
            None => self.head = Some(block),
        }
        if let Some(node) = self.nodes.get_mut(&block) {
            node.prev = old_tail;
            node.next = None;
        }
    }

    // Unlinks a node given its former neighbours.
    fn detach(&mut self, prev: Option<u64>, next: Option<u64>) {
        match next.and_then(|n| self.nodes.get_mut(&n)) {
            Some(node) => node.prev = prev,
            None => self.tail = prev,
        }
        match prev.and_then(|p| self.nodes.get_mut(&p)) {
            Some(node) => node.next = next,
            None => self.head = next,
        }
    }
}

fn backoff(attempt: u32) {
    for _ in 0..(16u32 << attempt.min(16)) {
        core::hint::spin_loop();
    }
}
