#![forbid(unsafe_code)]
//! Block-extent allocation.
//!
//! A fixed virtual address space of equal-size blocks is handed out as
//! variable-length contiguous ranges ("extents").
//!
//! ## Design
//!
//! The allocator is layered:
//!
//! 1. **HeaderSlotPool** ([`pool`]): fixed-capacity storage for extent
//!    headers, sized at construction and never grown.
//! 2. **FreeListAllocator**: a circular, address-ordered free list threaded
//!    through the pool. Requests are served next-fit: an exact fit is
//!    unlinked, a larger range is split and its tail handed out, and when no
//!    single range is large enough the largest one is taken whole and the
//!    remaining deficit is served the same way, producing an
//!    [`ExtentChain`]. Released ranges are merged with address-adjacent
//!    neighbours so that no two free ranges ever touch.
//!
//! Backing memory is acquired per extent when it is allocated and dropped
//! when it is released, so untouched parts of the address space cost nothing.

pub mod pool;

pub use pool::{ExtentHeader, HeaderSlotPool};

use osh_error::{OshError, Result};
use osh_types::{
    BLOCK_SIZE, BlockNumber, BlockRange, DEFAULT_CAPACITY_BYTES, DEFAULT_HEADER_SLOTS, SlotIndex,
    blocks_for_bytes,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

// ── Configuration ───────────────────────────────────────────────────────────

/// Geometry of the block-index space and its metadata pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocConfig {
    /// Number of blocks in the address space.
    pub total_blocks: u64,
    /// Bytes per block.
    pub block_size: u32,
    /// Capacity of the extent-header pool.
    pub header_slots: usize,
}

impl Default for AllocConfig {
    fn default() -> Self {
        Self {
            total_blocks: DEFAULT_CAPACITY_BYTES / u64::from(BLOCK_SIZE),
            block_size: BLOCK_SIZE,
            header_slots: DEFAULT_HEADER_SLOTS,
        }
    }
}

impl AllocConfig {
    /// Default geometry resized to cover `bytes` (rounded up to whole blocks).
    #[must_use]
    pub fn with_capacity_bytes(bytes: u64) -> Self {
        Self {
            total_blocks: blocks_for_bytes(bytes, BLOCK_SIZE),
            ..Self::default()
        }
    }

    /// Size of the address space in bytes, `None` on overflow.
    #[must_use]
    pub fn capacity_bytes(&self) -> Option<u64> {
        self.total_blocks.checked_mul(u64::from(self.block_size))
    }

    pub fn validate(&self) -> Result<()> {
        if self.total_blocks == 0 {
            return Err(OshError::InvalidArgument(
                "address space must contain at least one block".to_owned(),
            ));
        }
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(OshError::InvalidArgument(format!(
                "block size {} is not a power of two",
                self.block_size
            )));
        }
        if self.capacity_bytes().is_none() {
            return Err(OshError::InvalidArgument(
                "address space size overflows u64".to_owned(),
            ));
        }
        if self.header_slots == 0 || u32::try_from(self.header_slots).is_err() {
            return Err(OshError::InvalidArgument(format!(
                "header slot count {} out of range",
                self.header_slots
            )));
        }
        Ok(())
    }
}

// ── Extent chains ───────────────────────────────────────────────────────────

/// Exclusive handle to one logical allocation: one or more extents linked
/// head to tail.
///
/// The handle is not `Clone`; giving it back through
/// [`FreeListAllocator::free`] is the only way to release its blocks.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "dropping an ExtentChain leaks its blocks until the allocator is dropped"]
pub struct ExtentChain {
    head: SlotIndex,
    blocks: u64,
}

impl ExtentChain {
    #[must_use]
    pub fn head(&self) -> SlotIndex {
        self.head
    }

    /// Total blocks across every extent in the chain.
    #[must_use]
    pub fn blocks(&self) -> u64 {
        self.blocks
    }
}

/// Iterator over the headers of a chain, head first.
pub struct ChainIter<'a> {
    pool: &'a HeaderSlotPool,
    cursor: Option<SlotIndex>,
}

impl<'a> Iterator for ChainIter<'a> {
    type Item = (SlotIndex, &'a ExtentHeader);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.cursor?;
        let header = self.pool.get(idx)?;
        self.cursor = header.next;
        Some((idx, header))
    }
}

// ── Statistics ──────────────────────────────────────────────────────────────

/// Point-in-time view of allocator accounting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocStats {
    pub block_size: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub allocated_blocks: u64,
    pub free_ranges: usize,
    pub largest_free_range: u64,
    pub header_slots: usize,
    pub header_slots_in_use: usize,
}

// ── Free-list allocator ─────────────────────────────────────────────────────

/// Next-fit extent allocator over a circular, address-ordered free list.
pub struct FreeListAllocator {
    pool: HeaderSlotPool,
    /// Most recently touched free range; scans start just after it.
    freep: Option<SlotIndex>,
    initialized: bool,
    config: AllocConfig,
    free_blocks: u64,
    allocated_blocks: u64,
}

impl std::fmt::Debug for FreeListAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreeListAllocator")
            .field("config", &self.config)
            .field("free_blocks", &self.free_blocks)
            .field("allocated_blocks", &self.allocated_blocks)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl FreeListAllocator {
    /// Build an allocator for `config`.
    ///
    /// The free list itself is created lazily by the first allocation.
    pub fn new(config: AllocConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            pool: HeaderSlotPool::new(config.header_slots),
            freep: None,
            initialized: false,
            free_blocks: config.total_blocks,
            allocated_blocks: 0,
            config,
        })
    }

    #[must_use]
    pub fn config(&self) -> &AllocConfig {
        &self.config
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.config.block_size
    }

    #[must_use]
    pub fn total_blocks(&self) -> u64 {
        self.config.total_blocks
    }

    #[must_use]
    pub fn free_blocks(&self) -> u64 {
        self.free_blocks
    }

    #[must_use]
    pub fn allocated_blocks(&self) -> u64 {
        self.allocated_blocks
    }

    #[must_use]
    pub fn pool(&self) -> &HeaderSlotPool {
        &self.pool
    }

    /// Allocate at least `nbytes`, rounded up to whole blocks.
    ///
    /// The result is a single extent whenever some free range is large
    /// enough, and a chain of extents otherwise. On failure nothing is
    /// allocated: extents already taken for this request are released.
    pub fn allocate(&mut self, nbytes: u64) -> Result<ExtentChain> {
        let nblocks = blocks_for_bytes(nbytes, self.config.block_size);
        if nblocks == 0 {
            return Err(OshError::InvalidArgument(
                "cannot allocate 0 bytes".to_owned(),
            ));
        }
        if nblocks > self.free_blocks {
            warn!(
                nblocks,
                free_blocks = self.free_blocks,
                "allocation exceeds free space"
            );
            return Err(OshError::NoSpace);
        }
        self.ensure_initialized()?;

        let mut chain: Option<ExtentChain> = None;
        let mut tail: Option<SlotIndex> = None;
        let mut remaining = nblocks;

        while remaining > 0 {
            let idx = match self.take_fit(remaining) {
                Ok(Some(idx)) => idx,
                Ok(None) => {
                    warn!(nblocks, remaining, "free list exhausted mid-allocation");
                    self.rollback(chain);
                    return Err(OshError::NoSpace);
                }
                Err(err) => {
                    warn!(nblocks, remaining, error = %err, "allocation failed");
                    self.rollback(chain);
                    return Err(err);
                }
            };

            let len = self.pool[idx].len;
            self.free_blocks -= len;
            self.allocated_blocks += len;

            match self.attach_backing(idx) {
                Ok(()) => {}
                Err(err) => {
                    self.rollback(Some(ExtentChain {
                        head: idx,
                        blocks: len,
                    }));
                    self.rollback(chain);
                    return Err(err);
                }
            }

            match (&mut chain, tail) {
                (Some(whole), Some(last)) => {
                    self.pool[last].next = Some(idx);
                    whole.blocks += len;
                }
                _ => {
                    chain = Some(ExtentChain {
                        head: idx,
                        blocks: len,
                    });
                }
            }
            tail = Some(idx);
            remaining = remaining.saturating_sub(len);
        }

        match chain {
            Some(chain) => Ok(chain),
            None => Err(OshError::NoSpace),
        }
    }

    /// Return every extent of `chain` to the free list, merging with
    /// address-adjacent free ranges.
    pub fn free(&mut self, chain: ExtentChain) {
        let mut cursor = Some(chain.head);
        let mut extents = 0u32;
        while let Some(idx) = cursor {
            let Some(header) = self.pool.get_mut(idx) else {
                warn!(slot = %idx, "chain references a free header slot");
                break;
            };
            cursor = header.next.take();
            header.backing = None;
            let len = header.len;
            self.free_blocks += len;
            self.allocated_blocks = self.allocated_blocks.saturating_sub(len);
            self.insert_free(idx);
            extents += 1;
        }
        trace!(blocks = chain.blocks, extents, "chain released");
    }

    /// Link `tail` after the last extent of `chain`.
    pub fn append(&mut self, chain: &mut ExtentChain, tail: ExtentChain) {
        let mut last = chain.head;
        while let Some(next) = self.pool[last].next {
            last = next;
        }
        self.pool[last].next = Some(tail.head);
        chain.blocks += tail.blocks;
    }

    /// Detach the trailing extents of `chain` that lie wholly past its
    /// first `keep_blocks` blocks.
    ///
    /// The head extent always stays with `chain`; release the whole chain
    /// to drop everything. Returns `None` when nothing can be detached.
    pub fn truncate_chain(
        &mut self,
        chain: &mut ExtentChain,
        keep_blocks: u64,
    ) -> Option<ExtentChain> {
        let mut kept = 0u64;
        let mut cur = chain.head;
        loop {
            kept += self.pool[cur].len;
            let next = self.pool[cur].next?;
            if kept >= keep_blocks {
                self.pool[cur].next = None;
                let detached = chain.blocks - kept;
                chain.blocks = kept;
                return Some(ExtentChain {
                    head: next,
                    blocks: detached,
                });
            }
            cur = next;
        }
    }

    /// Iterate the extents of `chain`, head first.
    #[must_use]
    pub fn extents<'a>(&'a self, chain: &ExtentChain) -> ChainIter<'a> {
        ChainIter {
            pool: &self.pool,
            cursor: Some(chain.head),
        }
    }

    /// Backing bytes of an allocated extent.
    #[must_use]
    pub fn backing(&self, idx: SlotIndex) -> Option<&[u8]> {
        self.pool.get(idx)?.backing.as_deref()
    }

    pub fn backing_mut(&mut self, idx: SlotIndex) -> Option<&mut [u8]> {
        self.pool.get_mut(idx)?.backing.as_deref_mut()
    }

    /// Free ranges in address order.
    #[must_use]
    pub fn free_ranges(&self) -> Vec<BlockRange> {
        if !self.initialized {
            return vec![BlockRange::new(BlockNumber(0), self.config.total_blocks)];
        }
        let mut ranges = Vec::new();
        let Some(anchor) = self.freep else {
            return ranges;
        };
        let mut cur = anchor;
        for _ in 0..self.pool.capacity() {
            let Some(header) = self.pool.get(cur) else {
                break;
            };
            ranges.push(BlockRange::new(header.start, header.len));
            match header.next {
                Some(next) if next != anchor => cur = next,
                _ => break,
            }
        }
        ranges.sort_unstable();
        ranges
    }

    #[must_use]
    pub fn stats(&self) -> AllocStats {
        let ranges = self.free_ranges();
        AllocStats {
            block_size: self.config.block_size,
            total_blocks: self.config.total_blocks,
            free_blocks: self.free_blocks,
            allocated_blocks: self.allocated_blocks,
            free_ranges: ranges.len(),
            largest_free_range: ranges.iter().map(|r| r.len).max().unwrap_or(0),
            header_slots: self.pool.capacity(),
            header_slots_in_use: self.pool.in_use(),
        }
    }

    /// Check every free-list invariant.
    ///
    /// Free ranges must be non-empty, in bounds, pairwise disjoint, never
    /// address-adjacent, and together with the allocated blocks account for
    /// the whole address space.
    pub fn verify(&self) -> Result<()> {
        if self.initialized {
            self.verify_ring()?;
        }
        let ranges = self.free_ranges();
        for range in &ranges {
            if range.len == 0 {
                return Err(OshError::Corruption {
                    block: range.start.0,
                    detail: "empty free range".to_owned(),
                });
            }
            if range.end() > self.config.total_blocks {
                return Err(OshError::Corruption {
                    block: range.start.0,
                    detail: format!("free range ends past block {}", self.config.total_blocks),
                });
            }
        }
        for pair in ranges.windows(2) {
            let (lo, hi) = (pair[0], pair[1]);
            if lo.overlaps(hi) {
                return Err(OshError::Corruption {
                    block: hi.start.0,
                    detail: format!("free range overlaps range at block {}", lo.start),
                });
            }
            if lo.is_adjacent_to(hi) {
                return Err(OshError::Corruption {
                    block: hi.start.0,
                    detail: format!("free range not merged with range at block {}", lo.start),
                });
            }
        }
        let listed: u64 = ranges.iter().map(|r| r.len).sum();
        if listed != self.free_blocks {
            return Err(OshError::Corruption {
                block: 0,
                detail: format!(
                    "free list holds {listed} blocks, counter says {}",
                    self.free_blocks
                ),
            });
        }
        if self.free_blocks + self.allocated_blocks != self.config.total_blocks {
            return Err(OshError::Corruption {
                block: 0,
                detail: format!(
                    "free {} + allocated {} != total {}",
                    self.free_blocks, self.allocated_blocks, self.config.total_blocks
                ),
            });
        }
        Ok(())
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn ensure_initialized(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        let idx = self.pool.allocate_slot(ExtentHeader::bare(
            BlockNumber(0),
            self.config.total_blocks,
        ))?;
        self.pool[idx].next = Some(idx);
        self.freep = Some(idx);
        self.initialized = true;
        debug!(
            total_blocks = self.config.total_blocks,
            "free list initialized"
        );
        Ok(())
    }

    fn next_of(&self, idx: SlotIndex) -> SlotIndex {
        self.pool[idx].next.unwrap_or(idx)
    }

    /// Remove `node` (whose predecessor is `prev`) from the free list.
    fn unlink(&mut self, prev: SlotIndex, node: SlotIndex) {
        if prev == node {
            self.freep = None;
        } else {
            let next = self.next_of(node);
            self.pool[prev].next = Some(next);
            self.freep = Some(prev);
        }
        self.pool[node].next = None;
    }

    /// Take one extent toward a request of `nblocks`.
    ///
    /// Returns an extent of exactly `nblocks` when some free range is large
    /// enough, otherwise the whole of the largest free range. `None` when
    /// the free list is empty.
    fn take_fit(&mut self, nblocks: u64) -> Result<Option<SlotIndex>> {
        let Some(anchor) = self.freep else {
            return Ok(None);
        };
        let mut prev = anchor;
        let mut cur = self.next_of(anchor);
        let mut largest = (prev, cur);

        loop {
            let len = self.pool[cur].len;
            if len > self.pool[largest.1].len {
                largest = (prev, cur);
            }

            if len == nblocks {
                self.unlink(prev, cur);
                trace!(start = %self.pool[cur].start, len, "exact fit");
                return Ok(Some(cur));
            }

            if len > nblocks {
                let remaining = len - nblocks;
                let tail_start = BlockNumber(self.pool[cur].start.0 + remaining);
                let split = self
                    .pool
                    .allocate_slot(ExtentHeader::bare(tail_start, nblocks))?;
                self.pool[cur].len = remaining;
                self.freep = Some(prev);
                trace!(start = %tail_start, len = nblocks, left = remaining, "split free range");
                return Ok(Some(split));
            }

            if cur == anchor {
                break;
            }
            prev = cur;
            cur = self.next_of(cur);
        }

        let (prev, node) = largest;
        self.unlink(prev, node);
        debug!(
            start = %self.pool[node].start,
            len = self.pool[node].len,
            wanted = nblocks,
            "no contiguous fit, chaining largest free range"
        );
        Ok(Some(node))
    }

    fn attach_backing(&mut self, idx: SlotIndex) -> Result<()> {
        let header = &mut self.pool[idx];
        let bytes = header
            .len
            .checked_mul(u64::from(self.config.block_size))
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| {
                OshError::InvalidArgument(format!(
                    "extent of {} blocks exceeds the address width",
                    header.len
                ))
            })?;
        header.backing = Some(vec![0u8; bytes].into_boxed_slice());
        Ok(())
    }

    fn rollback(&mut self, chain: Option<ExtentChain>) {
        if let Some(chain) = chain {
            self.free(chain);
        }
    }

    /// Insert the bare range held by `idx` into the free list in address
    /// order, merging with its neighbours when they touch.
    fn insert_free(&mut self, idx: SlotIndex) {
        let Some(anchor) = self.freep else {
            self.pool[idx].next = Some(idx);
            self.freep = Some(idx);
            return;
        };

        let start = self.pool[idx].start.0;
        let mut p = anchor;
        loop {
            let next = self.next_of(p);
            let (ps, ns) = (self.pool[p].start.0, self.pool[next].start.0);
            if ps < start && start < ns {
                break;
            }
            // `p` is the highest range and `next` the lowest.
            if ps >= ns && (start > ps || start < ns) {
                break;
            }
            p = next;
            if p == anchor {
                warn!(start, "no insertion point for freed range");
                break;
            }
        }

        let next = self.next_of(p);
        if self.pool[idx].end() == self.pool[next].start.0 {
            let succ_len = self.pool[next].len;
            let succ_next = self.next_of(next);
            self.pool[idx].len += succ_len;
            self.pool.release_slot(next);
            trace!(start, merged = succ_len, "coalesced with successor");
            if next == p {
                self.pool[idx].next = Some(idx);
                self.freep = Some(idx);
                return;
            }
            self.pool[idx].next = Some(succ_next);
        } else {
            self.pool[idx].next = Some(next);
        }

        if self.pool[p].end() == start {
            let len = self.pool[idx].len;
            let after = self.next_of(idx);
            self.pool[p].len += len;
            self.pool[p].next = Some(after);
            self.pool.release_slot(idx);
            trace!(start = %self.pool[p].start, merged = len, "coalesced with predecessor");
        } else {
            self.pool[p].next = Some(idx);
        }
        self.freep = Some(p);
    }

    /// Walk the ring from the anchor and confirm it closes within the pool.
    fn verify_ring(&self) -> Result<()> {
        let Some(anchor) = self.freep else {
            return Ok(());
        };
        let mut cur = anchor;
        for _ in 0..=self.pool.capacity() {
            let Some(header) = self.pool.get(cur) else {
                return Err(OshError::Corruption {
                    block: 0,
                    detail: format!("free list references empty slot {cur}"),
                });
            };
            if header.backing.is_some() {
                return Err(OshError::Corruption {
                    block: header.start.0,
                    detail: "free range still holds backing memory".to_owned(),
                });
            }
            match header.next {
                Some(next) if next == anchor => return Ok(()),
                Some(next) => cur = next,
                None => {
                    return Err(OshError::Corruption {
                        block: header.start.0,
                        detail: "free list is not circular".to_owned(),
                    });
                }
            }
        }
        Err(OshError::Corruption {
            block: 0,
            detail: "free list does not close".to_owned(),
        })
    }
}
