//! Fixed-capacity store for extent headers.
//!
//! The pool is sized once when the allocator is built and never grows, so
//! the extent allocator can create and destroy headers without going back
//! to any allocator of its own.

use osh_error::{OshError, Result};
use osh_types::{BlockNumber, SlotIndex};

/// Descriptor of one extent: a run of blocks plus, while allocated, the
/// memory that backs it.
pub struct ExtentHeader {
    /// Following header on the free list or in a content chain.
    pub next: Option<SlotIndex>,
    pub start: BlockNumber,
    /// Length in blocks, at least 1.
    pub len: u64,
    /// Zero-filled memory, present only while the extent is allocated.
    pub backing: Option<Box<[u8]>>,
}

impl ExtentHeader {
    /// A bare (free) header for `len` blocks starting at `start`.
    #[must_use]
    pub fn bare(start: BlockNumber, len: u64) -> Self {
        Self {
            next: None,
            start,
            len,
            backing: None,
        }
    }

    /// First block past the end of this extent.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.start.0 + self.len
    }
}

impl std::fmt::Debug for ExtentHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtentHeader")
            .field("next", &self.next)
            .field("start", &self.start)
            .field("len", &self.len)
            .field("backing_len", &self.backing.as_ref().map(|b| b.len()))
            .finish()
    }
}

#[derive(Debug)]
enum Slot {
    Free,
    Holding(ExtentHeader),
}

/// Next-fit slot allocator over a fixed array of header slots.
pub struct HeaderSlotPool {
    slots: Box<[Slot]>,
    /// Position just past the most recently returned slot.
    cursor: usize,
    in_use: usize,
}

impl HeaderSlotPool {
    /// Create a pool with `capacity` slots, all free.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let slots = std::iter::repeat_with(|| Slot::Free)
            .take(capacity)
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            cursor: 0,
            in_use: 0,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.slots.len() - self.in_use
    }

    /// Store `header` in the first free slot at or after the cursor,
    /// wrapping once around the pool.
    pub fn allocate_slot(&mut self, header: ExtentHeader) -> Result<SlotIndex> {
        let capacity = self.slots.len();
        let found = (self.cursor..capacity)
            .chain(0..self.cursor.min(capacity))
            .find(|&idx| matches!(self.slots[idx], Slot::Free));

        let Some(idx) = found else {
            return Err(OshError::PoolExhausted { capacity });
        };
        let slot_idx = u32::try_from(idx).map_err(|_| OshError::PoolExhausted { capacity })?;

        self.slots[idx] = Slot::Holding(header);
        self.in_use += 1;
        self.cursor = (idx + 1) % capacity;
        Ok(SlotIndex(slot_idx))
    }

    /// Mark `idx` free and hand back the header it held.
    ///
    /// Releasing an already-free slot is a no-op returning `None`.
    pub fn release_slot(&mut self, idx: SlotIndex) -> Option<ExtentHeader> {
        let slot = self.slots.get_mut(idx.as_usize())?;
        match std::mem::replace(slot, Slot::Free) {
            Slot::Holding(header) => {
                self.in_use -= 1;
                Some(header)
            }
            Slot::Free => None,
        }
    }

    #[must_use]
    pub fn get(&self, idx: SlotIndex) -> Option<&ExtentHeader> {
        match self.slots.get(idx.as_usize())? {
            Slot::Holding(header) => Some(header),
            Slot::Free => None,
        }
    }

    pub fn get_mut(&mut self, idx: SlotIndex) -> Option<&mut ExtentHeader> {
        match self.slots.get_mut(idx.as_usize())? {
            Slot::Holding(header) => Some(header),
            Slot::Free => None,
        }
    }
}

impl std::fmt::Debug for HeaderSlotPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderSlotPool")
            .field("capacity", &self.slots.len())
            .field("in_use", &self.in_use)
            .field("cursor", &self.cursor)
            .finish()
    }
}

impl std::ops::Index<SlotIndex> for HeaderSlotPool {
    type Output = ExtentHeader;

    /// Panics if `idx` does not hold a header; the allocator only indexes
    /// slots it owns.
    fn index(&self, idx: SlotIndex) -> &ExtentHeader {
        match self.get(idx) {
            Some(header) => header,
            None => panic!("header slot {idx} is not in use"),
        }
    }
}

impl std::ops::IndexMut<SlotIndex> for HeaderSlotPool {
    fn index_mut(&mut self, idx: SlotIndex) -> &mut ExtentHeader {
        match self.get_mut(idx) {
            Some(header) => header,
            None => panic!("header slot {idx} is not in use"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hdr(start: u64, len: u64) -> ExtentHeader {
        ExtentHeader::bare(BlockNumber(start), len)
    }

    #[test]
    fn allocates_in_order_then_exhausts() {
        let mut pool = HeaderSlotPool::new(3);
        assert_eq!(pool.allocate_slot(hdr(0, 1)).unwrap(), SlotIndex(0));
        assert_eq!(pool.allocate_slot(hdr(1, 1)).unwrap(), SlotIndex(1));
        assert_eq!(pool.allocate_slot(hdr(2, 1)).unwrap(), SlotIndex(2));
        assert_eq!(pool.in_use(), 3);

        let err = pool.allocate_slot(hdr(3, 1)).unwrap_err();
        assert!(matches!(err, OshError::PoolExhausted { capacity: 3 }));
    }

    #[test]
    fn next_fit_resumes_past_last_returned_slot() {
        let mut pool = HeaderSlotPool::new(4);
        for i in 0..4 {
            pool.allocate_slot(hdr(i, 1)).unwrap();
        }
        pool.release_slot(SlotIndex(0));
        pool.release_slot(SlotIndex(2));

        // Cursor wrapped to 0 after filling slot 3, so slot 0 comes first.
        assert_eq!(pool.allocate_slot(hdr(9, 1)).unwrap(), SlotIndex(0));
        // Next search starts at 1 and finds 2 before wrapping.
        assert_eq!(pool.allocate_slot(hdr(9, 1)).unwrap(), SlotIndex(2));
    }

    #[test]
    fn scan_wraps_around_once() {
        let mut pool = HeaderSlotPool::new(4);
        for i in 0..3 {
            pool.allocate_slot(hdr(i, 1)).unwrap();
        }
        pool.release_slot(SlotIndex(1));
        // Cursor is at 3: slot 3 is free and is picked before wrapping.
        assert_eq!(pool.allocate_slot(hdr(5, 1)).unwrap(), SlotIndex(3));
        // Cursor wrapped to 0; the only free slot left is 1.
        assert_eq!(pool.allocate_slot(hdr(6, 1)).unwrap(), SlotIndex(1));
    }

    #[test]
    fn release_clears_content_and_is_idempotent() {
        let mut pool = HeaderSlotPool::new(2);
        let idx = pool.allocate_slot(hdr(10, 5)).unwrap();
        let held = pool.release_slot(idx).unwrap();
        assert_eq!(held.start, BlockNumber(10));
        assert_eq!(held.len, 5);
        assert!(pool.get(idx).is_none());
        assert!(pool.release_slot(idx).is_none());
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn zero_capacity_pool_is_always_exhausted() {
        let mut pool = HeaderSlotPool::new(0);
        assert!(matches!(
            pool.allocate_slot(hdr(0, 1)),
            Err(OshError::PoolExhausted { capacity: 0 })
        ));
    }

    #[test]
    fn index_reads_held_header() {
        let mut pool = HeaderSlotPool::new(2);
        let idx = pool.allocate_slot(hdr(3, 2)).unwrap();
        pool[idx].len = 7;
        assert_eq!(pool[idx].end(), 10);
    }
}
