#![forbid(unsafe_code)]
//! Shared newtypes and constants for OshFS.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of one addressable block of the virtual address space.
pub const BLOCK_SIZE: u32 = 4096;

/// Default virtual address space: 4 GiB.
pub const DEFAULT_CAPACITY_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// Default number of extent-header slots (one per byte of a 4 KiB block).
pub const DEFAULT_HEADER_SLOTS: usize = 4096;

/// Longest file name accepted by the directory layer.
pub const MAX_NAME_LEN: usize = 255;

/// Inode number of the synthetic root directory.
pub const ROOT_INO: InodeNumber = InodeNumber(1);

/// Index into the block-index space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of an extent header inside the header slot pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotIndex(pub u32);

impl SlotIndex {
    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A half-open range of blocks `[start, start + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockRange {
    pub start: BlockNumber,
    pub len: u64,
}

impl BlockRange {
    #[must_use]
    pub fn new(start: BlockNumber, len: u64) -> Self {
        Self { start, len }
    }

    /// First block past the end of the range.
    #[must_use]
    pub fn end(self) -> u64 {
        self.start.0.saturating_add(self.len)
    }

    /// Whether `other` begins exactly where this range ends.
    #[must_use]
    pub fn is_adjacent_to(self, other: Self) -> bool {
        self.end() == other.start.0
    }

    #[must_use]
    pub fn overlaps(self, other: Self) -> bool {
        self.start.0 < other.end() && other.start.0 < self.end()
    }
}

/// Number of blocks needed to hold `nbytes`, rounded up.
#[must_use]
pub fn blocks_for_bytes(nbytes: u64, block_size: u32) -> u64 {
    nbytes.div_ceil(u64::from(block_size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_for_bytes_rounds_up() {
        assert_eq!(blocks_for_bytes(0, BLOCK_SIZE), 0);
        assert_eq!(blocks_for_bytes(1, BLOCK_SIZE), 1);
        assert_eq!(blocks_for_bytes(4096, BLOCK_SIZE), 1);
        assert_eq!(blocks_for_bytes(4097, BLOCK_SIZE), 2);
        assert_eq!(blocks_for_bytes(5000, BLOCK_SIZE), 2);
    }

    #[test]
    fn range_adjacency_and_overlap() {
        let a = BlockRange::new(BlockNumber(0), 4);
        let b = BlockRange::new(BlockNumber(4), 2);
        let c = BlockRange::new(BlockNumber(3), 2);
        assert!(a.is_adjacent_to(b));
        assert!(!b.is_adjacent_to(a));
        assert!(!a.overlaps(b));
        assert!(a.overlaps(c));
        assert_eq!(b.end(), 6);
    }

    #[test]
    fn default_geometry_is_a_million_blocks() {
        assert_eq!(DEFAULT_CAPACITY_BYTES / u64::from(BLOCK_SIZE), 1_048_576);
    }
}
