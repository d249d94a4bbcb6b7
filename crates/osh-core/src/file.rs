//! File contents stored as extent chains.
//!
//! A file's bytes are the concatenation of its extents' backing memory in
//! chain order, visible up to the declared size. Bytes past the size but
//! inside the chain's capacity are always zero, so growing a file (by a
//! write past EOF or an extending truncate) exposes zeros.

use osh_alloc::{ExtentChain, FreeListAllocator};
use osh_error::{OshError, Result};
use osh_types::{SlotIndex, blocks_for_bytes};
use tracing::trace;

/// One contiguous piece of a byte range: extent, offset inside it, length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    extent: SlotIndex,
    within: usize,
    len: usize,
}

/// Content of one regular file.
#[derive(Debug, Default)]
pub struct FileContent {
    chain: Option<ExtentChain>,
    size: u64,
}

impl FileContent {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declared size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn chain(&self) -> Option<&ExtentChain> {
        self.chain.as_ref()
    }

    /// Bytes the current chain can hold without allocating.
    #[must_use]
    pub fn capacity(&self, block_size: u32) -> u64 {
        self.chain
            .as_ref()
            .map_or(0, |c| c.blocks() * u64::from(block_size))
    }

    /// Allocated size in 512-byte units, as reported in `st_blocks`.
    #[must_use]
    pub fn blocks_512(&self, block_size: u32) -> u64 {
        self.capacity(block_size) / 512
    }

    /// Write `data` at `offset`, growing the chain when needed.
    ///
    /// Returns the number of bytes written, always `data.len()` on success.
    /// A failed write leaves content and size untouched.
    pub fn write(
        &mut self,
        alloc: &mut FreeListAllocator,
        offset: u64,
        data: &[u8],
    ) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let end = end_of(offset, data.len())?;
        self.ensure_capacity(alloc, end)?;

        let Some(chain) = self.chain.as_ref() else {
            return Err(missing_chain(end));
        };
        let mut done = 0usize;
        for span in spans(alloc, chain, offset, data.len())? {
            let backing = alloc
                .backing_mut(span.extent)
                .ok_or_else(|| missing_backing(span.extent))?;
            backing[span.within..span.within + span.len]
                .copy_from_slice(&data[done..done + span.len]);
            done += span.len;
        }

        self.size = self.size.max(end);
        trace!(offset, len = data.len(), size = self.size, "file write");
        Ok(done)
    }

    /// Read up to `maxlen` bytes at `offset`. Empty at or past EOF.
    pub fn read(&self, alloc: &FreeListAllocator, offset: u64, maxlen: usize) -> Result<Vec<u8>> {
        if offset >= self.size || maxlen == 0 {
            return Ok(Vec::new());
        }
        let available = usize::try_from(self.size - offset).unwrap_or(usize::MAX);
        let len = maxlen.min(available);
        let Some(chain) = self.chain.as_ref() else {
            return Err(missing_chain(self.size));
        };

        let mut out = Vec::with_capacity(len);
        for span in spans(alloc, chain, offset, len)? {
            let backing = alloc
                .backing(span.extent)
                .ok_or_else(|| missing_backing(span.extent))?;
            out.extend_from_slice(&backing[span.within..span.within + span.len]);
        }
        Ok(out)
    }

    /// Set the size to `newsize`.
    ///
    /// Growing allocates like a write and exposes zeros. Shrinking zeros the
    /// retained bytes past `newsize` and releases trailing extents that lie
    /// wholly beyond it.
    pub fn truncate(&mut self, alloc: &mut FreeListAllocator, newsize: u64) -> Result<()> {
        if newsize == self.size {
            return Ok(());
        }
        if newsize > self.size {
            self.ensure_capacity(alloc, newsize)?;
            self.size = newsize;
            return Ok(());
        }

        let old_size = self.size;
        let keep_blocks = blocks_for_bytes(newsize, alloc.block_size());
        if keep_blocks == 0 {
            self.release(alloc);
            return Ok(());
        }
        if let Some(chain) = self.chain.as_mut() {
            if let Some(detached) = alloc.truncate_chain(chain, keep_blocks) {
                trace!(blocks = detached.blocks(), "releasing truncated extents");
                alloc.free(detached);
            }
        }

        let zero_end = old_size.min(self.capacity(alloc.block_size()));
        if zero_end > newsize {
            let len = usize::try_from(zero_end - newsize).map_err(|_| {
                OshError::InvalidArgument(format!("truncate span {zero_end} too large"))
            })?;
            if let Some(chain) = self.chain.as_ref() {
                for span in spans(alloc, chain, newsize, len)? {
                    let backing = alloc
                        .backing_mut(span.extent)
                        .ok_or_else(|| missing_backing(span.extent))?;
                    backing[span.within..span.within + span.len].fill(0);
                }
            }
        }
        self.size = newsize;
        Ok(())
    }

    /// Return every extent to the allocator and reset the size to zero.
    pub fn release(&mut self, alloc: &mut FreeListAllocator) {
        if let Some(chain) = self.chain.take() {
            alloc.free(chain);
        }
        self.size = 0;
    }

    fn ensure_capacity(&mut self, alloc: &mut FreeListAllocator, end: u64) -> Result<()> {
        let capacity = self.capacity(alloc.block_size());
        if end <= capacity {
            return Ok(());
        }
        let tail = alloc.allocate(end - capacity)?;
        trace!(blocks = tail.blocks(), "file chain grown");
        match self.chain.as_mut() {
            Some(chain) => alloc.append(chain, tail),
            None => self.chain = Some(tail),
        }
        Ok(())
    }
}

/// Split `[offset, offset + len)` of `chain` into per-extent spans.
fn spans(
    alloc: &FreeListAllocator,
    chain: &ExtentChain,
    offset: u64,
    len: usize,
) -> Result<Vec<Span>> {
    let block_size = u64::from(alloc.block_size());
    let end = end_of(offset, len)?;
    let mut out = Vec::new();
    let mut extent_start = 0u64;
    let mut pos = offset;

    for (extent, header) in alloc.extents(chain) {
        if pos >= end {
            break;
        }
        let extent_end = extent_start + header.len * block_size;
        if pos < extent_end {
            let take = extent_end.min(end) - pos;
            out.push(Span {
                extent,
                within: to_usize(pos - extent_start)?,
                len: to_usize(take)?,
            });
            pos += take;
        }
        extent_start = extent_end;
    }

    if pos < end {
        return Err(OshError::Corruption {
            block: 0,
            detail: format!("file chain ends at byte {extent_start}, needed {end}"),
        });
    }
    Ok(out)
}

fn end_of(offset: u64, len: usize) -> Result<u64> {
    u64::try_from(len)
        .ok()
        .and_then(|len| offset.checked_add(len))
        .ok_or_else(|| OshError::InvalidArgument(format!("offset {offset} + {len} overflows")))
}

fn to_usize(value: u64) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| OshError::InvalidArgument(format!("{value} exceeds the address width")))
}

fn missing_backing(extent: SlotIndex) -> OshError {
    OshError::Corruption {
        block: 0,
        detail: format!("allocated extent {extent} has no backing memory"),
    }
}

fn missing_chain(size: u64) -> OshError {
    OshError::Corruption {
        block: 0,
        detail: format!("file of {size} bytes has no extent chain"),
    }
}
