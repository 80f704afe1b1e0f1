//! Block region and free-span pool.
//!
//! One contiguous allocation, aligned to [`BLOCK_SIZE`], backs every chunk a
//! worker ever sees. Fresh spans are carved with a bump cursor; released
//! spans go to a free list keyed by span length (in blocks). A span larger
//! than requested may be split, with the remainder returned to the pool.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::ptr::NonNull;

use crate::error::GcError;
use crate::heap::BLOCK_SIZE;

/// The backing region plus the free-span store.
///
/// Shared by every worker of a process; the critical section is a single
/// map operation, so a mutex is cheaper than a lock-free structure here.
pub struct ChunkPool {
    region: NonNull<u8>,
    region_blocks: usize,
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    /// Next never-used block index.
    next_block: usize,
    /// Free spans keyed by block count.
    free: FxHashMap<usize, Vec<usize>>,
}

impl ChunkPool {
    /// Map a region of `region_bytes` (rounded up to whole blocks).
    pub fn new(region_bytes: usize) -> Result<Self, GcError> {
        let region_blocks = region_bytes.div_ceil(BLOCK_SIZE).max(1);
        let layout =
            std::alloc::Layout::from_size_align(region_blocks * BLOCK_SIZE, BLOCK_SIZE)
                .map_err(|_| GcError::OutOfHeap)?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let region = NonNull::new(ptr).ok_or(GcError::OutOfHeap)?;

        Ok(Self {
            region,
            region_blocks,
            inner: Mutex::new(PoolInner {
                next_block: 0,
                free: FxHashMap::default(),
            }),
        })
    }

    /// Claim a span of `nblocks` contiguous blocks.
    pub fn allocate_span(&self, nblocks: usize) -> Result<NonNull<u8>, GcError> {
        debug_assert!(nblocks > 0);
        let mut inner = self.inner.lock();

        // Exact-fit reuse first.
        if let Some(spans) = inner.free.get_mut(&nblocks) {
            if let Some(idx) = spans.pop() {
                return Ok(self.block_ptr(idx));
            }
        }

        // Carve a fresh span.
        if inner.next_block + nblocks <= self.region_blocks {
            let idx = inner.next_block;
            inner.next_block += nblocks;
            return Ok(self.block_ptr(idx));
        }

        // Split the smallest free span that covers the request.
        let candidate = inner
            .free
            .iter()
            .filter(|(len, spans)| **len > nblocks && !spans.is_empty())
            .map(|(len, _)| *len)
            .min();
        if let Some(len) = candidate {
            if let Some(idx) = inner.free.get_mut(&len).and_then(Vec::pop) {
                inner
                    .free
                    .entry(len - nblocks)
                    .or_default()
                    .push(idx + nblocks);
                return Ok(self.block_ptr(idx));
            }
        }

        Err(GcError::OutOfHeap)
    }

    /// Return a span claimed by [`ChunkPool::allocate_span`].
    pub fn release_span(&self, span: NonNull<u8>, nblocks: usize) {
        debug_assert!(self.contains(span.as_ptr() as usize));
        let idx = (span.as_ptr() as usize - self.region.as_ptr() as usize) / BLOCK_SIZE;
        let mut inner = self.inner.lock();
        inner.free.entry(nblocks).or_default().push(idx);
    }

    /// Whether `addr` lies inside the mapped region.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.region.as_ptr() as usize;
        addr >= start && addr < start + self.region_blocks * BLOCK_SIZE
    }

    /// Total region size in bytes.
    #[inline]
    pub fn region_size(&self) -> usize {
        self.region_blocks * BLOCK_SIZE
    }

    /// Blocks not yet carved and not on the free list.
    pub fn untouched_blocks(&self) -> usize {
        self.region_blocks - self.inner.lock().next_block
    }

    #[inline]
    fn block_ptr(&self, idx: usize) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.region.as_ptr().add(idx * BLOCK_SIZE)) }
    }
}

impl Drop for ChunkPool {
    fn drop(&mut self) {
        if let Ok(layout) =
            std::alloc::Layout::from_size_align(self.region_blocks * BLOCK_SIZE, BLOCK_SIZE)
        {
            unsafe {
                std::alloc::dealloc(self.region.as_ptr(), layout);
            }
        }
    }
}

// Safety: the region pointer is only handed out under the pool's own
// bookkeeping; all shared state sits behind the mutex.
unsafe impl Send for ChunkPool {}
unsafe impl Sync for ChunkPool {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans_are_block_aligned() {
        let pool = ChunkPool::new(64 * BLOCK_SIZE).unwrap();
        let a = pool.allocate_span(1).unwrap();
        let b = pool.allocate_span(3).unwrap();
        assert_eq!(a.as_ptr() as usize % BLOCK_SIZE, 0);
        assert_eq!(b.as_ptr() as usize % BLOCK_SIZE, 0);
        assert!(pool.contains(a.as_ptr() as usize));
        assert!(pool.contains(b.as_ptr() as usize + 2 * BLOCK_SIZE));
    }

    #[test]
    fn released_spans_are_reused() {
        let pool = ChunkPool::new(16 * BLOCK_SIZE).unwrap();
        let a = pool.allocate_span(2).unwrap();
        pool.release_span(a, 2);
        let b = pool.allocate_span(2).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn exhaustion_is_out_of_heap() {
        let pool = ChunkPool::new(4 * BLOCK_SIZE).unwrap();
        let _a = pool.allocate_span(4).unwrap();
        assert_eq!(pool.allocate_span(1), Err(GcError::OutOfHeap));
    }

    #[test]
    fn larger_free_spans_are_split() {
        let pool = ChunkPool::new(8 * BLOCK_SIZE).unwrap();
        let big = pool.allocate_span(8).unwrap();
        pool.release_span(big, 8);
        // The bump cursor is spent; both of these must come from the split.
        let a = pool.allocate_span(3).unwrap();
        let b = pool.allocate_span(5).unwrap();
        assert!(pool.contains(a.as_ptr() as usize));
        assert!(pool.contains(b.as_ptr() as usize));
        assert_ne!(a, b);
    }
}
