//! The per-worker hierarchical heap.
//!
//! An array of optional chunk lists indexed by fork depth, plus the cached
//! tail chunk the mutator bumps into and the allocation accounting that
//! drives collection decisions. Thread objects hold a host pointer to their
//! heap; the struct itself never moves.

use crate::config::HhConfig;
use crate::error::GcError;
use crate::heap::block::ChunkPool;
use crate::heap::chunk::{self, Chunk, ChunkList};
use crate::heap::HEAP_LIMIT_SLOP;

/// Maximum fork depth a hierarchical heap can represent. Matches the deque
/// capacity: a program cannot outgrow one without the other.
pub const MAX_DEPTH: usize = arbor_sched::DEQUE_CAP;

/// A worker's stack of per-depth chunk lists.
pub struct HierarchicalHeap {
    levels: [*mut ChunkList; MAX_DEPTH],
    last_allocated_chunk: *mut Chunk,
    collection_threshold: usize,
    bytes_allocated_since_last_collection: usize,
}

impl HierarchicalHeap {
    /// Allocate an empty heap at a stable address.
    pub fn new_boxed(initial_threshold: usize) -> *mut HierarchicalHeap {
        Box::into_raw(Box::new(HierarchicalHeap {
            levels: [std::ptr::null_mut(); MAX_DEPTH],
            last_allocated_chunk: std::ptr::null_mut(),
            collection_threshold: initial_threshold,
            bytes_allocated_since_last_collection: 0,
        }))
    }

    /// The chunk list at `depth`, or null.
    #[inline]
    pub fn level(&self, depth: u32) -> *mut ChunkList {
        self.levels[depth as usize]
    }

    /// Install (or clear) the chunk list at `depth`.
    #[inline]
    pub fn set_level(&mut self, depth: u32, list: *mut ChunkList) {
        self.levels[depth as usize] = list;
    }

    /// The chunk list at `depth`, created on demand.
    pub fn ensure_level(&mut self, depth: u32) -> *mut ChunkList {
        let me = self as *mut HierarchicalHeap;
        let slot = &mut self.levels[depth as usize];
        if slot.is_null() {
            *slot = ChunkList::new_level(depth, me);
        }
        *slot
    }

    /// The chunk the mutator frontier currently lives in, or null right
    /// after a collection that emptied the heap.
    #[inline]
    pub fn last_allocated_chunk(&self) -> *mut Chunk {
        self.last_allocated_chunk
    }

    /// Reinstall the mutator's chunk (driver use, after collection).
    #[inline]
    pub fn set_last_allocated_chunk(&mut self, chunk: *mut Chunk) {
        self.last_allocated_chunk = chunk;
    }

    /// Bytes a depth may allocate before collection is considered.
    #[inline]
    pub fn collection_threshold(&self) -> usize {
        self.collection_threshold
    }

    /// Install the next collection threshold.
    #[inline]
    pub fn set_collection_threshold(&mut self, threshold: usize) {
        self.collection_threshold = threshold;
    }

    /// Bytes allocated since the last local collection (chunk-granular).
    #[inline]
    pub fn bytes_allocated_since_last_collection(&self) -> usize {
        self.bytes_allocated_since_last_collection
    }

    /// Reset the allocation budget after a collection.
    #[inline]
    pub fn reset_allocation_budget(&mut self) {
        self.bytes_allocated_since_last_collection = 0;
    }

    /// Account bytes carved outside [`HierarchicalHeap::extend`] (dedicated
    /// single-object chunks).
    #[inline]
    pub fn note_allocated(&mut self, bytes: usize) {
        self.bytes_allocated_since_last_collection += bytes;
    }

    /// Whether the allocation budget calls for a collection.
    #[inline]
    pub fn budget_exhausted(&self) -> bool {
        self.bytes_allocated_since_last_collection >= self.collection_threshold
    }

    /// Grow the heap at `depth` with a chunk covering `bytes`, and make that
    /// chunk the mutator's current one.
    pub fn extend(
        &mut self,
        pool: &ChunkPool,
        depth: u32,
        bytes: usize,
    ) -> Result<*mut Chunk, GcError> {
        let list = self.ensure_level(depth);
        let chunk = unsafe { chunk::allocate_chunk(list, pool, bytes.max(HEAP_LIMIT_SLOP))? };
        self.last_allocated_chunk = chunk;
        self.bytes_allocated_since_last_collection += unsafe { (*chunk).capacity() };
        Ok(chunk)
    }

    /// Total payload capacity across all levels.
    pub fn size(&self) -> usize {
        self.levels
            .iter()
            .filter(|l| !l.is_null())
            .map(|l| unsafe { (**l).capacity() })
            .sum()
    }

    /// Payload bytes in use across all levels.
    pub fn used_size(&self) -> usize {
        self.levels
            .iter()
            .filter(|l| !l.is_null())
            .map(|l| unsafe { (**l).used_bytes() })
            .sum()
    }

    /// The deepest non-empty level, or None for a fresh heap.
    pub fn deepest_occupied(&self) -> Option<u32> {
        (0..MAX_DEPTH as u32)
            .rev()
            .find(|d| !self.levels[*d as usize].is_null())
    }

    /// Threshold for the collection after one that left `live` bytes.
    pub fn next_collection_threshold(config: &HhConfig, live: usize) -> usize {
        let grown = (live as f64 * config.threshold_growth_factor) as usize;
        grown.max(config.initial_collection_threshold)
    }

    /// Tear down a heap: every level (with its remembered set) goes back to
    /// the pool, then the heap itself is freed.
    pub unsafe fn destroy(hh: *mut HierarchicalHeap, pool: &ChunkPool) {
        for depth in 0..MAX_DEPTH {
            let list = (*hh).levels[depth];
            if !list.is_null() {
                chunk::release_list(pool, list);
                (*hh).levels[depth] = std::ptr::null_mut();
            }
        }
        drop(Box::from_raw(hh));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::BLOCK_SIZE;

    #[test]
    fn extend_creates_level_and_tracks_budget() {
        let pool = ChunkPool::new(64 * BLOCK_SIZE).unwrap();
        let hh = HierarchicalHeap::new_boxed(64 * 1024);
        unsafe {
            assert!((*hh).level(2).is_null());
            let chunk = (*hh).extend(&pool, 2, 100).unwrap();
            assert!(!(*hh).level(2).is_null());
            assert_eq!((*hh).last_allocated_chunk(), chunk);
            assert_eq!(
                (*hh).bytes_allocated_since_last_collection(),
                (*chunk).capacity()
            );
            assert_eq!((*hh).deepest_occupied(), Some(2));
            HierarchicalHeap::destroy(hh, &pool);
        }
    }

    #[test]
    fn budget_trips_threshold() {
        let pool = ChunkPool::new(64 * BLOCK_SIZE).unwrap();
        let hh = HierarchicalHeap::new_boxed(2 * BLOCK_SIZE);
        unsafe {
            assert!(!(*hh).budget_exhausted());
            (*hh).extend(&pool, 1, BLOCK_SIZE - 512).unwrap();
            (*hh).extend(&pool, 1, BLOCK_SIZE - 512).unwrap();
            (*hh).extend(&pool, 1, BLOCK_SIZE - 512).unwrap();
            assert!((*hh).budget_exhausted());
            (*hh).reset_allocation_budget();
            assert!(!(*hh).budget_exhausted());
            HierarchicalHeap::destroy(hh, &pool);
        }
    }

    #[test]
    fn threshold_grows_with_survivors() {
        let config = HhConfig::default();
        let small = HierarchicalHeap::next_collection_threshold(&config, 0);
        assert_eq!(small, config.initial_collection_threshold);
        let big = HierarchicalHeap::next_collection_threshold(&config, 1 << 20);
        assert_eq!(big, (config.threshold_growth_factor as usize) << 20);
    }
}
