//! Runtime invariant checks.
//!
//! The predicates are cheap enough to run on every slow-path entry in debug
//! builds; [`heap_consistent`] is the expensive sweep reserved for tests and
//! targeted debugging.

use rustc_hash::FxHashSet;

use crate::heap::{Chunk, HierarchicalHeap, MAX_DEPTH};
use crate::object::{GcStack, SEQUENCE_METADATA_SIZE};
use crate::worker::Worker;

/// The mutator-frontier invariant: the requested bytes fit under the slop
/// limit, the frontier sits inside the heap's current chunk without crossing
/// the first block's sequence-metadata margin, and that chunk can hold more
/// than one object.
pub fn mutator_frontier_ok(worker: &Worker) -> bool {
    if !worker.current_thread().is_objptr() || worker.frontier.is_null() {
        return false;
    }
    unsafe {
        let thread = worker.thread_ptr();
        let hh = (*thread).hierarchical_heap;
        let chunk = (*hh).last_allocated_chunk();
        if chunk.is_null() || !(*chunk).magic_ok() {
            return false;
        }
        (*thread).bytes_needed
            <= (worker.limit_plus_slop as usize - worker.frontier as usize) as u64
            && worker.frontier >= (*chunk).start()
            && worker.frontier
                < (*chunk).first_block_end().sub(SEQUENCE_METADATA_SIZE)
            && (*chunk).might_contain_multiple_objects()
    }
}

/// The mutator-stack invariant: room for at least one more frame word, in a
/// chunk dedicated to the stack.
pub fn mutator_stack_ok(worker: &Worker) -> bool {
    if !worker.current_thread().is_objptr() || worker.stack_top.is_null() {
        return false;
    }
    unsafe {
        let stack_op = (*worker.thread_ptr()).stack;
        if !stack_op.is_objptr() {
            return false;
        }
        let stack = GcStack::from_objptr(stack_op);
        let chunk = Chunk::of(stack_op);
        worker.stack_top.add(8) <= (*stack).frames_limit()
            && worker.stack_top >= (*stack).frames_start()
            && !(*chunk).might_contain_multiple_objects()
    }
}

/// Full-heap structural sweep: every chunk's magic intact, every chunk
/// linked into exactly one level, every level's back-links consistent.
///
/// # Safety
/// `hh` must be a live hierarchical heap with no collection in flight.
pub unsafe fn heap_consistent(hh: *mut HierarchicalHeap) -> bool {
    let mut seen: FxHashSet<usize> = FxHashSet::default();
    for depth in 0..MAX_DEPTH as u32 {
        let level = (*hh).level(depth);
        if level.is_null() {
            continue;
        }
        if (*level).depth() != depth {
            return false;
        }
        let mut chunk = (*level).first();
        let mut capacity = 0;
        while !chunk.is_null() {
            if !(*chunk).magic_ok()
                || (*chunk).level_head() != level
                || !seen.insert(chunk as usize)
                || (*chunk).frontier() < (*chunk).start()
                || (*chunk).frontier() > (*chunk).limit()
            {
                return false;
            }
            capacity += (*chunk).capacity();
            chunk = (*chunk).next();
        }
        if capacity != (*level).capacity() {
            return false;
        }
    }
    true
}
