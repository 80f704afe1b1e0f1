//! World initialization and thread construction.
//!
//! `init_world` runs once per process: it builds the depth-0 thread (heap,
//! stack, frontier) and copies the program's initial vectors into depth-0
//! sequence objects, installing them as globals. `duplicate_world` runs once
//! per additional worker and builds an empty depth-1 thread instead — worker
//! heaps beyond the first never own the globals.

use crate::error::GcError;
use crate::heap::{allocate_chunk, HierarchicalHeap, HEAP_LIMIT_SLOP};
use crate::object::{
    set_header, GcStack, GcThread, Header, ObjPtr, ObjectTag, NORMAL_METADATA_SIZE,
    STACK_METADATA_SIZE, STACK_STRUCT_SIZE, THREAD_OBJECT_BYTES,
};
use crate::worker::Worker;

/// One initial vector to copy into the heap at world init.
pub struct VectorInit<'a> {
    /// Index of the global that will hold the vector.
    pub global_index: usize,
    /// Element size in bytes (1, 2, 4 or 8).
    pub element_size: usize,
    /// Raw element data; its length must divide evenly by `element_size`.
    pub data: &'a [u8],
}

/// Build a fresh thread with its own hierarchical heap, stack included, at
/// fork depth `level`. Does not switch to it.
pub fn new_thread_with_heap(
    worker: &mut Worker,
    stack_reserved: usize,
    level: u32,
) -> Result<ObjPtr, GcError> {
    let pool = worker.pool().clone();
    let hh = HierarchicalHeap::new_boxed(worker.config().initial_collection_threshold);

    unsafe {
        // Thread object, in the level's first chunk.
        let thread_total = NORMAL_METADATA_SIZE + THREAD_OBJECT_BYTES;
        let chunk = (*hh).extend(&pool, level, thread_total)?;
        let p = (*chunk).frontier();
        (*chunk).set_frontier(p.add(thread_total));
        std::ptr::write_bytes(p, 0, thread_total);
        let thread_op = ObjPtr::from_addr(p as usize + NORMAL_METADATA_SIZE);
        set_header(thread_op, GcThread::header());

        // Stack object, in its own single-object chunk.
        let stack_reserved = crate::heap::align_up(stack_reserved.max(256), 8);
        let stack_total = STACK_METADATA_SIZE + STACK_STRUCT_SIZE + stack_reserved;
        let list = (*hh).ensure_level(level);
        let stack_chunk = allocate_chunk(list, &pool, stack_total)?;
        (*stack_chunk).set_single_object();
        (*hh).note_allocated((*stack_chunk).capacity());
        let sp = (*stack_chunk).frontier();
        (*stack_chunk).set_frontier(sp.add(stack_total));
        std::ptr::write_bytes(sp, 0, stack_total);
        let stack_op = ObjPtr::from_addr(sp as usize + STACK_METADATA_SIZE);
        set_header(stack_op, Header::object(ObjectTag::Stack, 0, 0));
        let stack = GcStack::from_objptr(stack_op);
        (*stack).reserved = stack_reserved as u64;
        (*stack).used = 0;

        // The stack chunk cannot take the frontier; append a fresh one.
        (*hh).extend(&pool, level, HEAP_LIMIT_SLOP)?;

        let thread = GcThread::from_objptr(thread_op);
        (*thread).current_depth = level as u64;
        (*thread).bytes_needed = 0;
        (*thread).bytes_survived_last_collection = 0;
        (*thread).exn_stack = 0;
        (*thread).hierarchical_heap = hh;
        (*thread).stack = stack_op;

        Ok(thread_op)
    }
}

/// Make `thread_op` the worker's current thread and load its mutator state.
pub fn switch_to_thread(worker: &mut Worker, thread_op: ObjPtr) -> Result<(), GcError> {
    worker.exit_local_heap();
    unsafe {
        worker.current_thread = thread_op;
        let thread = GcThread::from_objptr(thread_op);
        let stack = GcStack::from_objptr((*thread).stack);
        worker.stack_top = (*stack).top();
        worker.exn_stack = (*thread).exn_stack;
    }
    worker.enter_local_heap()
}

/// Build and switch to a fresh thread at `level`.
pub fn init_thread_and_heap(worker: &mut Worker, level: u32) -> Result<ObjPtr, GcError> {
    let reserved = worker.config().initial_stack_reserved;
    let thread_op = new_thread_with_heap(worker, reserved, level)?;
    switch_to_thread(worker, thread_op)?;
    Ok(thread_op)
}

/// One-time per-process setup: depth-0 thread, initial vectors, globals,
/// first collection threshold.
pub fn init_world(worker: &mut Worker, vector_inits: &[VectorInit<'_>]) -> Result<(), GcError> {
    let num_globals = vector_inits
        .iter()
        .map(|init| init.global_index + 1)
        .max()
        .unwrap_or(0);
    worker.globals = vec![ObjPtr::BOGUS; num_globals];

    init_thread_and_heap(worker, 0)?;
    init_vectors(worker, vector_inits)?;

    unsafe {
        let hh = (*worker.thread_ptr()).hierarchical_heap;
        let threshold =
            HierarchicalHeap::next_collection_threshold(worker.config(), (*hh).size());
        (*hh).set_collection_threshold(threshold);
    }
    log::debug!(
        "world initialized: {} globals, {} vector inits",
        num_globals,
        vector_inits.len()
    );
    Ok(())
}

/// Copy the initial vectors into depth-0 sequences and point the globals at
/// them.
fn init_vectors(worker: &mut Worker, vector_inits: &[VectorInit<'_>]) -> Result<(), GcError> {
    for init in vector_inits {
        if !matches!(init.element_size, 1 | 2 | 4 | 8) {
            return Err(GcError::InvariantViolated("vector init element size"));
        }
        if init.data.len() % init.element_size != 0 {
            return Err(GcError::InvariantViolated("vector init length"));
        }
        let length = (init.data.len() / init.element_size) as u64;
        let op = worker.alloc_sequence(length, init.element_size as u32, 0)?;
        unsafe {
            std::ptr::copy_nonoverlapping(init.data.as_ptr(), op.as_ptr(), init.data.len());
        }
        worker.set_global(init.global_index, op);
    }
    Ok(())
}

/// Per-worker fork of the world: an empty depth-1 thread plus carried-over
/// sizing statistics.
pub fn duplicate_world(dst: &mut Worker, src: &Worker) -> Result<(), GcError> {
    init_thread_and_heap(dst, 1)?;
    unsafe {
        let hh = (*dst.thread_ptr()).hierarchical_heap;
        let threshold =
            HierarchicalHeap::next_collection_threshold(dst.config(), (*hh).size());
        (*hh).set_collection_threshold(threshold);
    }
    let max = src
        .stats()
        .max_heap_size
        .load(std::sync::atomic::Ordering::Relaxed);
    dst.stats()
        .max_heap_size
        .fetch_max(max, std::sync::atomic::Ordering::Relaxed);
    Ok(())
}
