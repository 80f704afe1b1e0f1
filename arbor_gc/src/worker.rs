//! Per-worker mutator state and the allocation paths.
//!
//! A [`Worker`] is the explicit `GC_state`: the frontier/limit triple the
//! compiled code bumps through, the current thread, the saved stack-top and
//! exception cursors, and handles to the deque, pool, configuration and
//! statistics. Nothing here is a process singleton; every public entry point
//! takes the worker.

use std::sync::Arc;

use dashmap::DashMap;

use arbor_sched::Deque;

use crate::barrier;
use crate::collector::collect_local;
use crate::config::HhConfig;
use crate::error::GcError;
use crate::heap::{align_up, allocate_chunk, Chunk, ChunkPool, HEAP_LIMIT_SLOP};
use crate::invariant;
use crate::object::{
    grow_reserved, set_header, set_sequence_metadata, GcStack, GcThread, Header, ObjPtr,
    ObjectTag, NORMAL_METADATA_SIZE, SEQUENCE_METADATA_SIZE, STACK_METADATA_SIZE,
    STACK_STRUCT_SIZE,
};
use crate::stats::GcStats;

/// Published deque handles, so thieves can find their victims.
#[derive(Default)]
pub struct DequeRegistry {
    map: DashMap<usize, Arc<Deque>>,
}

impl DequeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `deque` as worker `worker_id`'s.
    pub fn register(&self, worker_id: usize, deque: Arc<Deque>) {
        self.map.insert(worker_id, deque);
    }

    /// Look up a worker's deque.
    pub fn get(&self, worker_id: usize) -> Option<Arc<Deque>> {
        self.map.get(&worker_id).map(|entry| Arc::clone(&entry))
    }

    /// Remove a worker's deque on shutdown.
    pub fn unregister(&self, worker_id: usize) {
        self.map.remove(&worker_id);
    }
}

/// One OS thread's view of the runtime.
pub struct Worker {
    // Mutator frontier cache, mirroring the current chunk.
    pub(crate) frontier: *mut u8,
    pub(crate) limit: *mut u8,
    pub(crate) limit_plus_slop: *mut u8,

    // Mutator registers flushed at collection entry.
    pub(crate) current_thread: ObjPtr,
    pub(crate) stack_top: *mut u8,
    pub(crate) exn_stack: u64,

    pub(crate) deque: Option<Arc<Deque>>,
    pub(crate) pool: Arc<ChunkPool>,
    pub(crate) config: HhConfig,
    pub(crate) stats: Arc<GcStats>,
    pub(crate) registry: Arc<DequeRegistry>,
    pub(crate) globals: Vec<ObjPtr>,
    worker_id: usize,
}

impl Worker {
    /// Create a worker over a (usually shared) pool.
    pub fn new(
        worker_id: usize,
        pool: Arc<ChunkPool>,
        config: HhConfig,
        stats: Arc<GcStats>,
        registry: Arc<DequeRegistry>,
    ) -> Self {
        config
            .validate()
            .expect("invalid hierarchical heap configuration");
        Self {
            frontier: std::ptr::null_mut(),
            limit: std::ptr::null_mut(),
            limit_plus_slop: std::ptr::null_mut(),
            current_thread: ObjPtr::BOGUS,
            stack_top: std::ptr::null_mut(),
            exn_stack: 0,
            deque: None,
            pool,
            config,
            stats,
            registry,
            globals: Vec::new(),
            worker_id,
        }
    }

    /// This worker's id.
    #[inline]
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// The shared block pool.
    #[inline]
    pub fn pool(&self) -> &Arc<ChunkPool> {
        &self.pool
    }

    /// The worker's configuration.
    #[inline]
    pub fn config(&self) -> &HhConfig {
        &self.config
    }

    /// Shared collection statistics.
    #[inline]
    pub fn stats(&self) -> &Arc<GcStats> {
        &self.stats
    }

    /// Publish `deque` as this worker's and keep the handle.
    pub fn register_deque(&mut self, deque: Arc<Deque>) {
        self.registry.register(self.worker_id, Arc::clone(&deque));
        self.deque = Some(deque);
    }

    /// This worker's deque, once registered.
    #[inline]
    pub fn deque(&self) -> Option<&Arc<Deque>> {
        self.deque.as_ref()
    }

    /// Push a fork task onto this worker's deque.
    ///
    /// A full deque means the program exceeded the maximum fork depth, which
    /// is fatal at the runtime boundary.
    pub fn push_task(&mut self, task: ObjPtr) -> Result<(), GcError> {
        let Some(deque) = self.deque.as_ref() else {
            return Err(GcError::InvariantViolated("deque not registered"));
        };
        if !deque.push_bot(task.raw()) {
            return Err(GcError::ForkDepthExceeded);
        }
        Ok(())
    }

    /// The current thread object.
    #[inline]
    pub fn current_thread(&self) -> ObjPtr {
        self.current_thread
    }

    /// Raw pointer to the current thread.
    ///
    /// # Safety
    /// A thread must be current (after world init).
    #[inline]
    pub unsafe fn thread_ptr(&self) -> *mut GcThread {
        debug_assert!(self.current_thread.is_objptr());
        GcThread::from_objptr(self.current_thread)
    }

    /// The current fork depth.
    pub fn current_depth(&self) -> u32 {
        unsafe { (*self.thread_ptr()).current_depth as u32 }
    }

    /// Move the thread to a new fork depth (scheduler fork/join edge).
    pub fn set_current_depth(&mut self, depth: u32) {
        unsafe {
            (*self.thread_ptr()).current_depth = depth as u64;
        }
    }

    /// Read a global root.
    pub fn global(&self, index: usize) -> ObjPtr {
        self.globals.get(index).copied().unwrap_or(ObjPtr::BOGUS)
    }

    /// Install a global root.
    pub fn set_global(&mut self, index: usize, value: ObjPtr) {
        if self.globals.len() <= index {
            self.globals.resize(index + 1, ObjPtr::BOGUS);
        }
        self.globals[index] = value;
    }

    // =========================================================================
    // Frontier cache
    // =========================================================================

    /// Load the frontier triple from the heap's current chunk, growing the
    /// heap if it has none yet.
    pub fn enter_local_heap(&mut self) -> Result<(), GcError> {
        let thread = unsafe { self.thread_ptr() };
        let hh = unsafe { (*thread).hierarchical_heap };
        unsafe {
            if (*hh).last_allocated_chunk().is_null() {
                let depth = (*thread).current_depth as u32;
                (*hh).extend(&self.pool, depth, HEAP_LIMIT_SLOP)?;
            }
            let chunk = (*hh).last_allocated_chunk();
            self.frontier = (*chunk).frontier();
            self.limit_plus_slop = (*chunk).limit();
            self.limit = self.limit_plus_slop.sub(HEAP_LIMIT_SLOP);
        }
        Ok(())
    }

    /// Store the cached frontier back into the heap's current chunk.
    pub fn exit_local_heap(&mut self) {
        if self.frontier.is_null() || !self.current_thread.is_objptr() {
            return;
        }
        unsafe {
            let hh = (*self.thread_ptr()).hierarchical_heap;
            let chunk = (*hh).last_allocated_chunk();
            if !chunk.is_null() {
                (*chunk).set_frontier(self.frontier);
            }
        }
    }

    /// Refresh the triple after a collection (the chunk may be gone).
    pub(crate) fn reload_frontier(&mut self) {
        unsafe {
            let hh = (*self.thread_ptr()).hierarchical_heap;
            let chunk = (*hh).last_allocated_chunk();
            if chunk.is_null() {
                self.frontier = std::ptr::null_mut();
                self.limit = std::ptr::null_mut();
                self.limit_plus_slop = std::ptr::null_mut();
            } else {
                self.frontier = (*chunk).frontier();
                self.limit_plus_slop = (*chunk).limit();
                self.limit = self.limit_plus_slop.sub(HEAP_LIMIT_SLOP);
            }
        }
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Bump-allocate `bytes` (rounded to words) of raw object memory.
    ///
    /// The fast path is one compare against `limit`; the slow path runs
    /// [`Worker::gc_if_needed`].
    pub fn allocate(&mut self, bytes: usize) -> Result<*mut u8, GcError> {
        let bytes = align_up(bytes.max(8), 8);
        self.stats.record_allocation(bytes);

        if self.frontier.is_null() || self.frontier.wrapping_add(bytes) > self.limit {
            self.gc_if_needed(bytes, false, false)?;
        }

        debug_assert!(self.frontier.wrapping_add(bytes) <= self.limit_plus_slop);
        let p = self.frontier;
        self.frontier = unsafe { self.frontier.add(bytes) };
        unsafe {
            (*self.thread_ptr()).bytes_needed = 0;
        }
        Ok(p)
    }

    /// Enforce the mutator invariants for an upcoming `bytes` allocation:
    /// grow the stack if it is full, collect when forced or over budget,
    /// then make sure the current chunk can hold `bytes` (at the current
    /// depth, if `ensure_current_depth`).
    pub fn gc_if_needed(
        &mut self,
        bytes: usize,
        force: bool,
        ensure_current_depth: bool,
    ) -> Result<(), GcError> {
        unsafe {
            let thread = self.thread_ptr();
            (*thread).bytes_needed = bytes as u64;

            let grow_stack = !invariant::mutator_stack_ok(self);

            self.exit_local_heap();
            if !self.frontier.is_null() && self.limit_plus_slop < self.frontier {
                return Err(GcError::InvariantViolated("limit_plus_slop < frontier"));
            }

            let hh = (*thread).hierarchical_heap;
            if force || (*hh).budget_exhausted() {
                // Claim as much scope as the deque allows; the driver applies
                // the configured collection level on top.
                collect_local(self, 1, force)?;
            }

            if grow_stack {
                self.grow_stack_current()?;
            }

            let thread = self.thread_ptr();
            let hh = (*thread).hierarchical_heap;
            let depth = (*thread).current_depth as u32;
            let last = (*hh).last_allocated_chunk();
            let needs_extend = last.is_null()
                || (ensure_current_depth && (*(*last).level_head()).depth() != depth)
                || (*last).frontier().add(SEQUENCE_METADATA_SIZE)
                    >= (*last).first_block_end()
                || ((*last).limit() as usize - (*last).frontier() as usize) < bytes
                || !(*last).might_contain_multiple_objects();
            if needs_extend {
                (*hh).extend(&self.pool, depth, bytes)?;
            }
            self.enter_local_heap()?;

            debug_assert!(invariant::mutator_frontier_ok(self));
            debug_assert!(invariant::mutator_stack_ok(self));
        }
        Ok(())
    }

    /// Allocate a normal object with zeroed fields.
    pub fn alloc_normal(&mut self, non_ptr_bytes: u32, num_ptrs: u32) -> Result<ObjPtr, GcError> {
        let object_bytes = align_up(non_ptr_bytes as usize + num_ptrs as usize * 8, 8);
        let p = self.allocate(NORMAL_METADATA_SIZE + object_bytes)?;
        unsafe {
            std::ptr::write_bytes(p, 0, NORMAL_METADATA_SIZE + object_bytes);
            let op = ObjPtr::from_addr(p as usize + NORMAL_METADATA_SIZE);
            set_header(op, Header::object(ObjectTag::Normal, non_ptr_bytes, num_ptrs));
            Ok(op)
        }
    }

    /// Allocate a sequence of `length` elements, fields zeroed. Sequences
    /// that outgrow a block get a dedicated single-object chunk.
    pub fn alloc_sequence(
        &mut self,
        length: u64,
        elem_non_ptr_bytes: u32,
        elem_num_ptrs: u32,
    ) -> Result<ObjPtr, GcError> {
        let stride = elem_non_ptr_bytes as usize + elem_num_ptrs as usize * 8;
        let object_bytes = align_up(stride * length as usize, 8).max(8);
        let total = SEQUENCE_METADATA_SIZE + object_bytes;

        let p = if total > crate::heap::BLOCK_SIZE - crate::heap::CHUNK_HEADER_SIZE {
            self.alloc_in_dedicated_chunk(total)?
        } else {
            self.allocate(total)?
        };

        unsafe {
            std::ptr::write_bytes(p, 0, total);
            let op = ObjPtr::from_addr(p as usize + SEQUENCE_METADATA_SIZE);
            set_sequence_metadata(op, length);
            set_header(
                op,
                Header::object(ObjectTag::Sequence, elem_non_ptr_bytes, elem_num_ptrs),
            );
            Ok(op)
        }
    }

    /// Allocate a stack object with `reserved` frame bytes in a dedicated
    /// chunk at `depth`.
    pub fn alloc_stack(&mut self, depth: u32, reserved: usize) -> Result<ObjPtr, GcError> {
        let reserved = align_up(reserved, 8);
        let total = STACK_METADATA_SIZE + STACK_STRUCT_SIZE + reserved;
        unsafe {
            self.exit_local_heap();
            let hh = (*self.thread_ptr()).hierarchical_heap;
            let list = (*hh).ensure_level(depth);
            let chunk = allocate_chunk(list, &self.pool, total)?;
            (*chunk).set_single_object();
            (*hh).note_allocated((*chunk).capacity());

            let p = (*chunk).frontier();
            (*chunk).set_frontier(p.add(total));
            std::ptr::write_bytes(p, 0, total);
            let op = ObjPtr::from_addr(p as usize + STACK_METADATA_SIZE);
            set_header(op, Header::object(ObjectTag::Stack, 0, 0));
            let stack = GcStack::from_objptr(op);
            (*stack).reserved = reserved as u64;
            (*stack).used = 0;
            Ok(op)
        }
    }

    /// Carve one oversized object into its own chunk, leaving the mutator
    /// frontier where it was.
    fn alloc_in_dedicated_chunk(&mut self, total: usize) -> Result<*mut u8, GcError> {
        self.stats.record_allocation(total);
        unsafe {
            self.exit_local_heap();
            let thread = self.thread_ptr();
            let hh = (*thread).hierarchical_heap;
            let depth = (*thread).current_depth as u32;
            let list = (*hh).ensure_level(depth);
            let chunk = allocate_chunk(list, &self.pool, total)?;
            debug_assert!(!(*chunk).might_contain_multiple_objects());
            (*hh).note_allocated((*chunk).capacity());

            let p = (*chunk).frontier();
            (*chunk).set_frontier(p.add(total));
            Ok(p)
        }
    }

    // =========================================================================
    // Stack mutation
    // =========================================================================

    /// Push a word onto the current stack, growing it when full.
    pub fn stack_push(&mut self, word: u64) -> Result<(), GcError> {
        unsafe {
            let stack = GcStack::from_objptr((*self.thread_ptr()).stack);
            if self.stack_top.add(8) > (*stack).frames_limit() {
                self.gc_if_needed(0, false, false)?;
            }
            (self.stack_top as *mut u64).write(word);
            self.stack_top = self.stack_top.add(8);
        }
        Ok(())
    }

    /// Pop a word off the current stack.
    pub fn stack_pop(&mut self) -> u64 {
        unsafe {
            debug_assert!({
                let stack = GcStack::from_objptr((*self.thread_ptr()).stack);
                self.stack_top > (*stack).frames_start()
            });
            self.stack_top = self.stack_top.sub(8);
            (self.stack_top as *const u64).read()
        }
    }

    /// Replace the current stack with one twice as large.
    fn grow_stack_current(&mut self) -> Result<(), GcError> {
        unsafe {
            let thread = self.thread_ptr();
            let depth = (*thread).current_depth as u32;
            let old_op = (*thread).stack;
            let old = GcStack::from_objptr(old_op);
            let used = self.stack_top as usize - (*old).frames_start() as usize;
            let new_reserved = grow_reserved(&*old).max(used * 2);

            log::debug!(
                "growing stack: {} used, {} -> {} reserved",
                used,
                (*old).reserved,
                new_reserved
            );

            let new_op = self.alloc_stack(depth, new_reserved)?;
            let new = GcStack::from_objptr(new_op);
            std::ptr::copy_nonoverlapping((*old).frames_start(), (*new).frames_start(), used);
            (*new).used = used as u64;

            let thread = self.thread_ptr();
            (*thread).stack = new_op;
            self.stack_top = (*new).frames_start().add(used);

            // The stack chunk is single-object; give the mutator a fresh
            // multi-object chunk to bump into.
            let hh = (*thread).hierarchical_heap;
            (*hh).extend(&self.pool, depth, HEAP_LIMIT_SLOP)?;
            self.enter_local_heap()?;
        }
        Ok(())
    }

    // =========================================================================
    // Write barrier
    // =========================================================================

    /// Store `value` into `field` of `holder`, remembering the edge when it
    /// crosses levels.
    ///
    /// # Safety
    /// `field` must be a pointer field inside `holder`.
    pub unsafe fn store_objptr_field(
        &mut self,
        holder: ObjPtr,
        field: *mut ObjPtr,
        value: ObjPtr,
    ) -> Result<(), GcError> {
        field.write(value);
        if !holder.is_objptr()
            || !value.is_objptr()
            || !self.pool.contains(holder.raw() as usize)
            || !self.pool.contains(value.raw() as usize)
        {
            return Ok(());
        }
        let holder_level = (*(*Chunk::of(holder)).level_head()).depth();
        let value_level = (*(*Chunk::of(value)).level_head()).depth();
        if holder_level != value_level {
            barrier::remember_down_ptr(&self.pool, holder, field, value)?;
        }
        Ok(())
    }
}

// Safety: a worker is moved to its OS thread once and then confined there;
// the shared handles it carries (pool, stats, registry, deques) synchronize
// internally.
unsafe impl Send for Worker {}
