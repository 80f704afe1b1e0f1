//! Chunks and chunk lists.
//!
//! A chunk is one or more contiguous blocks managed as a unit, with its
//! header written in place at the block-aligned start. Because every object
//! begins inside its chunk's first block, masking an object pointer with the
//! block size lands on the chunk header.
//!
//! A chunk list is a doubly-linked sequence of chunks. A *level-head* list
//! additionally knows its depth, its owning hierarchical heap (or the
//! copy-space sentinel during collection), whether it is to-space, and an
//! optional remembered set (itself a plain chunk list of down-pointer
//! records).

use std::ptr::NonNull;

use crate::error::GcError;
use crate::heap::block::ChunkPool;
use crate::heap::hierarchical::HierarchicalHeap;
use crate::heap::{align_up, block_of, BLOCK_SIZE, OBJECT_ALIGN};
use crate::object::ObjPtr;

/// Tag word checked on every debug-mode chunk lookup.
pub const CHUNK_MAGIC: u64 = 0xC4A2_51AB_0D5E_F00D;

/// Depth value of plain (non-level-head) lists.
pub const NO_DEPTH: u32 = u32::MAX;

/// Sentinel owner of to-space lists while a collection is running.
#[inline]
pub(crate) fn copy_space_owner() -> *mut HierarchicalHeap {
    usize::MAX as *mut HierarchicalHeap
}

/// In-place chunk header. Lives at the chunk's block-aligned start; the
/// payload follows immediately after.
#[repr(C)]
pub struct Chunk {
    magic: u64,
    frontier: *mut u8,
    limit: *mut u8,
    prev: *mut Chunk,
    next: *mut Chunk,
    level_head: *mut ChunkList,
    nblocks: u32,
    might_contain_multiple_objects: bool,
}

/// Bytes reserved for the header at the start of every chunk.
pub const CHUNK_HEADER_SIZE: usize = align_up(std::mem::size_of::<Chunk>(), OBJECT_ALIGN);

impl Chunk {
    /// The chunk containing an object pointer.
    ///
    /// Valid for object *starts* only: every object begins inside its
    /// chunk's first block, so one mask suffices.
    #[inline]
    pub fn of(op: ObjPtr) -> *mut Chunk {
        block_of(op.raw() as usize) as *mut Chunk
    }

    /// Start of the payload area.
    #[inline]
    pub fn start(&self) -> *mut u8 {
        unsafe { (self as *const Chunk as *mut u8).add(CHUNK_HEADER_SIZE) }
    }

    /// Next free payload byte.
    #[inline]
    pub fn frontier(&self) -> *mut u8 {
        self.frontier
    }

    /// Advance the frontier after carving an object.
    #[inline]
    pub fn set_frontier(&mut self, frontier: *mut u8) {
        debug_assert!(frontier >= self.start() && frontier <= self.limit);
        self.frontier = frontier;
    }

    /// One past the last payload byte.
    #[inline]
    pub fn limit(&self) -> *mut u8 {
        self.limit
    }

    /// End of the chunk's first block. The mutator frontier never crosses
    /// this; objects carved past it would break pointer masking.
    #[inline]
    pub fn first_block_end(&self) -> *mut u8 {
        unsafe { (self as *const Chunk as *mut u8).add(BLOCK_SIZE) }
    }

    /// Payload capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.limit as usize - self.start() as usize
    }

    /// Payload bytes in use.
    #[inline]
    pub fn used(&self) -> usize {
        self.frontier as usize - self.start() as usize
    }

    /// False for chunks dedicated to a single large object (or a stack).
    #[inline]
    pub fn might_contain_multiple_objects(&self) -> bool {
        self.might_contain_multiple_objects
    }

    /// Dedicate this chunk to the single object it holds.
    #[inline]
    pub fn set_single_object(&mut self) {
        self.might_contain_multiple_objects = false;
    }

    /// Blocks spanned by this chunk.
    #[inline]
    pub fn nblocks(&self) -> usize {
        self.nblocks as usize
    }

    /// The list this chunk is linked into.
    #[inline]
    pub fn level_head(&self) -> *mut ChunkList {
        self.level_head
    }

    /// Next chunk in the list.
    #[inline]
    pub fn next(&self) -> *mut Chunk {
        self.next
    }

    /// Whether the chunk header looks intact.
    #[inline]
    pub fn magic_ok(&self) -> bool {
        self.magic == CHUNK_MAGIC
    }
}

/// An ordered sequence of chunks, optionally acting as a level head.
pub struct ChunkList {
    first: *mut Chunk,
    last: *mut Chunk,
    depth: u32,
    is_in_to_space: bool,
    owner: *mut HierarchicalHeap,
    remembered_set: *mut ChunkList,
    capacity: usize,
}

impl ChunkList {
    /// Allocate a level-head list for `depth`, owned by `owner`.
    pub fn new_level(depth: u32, owner: *mut HierarchicalHeap) -> *mut ChunkList {
        Box::into_raw(Box::new(ChunkList {
            first: std::ptr::null_mut(),
            last: std::ptr::null_mut(),
            depth,
            is_in_to_space: false,
            owner,
            remembered_set: std::ptr::null_mut(),
            capacity: 0,
        }))
    }

    /// Allocate a plain list (free-list segment, remembered set, root buffer).
    pub fn new_plain() -> *mut ChunkList {
        Self::new_level(NO_DEPTH, std::ptr::null_mut())
    }

    /// Depth of this level, or [`NO_DEPTH`] for plain lists.
    #[inline]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Whether this list is a collection's copy destination.
    #[inline]
    pub fn is_in_to_space(&self) -> bool {
        self.is_in_to_space
    }

    /// Mark or clear to-space status.
    #[inline]
    pub fn set_in_to_space(&mut self, value: bool) {
        self.is_in_to_space = value;
    }

    /// Owning hierarchical heap (null for plain lists, sentinel during copy).
    #[inline]
    pub fn owner(&self) -> *mut HierarchicalHeap {
        self.owner
    }

    /// Install the owning hierarchical heap.
    #[inline]
    pub fn set_owner(&mut self, owner: *mut HierarchicalHeap) {
        self.owner = owner;
    }

    /// This level's remembered set, if any.
    #[inline]
    pub fn remembered_set(&self) -> *mut ChunkList {
        self.remembered_set
    }

    /// Replace the remembered set pointer.
    #[inline]
    pub fn set_remembered_set(&mut self, rs: *mut ChunkList) {
        self.remembered_set = rs;
    }

    /// First chunk, or null.
    #[inline]
    pub fn first(&self) -> *mut Chunk {
        self.first
    }

    /// Last chunk, or null.
    #[inline]
    pub fn last(&self) -> *mut Chunk {
        self.last
    }

    /// Whether the list holds no chunks.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.first.is_null()
    }

    /// Total payload capacity of the chunks in this list.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Payload bytes in use across the list.
    pub fn used_bytes(&self) -> usize {
        let mut total = 0;
        let mut chunk = self.first;
        while !chunk.is_null() {
            unsafe {
                total += (*chunk).used();
                chunk = (*chunk).next;
            }
        }
        total
    }

    /// Number of chunks in the list.
    pub fn num_chunks(&self) -> usize {
        let mut count = 0;
        let mut chunk = self.first;
        while !chunk.is_null() {
            count += 1;
            chunk = unsafe { (*chunk).next };
        }
        count
    }
}

/// Carve a fresh chunk covering `min_bytes` of payload and append it.
///
/// The chunk spans as many blocks as the payload plus header need; it is
/// dedicated to a single object (`might_contain_multiple_objects == false`)
/// exactly when that is more than one block.
pub unsafe fn allocate_chunk(
    list: *mut ChunkList,
    pool: &ChunkPool,
    min_bytes: usize,
) -> Result<*mut Chunk, GcError> {
    let total = CHUNK_HEADER_SIZE + align_up(min_bytes, OBJECT_ALIGN);
    let nblocks = total.div_ceil(BLOCK_SIZE);
    let span = pool.allocate_span(nblocks)?;

    let chunk = span.as_ptr() as *mut Chunk;
    let start = span.as_ptr().add(CHUNK_HEADER_SIZE);
    let limit = span.as_ptr().add(nblocks * BLOCK_SIZE);
    chunk.write(Chunk {
        magic: CHUNK_MAGIC,
        frontier: start,
        limit,
        prev: std::ptr::null_mut(),
        next: std::ptr::null_mut(),
        level_head: std::ptr::null_mut(),
        nblocks: nblocks as u32,
        might_contain_multiple_objects: nblocks == 1,
    });

    append_chunk(list, chunk);
    Ok(chunk)
}

/// Link `chunk` at the tail of `list`.
pub unsafe fn append_chunk(list: *mut ChunkList, chunk: *mut Chunk) {
    debug_assert!((*chunk).prev.is_null() && (*chunk).next.is_null());
    (*chunk).level_head = list;
    if (*list).last.is_null() {
        (*list).first = chunk;
    } else {
        (*(*list).last).next = chunk;
        (*chunk).prev = (*list).last;
    }
    (*list).last = chunk;
    (*list).capacity += (*chunk).capacity();
}

/// Remove `chunk` from whatever list owns it, leaving its payload untouched.
pub unsafe fn unlink_chunk(chunk: *mut Chunk) {
    let list = (*chunk).level_head;
    debug_assert!(!list.is_null());

    if (*chunk).prev.is_null() {
        (*list).first = (*chunk).next;
    } else {
        (*(*chunk).prev).next = (*chunk).next;
    }
    if (*chunk).next.is_null() {
        (*list).last = (*chunk).prev;
    } else {
        (*(*chunk).next).prev = (*chunk).prev;
    }
    (*list).capacity -= (*chunk).capacity();
    (*chunk).prev = std::ptr::null_mut();
    (*chunk).next = std::ptr::null_mut();
    (*chunk).level_head = std::ptr::null_mut();
}

/// Move every chunk of `src` to the tail of `dst`, in order, and free the
/// `src` head. The splice itself is O(1); retargeting the chunks' back-links
/// walks `src` once.
pub unsafe fn append_list(dst: *mut ChunkList, src: *mut ChunkList) {
    debug_assert!(dst != src);
    let mut chunk = (*src).first;
    while !chunk.is_null() {
        (*chunk).level_head = dst;
        chunk = (*chunk).next;
    }

    if !(*src).first.is_null() {
        if (*dst).last.is_null() {
            (*dst).first = (*src).first;
        } else {
            (*(*dst).last).next = (*src).first;
            (*(*src).first).prev = (*dst).last;
        }
        (*dst).last = (*src).last;
        (*dst).capacity += (*src).capacity;
    }
    debug_assert!((*src).remembered_set.is_null());
    drop(Box::from_raw(src));
}

/// Return every chunk of `list` (and of its remembered set) to the pool,
/// then free the list head.
pub unsafe fn release_list(pool: &ChunkPool, list: *mut ChunkList) {
    let rs = (*list).remembered_set;
    if !rs.is_null() {
        (*list).remembered_set = std::ptr::null_mut();
        release_list(pool, rs);
    }

    let mut chunk = (*list).first;
    while !chunk.is_null() {
        let next = (*chunk).next;
        let nblocks = (*chunk).nblocks();
        pool.release_span(NonNull::new_unchecked(chunk as *mut u8), nblocks);
        chunk = next;
    }
    drop(Box::from_raw(list));
}

// Safety: lists are confined to their owning worker; the collector touches
// them only inside a claimed scope.
unsafe impl Send for ChunkList {}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> ChunkPool {
        ChunkPool::new(64 * BLOCK_SIZE).unwrap()
    }

    #[test]
    fn small_chunk_is_one_block_and_multi_object() {
        let pool = pool();
        let list = ChunkList::new_level(3, std::ptr::null_mut());
        unsafe {
            let chunk = allocate_chunk(list, &pool, 128).unwrap();
            assert!((*chunk).magic_ok());
            assert_eq!((*chunk).nblocks(), 1);
            assert!((*chunk).might_contain_multiple_objects());
            assert_eq!((*chunk).capacity(), BLOCK_SIZE - CHUNK_HEADER_SIZE);
            assert_eq!((*chunk).used(), 0);
            assert_eq!((*chunk).level_head(), list);
            assert_eq!((*list).capacity(), (*chunk).capacity());
            release_list(&pool, list);
        }
    }

    #[test]
    fn oversized_chunk_is_dedicated() {
        let pool = pool();
        let list = ChunkList::new_plain();
        unsafe {
            let chunk = allocate_chunk(list, &pool, 3 * BLOCK_SIZE).unwrap();
            assert_eq!((*chunk).nblocks(), 4);
            assert!(!(*chunk).might_contain_multiple_objects());
            release_list(&pool, list);
        }
    }

    #[test]
    fn chunk_of_masks_to_header() {
        let pool = pool();
        let list = ChunkList::new_plain();
        unsafe {
            let chunk = allocate_chunk(list, &pool, 64).unwrap();
            let inside = ObjPtr::from_addr((*chunk).start() as usize + 40);
            assert_eq!(Chunk::of(inside), chunk);
            release_list(&pool, list);
        }
    }

    #[test]
    fn unlink_middle_chunk() {
        let pool = pool();
        let list = ChunkList::new_plain();
        unsafe {
            let a = allocate_chunk(list, &pool, 64).unwrap();
            let b = allocate_chunk(list, &pool, 64).unwrap();
            let c = allocate_chunk(list, &pool, 64).unwrap();
            assert_eq!((*list).num_chunks(), 3);

            unlink_chunk(b);
            assert_eq!((*list).num_chunks(), 2);
            assert_eq!((*list).first(), a);
            assert_eq!((*list).last(), c);
            assert_eq!((*a).next(), c);
            assert!((*b).level_head().is_null());

            pool.release_span(NonNull::new_unchecked(b as *mut u8), 1);
            release_list(&pool, list);
        }
    }

    #[test]
    fn append_list_moves_chunks_in_order() {
        let pool = pool();
        let dst = ChunkList::new_level(1, std::ptr::null_mut());
        let src = ChunkList::new_level(1, std::ptr::null_mut());
        unsafe {
            let a = allocate_chunk(dst, &pool, 64).unwrap();
            let b = allocate_chunk(src, &pool, 64).unwrap();
            let c = allocate_chunk(src, &pool, 64).unwrap();

            append_list(dst, src);
            assert_eq!((*dst).num_chunks(), 3);
            assert_eq!((*dst).first(), a);
            assert_eq!((*a).next(), b);
            assert_eq!((*b).next(), c);
            assert_eq!((*b).level_head(), dst);
            assert_eq!((*c).level_head(), dst);
            release_list(&pool, dst);
        }
    }
}
