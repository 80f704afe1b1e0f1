//! Heap memory management.
//!
//! The heap is one block-aligned region carved into fixed-size blocks.
//! Chunks group contiguous blocks; chunk lists group chunks by depth; the
//! hierarchical heap is a worker's array of chunk lists indexed by depth.

mod block;
mod chunk;
mod hierarchical;

pub use block::ChunkPool;
pub use chunk::{
    allocate_chunk, append_chunk, append_list, release_list, unlink_chunk, Chunk, ChunkList,
    CHUNK_HEADER_SIZE, CHUNK_MAGIC, NO_DEPTH,
};
pub use hierarchical::{HierarchicalHeap, MAX_DEPTH};

pub(crate) use chunk::copy_space_owner;

/// Fixed block size; every in-heap pointer's chunk is found by masking with
/// this granule.
pub const BLOCK_SIZE: usize = 4096;

/// Slop between `limit` and `limit_plus_slop` in the mutator frontier cache.
/// Small allocations only check `limit`, so the slop must cover the largest
/// "unchecked" allocation the runtime emits.
pub const HEAP_LIMIT_SLOP: usize = 512;

/// Object alignment; also the alignment of every chunk frontier.
pub const OBJECT_ALIGN: usize = 8;

/// Align a size up to the given power-of-two alignment.
#[inline]
pub const fn align_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

/// Start of the block containing `addr`.
#[inline]
pub fn block_of(addr: usize) -> usize {
    addr & !(BLOCK_SIZE - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_basics() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(9, 8), 16);
    }

    #[test]
    fn block_masking() {
        assert_eq!(block_of(0x1_2345), 0x1_2000);
        assert_eq!(block_of(0x1_2000), 0x1_2000);
        assert_eq!(block_of(0x1_2fff), 0x1_2000);
    }
}
