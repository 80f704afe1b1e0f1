//! Local copying collection.
//!
//! Three pieces: the forwarding engine ([`forward`]), the deferred-promotion
//! pass that lifts cross-window remembered edges ([`promote`]), and the
//! driver that orchestrates a collection ([`local`]).

mod forward;
mod local;
mod promote;

pub use forward::{ensure_to_space, forward, forward_down_ptr, forward_object_fields};
pub use local::collect_local;
pub use promote::{deferred_promote, PromotionOutcome};

use crate::heap::{ChunkList, ChunkPool, MAX_DEPTH};
use crate::object::ObjPtr;

/// State threaded through every forwarding call of one collection.
pub struct ForwardArgs<'a> {
    /// The block pool backing every chunk involved.
    pub pool: &'a ChunkPool,
    /// Lowest depth being collected.
    pub min_level: u32,
    /// Highest depth being collected (the thread's current depth).
    pub max_level: u32,
    /// Copy destinations, one per depth, created on demand.
    pub to_space: [*mut ChunkList; MAX_DEPTH],
    /// Whether the deferred-promotion pass is running.
    pub in_promotion: bool,
    /// The worker's current stack, which gets a gentler shrink policy.
    pub current_stack: ObjPtr,
    /// Floor for stack shrinking (the configured initial reserve).
    pub stack_reserve_floor: usize,
    /// Bytes physically copied, metadata included.
    pub bytes_copied: u64,
    /// Bytes logically moved via chunk relinking, metadata included.
    pub bytes_moved: u64,
    /// Objects copied.
    pub objects_copied: u64,
    /// Objects moved.
    pub objects_moved: u64,
    /// Stack objects encountered (copied or moved).
    pub stacks_copied: u64,
}

impl<'a> ForwardArgs<'a> {
    /// Fresh state for one collection over `[min_level, max_level]`.
    pub fn new(
        pool: &'a ChunkPool,
        min_level: u32,
        max_level: u32,
        current_stack: ObjPtr,
        stack_reserve_floor: usize,
    ) -> Self {
        Self {
            pool,
            min_level,
            max_level,
            to_space: [std::ptr::null_mut(); MAX_DEPTH],
            in_promotion: false,
            current_stack,
            stack_reserve_floor,
            bytes_copied: 0,
            bytes_moved: 0,
            objects_copied: 0,
            objects_moved: 0,
            stacks_copied: 0,
        }
    }
}
