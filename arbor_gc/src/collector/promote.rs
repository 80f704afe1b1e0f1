//! Deferred promotion.
//!
//! Before copying begins, every level's remembered set is walked so that
//! edges crossing the collection window stop depending on from-space:
//!
//! - A level *below* the window keeps its remembered set, but any entry
//!   whose holder sits inside the window gets the holder forwarded now (the
//!   surviving entry would otherwise dangle) and the edge recorded as a
//!   root.
//! - A level *inside* the window gives up its remembered set. Entries whose
//!   holder lies outside the window are the real promotion roots: the
//!   pointee must survive even though nothing in the window references it.
//!   Entries with both ends inside the window are deferred; the driver
//!   re-remembers them after the trace for every holder that survived, so a
//!   remembered edge never keeps its holder alive on its own.

use smallvec::SmallVec;

use crate::barrier::{for_each_remembered, remember, RememberedEntry};
use crate::collector::{forward, ForwardArgs};
use crate::error::GcError;
use crate::heap::{release_list, Chunk, ChunkList, HierarchicalHeap};
use crate::object::{chase_fwd_ptr, ObjPtr};

/// What promotion hands back to the driver.
pub struct PromotionOutcome {
    /// Edges to process as roots (a plain chunk list of triples).
    pub global_down_ptrs: *mut ChunkList,
    /// In-window edges to re-remember after the trace.
    pub deferred: SmallVec<[RememberedEntry; 16]>,
}

/// Walk every remembered set in `[0, max_level]` and lift cross-window
/// edges, per the module description.
///
/// # Safety
/// Must run at the start of a collection, before any roots are forwarded;
/// `hh` must be the collecting worker's heap.
pub unsafe fn deferred_promote(
    hh: *mut HierarchicalHeap,
    args: &mut ForwardArgs,
) -> Result<PromotionOutcome, GcError> {
    let global = ChunkList::new_plain();
    let mut deferred: SmallVec<[RememberedEntry; 16]> = SmallVec::new();

    for depth in 0..=args.max_level {
        let level = (*hh).level(depth);
        if level.is_null() {
            continue;
        }
        let rs = (*level).remembered_set();
        if rs.is_null() {
            continue;
        }
        (*level).set_remembered_set(std::ptr::null_mut());

        let mut entries: Vec<RememberedEntry> = Vec::new();
        for_each_remembered(rs, |e| entries.push(e));

        if depth < args.min_level {
            // This level survives; rebuild its remembered set.
            let keep = ChunkList::new_plain();
            for entry in entries {
                let holder = chase_fwd_ptr(entry.holder);
                let holder_level = level_of(holder);
                if holder_level >= args.min_level && holder_level <= args.max_level {
                    let mut slot = holder;
                    forward(args, &mut slot as *mut ObjPtr)?;
                    let moved = RememberedEntry {
                        holder: slot,
                        field: rebase_field(entry.field, entry.holder, slot),
                        pointee: entry.pointee,
                    };
                    remember(keep, args.pool, moved)?;
                    remember(global, args.pool, moved)?;
                } else {
                    let kept = RememberedEntry {
                        holder,
                        field: rebase_field(entry.field, entry.holder, holder),
                        pointee: entry.pointee,
                    };
                    remember(keep, args.pool, kept)?;
                }
            }
            (*level).set_remembered_set(keep);
        } else {
            // This level is being collected.
            for entry in entries {
                let holder = chase_fwd_ptr(entry.holder);
                let holder_level = level_of(holder);
                if holder_level >= args.min_level && holder_level <= args.max_level {
                    deferred.push(entry);
                } else {
                    // External holder: the pointee is a root of this window.
                    remember(
                        global,
                        args.pool,
                        RememberedEntry {
                            holder,
                            field: rebase_field(entry.field, entry.holder, holder),
                            pointee: entry.pointee,
                        },
                    )?;
                }
            }
        }
        release_list(args.pool, rs);
    }

    log::debug!(
        "promotion: {} root edges, {} deferred in-window edges",
        crate::barrier::num_remembered(global),
        deferred.len()
    );
    Ok(PromotionOutcome {
        global_down_ptrs: global,
        deferred,
    })
}

/// Depth of the level holding `op`.
unsafe fn level_of(op: ObjPtr) -> u32 {
    let head = (*Chunk::of(op)).level_head();
    debug_assert!(!head.is_null());
    (*head).depth()
}

/// The address `field` had inside `old` has inside `new`.
fn rebase_field(field: *mut ObjPtr, old: ObjPtr, new: ObjPtr) -> *mut ObjPtr {
    let offset = field as usize - old.raw() as usize;
    (new.raw() as usize + offset) as *mut ObjPtr
}
