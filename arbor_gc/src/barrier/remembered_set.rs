//! Chunk-backed remembered sets.
//!
//! A remembered set records cross-level pointers as `(holder, field,
//! pointee)` triples, kept at the *pointee's* level so a collection that
//! includes that level finds every external reference into it. The triples
//! live in chunk memory — a plain chunk list hanging off the level head —
//! and are released with their level like everything else.

use crate::error::GcError;
use crate::heap::{allocate_chunk, Chunk, ChunkList, ChunkPool, HEAP_LIMIT_SLOP};
use crate::object::ObjPtr;

/// One recorded cross-level edge: `holder.field == pointee`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RememberedEntry {
    /// The object containing the field.
    pub holder: ObjPtr,
    /// Address of the field inside `holder`.
    pub field: *mut ObjPtr,
    /// The object the field points at; its level owns this entry.
    pub pointee: ObjPtr,
}

const ENTRY_SIZE: usize = std::mem::size_of::<RememberedEntry>();

/// Append `entry` to the remembered set `list`.
///
/// # Safety
/// `list` must be a plain chunk list used only as a remembered set.
pub unsafe fn remember(
    list: *mut ChunkList,
    pool: &ChunkPool,
    entry: RememberedEntry,
) -> Result<(), GcError> {
    let mut chunk = (*list).last();
    let needs_chunk = chunk.is_null()
        || ((*chunk).limit() as usize - (*chunk).frontier() as usize) < ENTRY_SIZE;
    if needs_chunk {
        chunk = allocate_chunk(list, pool, HEAP_LIMIT_SLOP)?;
    }

    let frontier = (*chunk).frontier();
    (frontier as *mut RememberedEntry).write(entry);
    (*chunk).set_frontier(frontier.add(ENTRY_SIZE));
    Ok(())
}

/// Visit every triple in `list` (which may be null).
///
/// # Safety
/// `list` must be null or a remembered-set list.
pub unsafe fn for_each_remembered<F: FnMut(RememberedEntry)>(list: *mut ChunkList, mut f: F) {
    if list.is_null() {
        return;
    }
    let mut chunk = (*list).first();
    while !chunk.is_null() {
        let mut p = (*chunk).start();
        let frontier = (*chunk).frontier();
        while (p as usize) < frontier as usize {
            f((p as *const RememberedEntry).read());
            p = p.add(ENTRY_SIZE);
        }
        chunk = (*chunk).next();
    }
}

/// Number of triples in `list` (null counts as empty).
///
/// # Safety
/// As [`for_each_remembered`].
pub unsafe fn num_remembered(list: *mut ChunkList) -> usize {
    let mut count = 0;
    for_each_remembered(list, |_| count += 1);
    count
}

/// Write-barrier entry point: record that `holder.field` now points at
/// `pointee`, in the remembered set of `pointee`'s level.
///
/// # Safety
/// Both objects must live in the heap, with `field` inside `holder`.
pub unsafe fn remember_down_ptr(
    pool: &ChunkPool,
    holder: ObjPtr,
    field: *mut ObjPtr,
    pointee: ObjPtr,
) -> Result<(), GcError> {
    let level = (*Chunk::of(pointee)).level_head();
    debug_assert!(!level.is_null());

    let mut rs = (*level).remembered_set();
    if rs.is_null() {
        rs = ChunkList::new_plain();
        (*level).set_remembered_set(rs);
    }
    remember(
        rs,
        pool,
        RememberedEntry {
            holder,
            field,
            pointee,
        },
    )
}
