//! The forwarding engine.
//!
//! An object is either *fresh* or *forwarded*; the transition is one-way and
//! overwrites the header with the new address. Forwarding a reference means:
//! filter out non-heap words and out-of-window objects, chase any existing
//! forwarding chain, then either relink the object's dedicated chunk into
//! to-space (single-object chunks move for free) or copy its bytes into the
//! to-space list of its own depth and leave a forwarding pointer behind.

use crate::barrier::{remember, RememberedEntry};
use crate::collector::ForwardArgs;
use crate::error::GcError;
use crate::heap::{
    allocate_chunk, append_chunk, copy_space_owner, unlink_chunk, Chunk, ChunkList, ChunkPool,
    HEAP_LIMIT_SLOP, NO_DEPTH,
};
use crate::object::{
    chase_fwd_ptr, for_each_objptr, install_fwd_ptr, object_footprint, shrink_reserved, GcStack,
    ObjPtr, ObjectTag,
};

/// Forward the reference in `slot`, per the window in `args`.
///
/// # Safety
/// `slot` must be a valid field address. The heap must be in collection
/// state: from-space headers valid or forwarded, to-space owned by `args`.
pub unsafe fn forward(args: &mut ForwardArgs, slot: *mut ObjPtr) -> Result<(), GcError> {
    let op = slot.read();
    if !op.is_objptr() || !args.pool.contains(op.raw() as usize) {
        return Ok(());
    }

    let chunk = Chunk::of(op);
    debug_assert!((*chunk).magic_ok());
    let head = (*chunk).level_head();
    if head.is_null() || (*head).depth() == NO_DEPTH {
        // Not part of any hierarchical-heap level.
        return Ok(());
    }

    let depth = (*head).depth();
    if depth > args.max_level {
        return Err(GcError::Entanglement {
            objptr: op.raw(),
            depth,
            min_level: args.min_level,
            max_level: args.max_level,
        });
    }
    if depth < args.min_level {
        return Ok(());
    }

    // Chase any forwarding chain to the current copy.
    let op = chase_fwd_ptr(op);
    let chunk = Chunk::of(op);
    let head = (*chunk).level_head();
    let depth = (*head).depth();
    if depth < args.min_level || (*head).is_in_to_space() {
        slot.write(op);
        return Ok(());
    }

    if crate::object::header_of(op).tag() == ObjectTag::Weak {
        return Err(GcError::WeakDuringLocal);
    }

    let to_list = ensure_to_space(args, depth);

    if !(*chunk).might_contain_multiple_objects() {
        // The chunk holds only this object: relink it instead of copying.
        // Appending (not prepending) keeps the left-to-right to-space scan
        // exhaustive, and the fresh tail chunk keeps copies flowing into a
        // multi-object chunk.
        let fp = object_footprint(op);
        if fp.tag == ObjectTag::Stack {
            args.stacks_copied += 1;
        }
        unlink_chunk(chunk);
        append_chunk(to_list, chunk);
        allocate_chunk(to_list, args.pool, HEAP_LIMIT_SLOP)?;
        args.bytes_moved += (fp.metadata_bytes + fp.copy_bytes) as u64;
        args.objects_moved += 1;
        slot.write(op);
        return Ok(());
    }

    // A stack copied into a smaller home first gives back unused reserve.
    if crate::object::header_of(op).tag() == ObjectTag::Stack {
        let stack = GcStack::from_objptr(op);
        let target = shrink_reserved(
            &*stack,
            op == args.current_stack,
            args.stack_reserve_floor,
        );
        if target < (*stack).reserved as usize {
            log::debug!(
                "shrinking stack reserve {} -> {} ({} used)",
                (*stack).reserved,
                target,
                (*stack).used
            );
            (*stack).reserved = target as u64;
        }
        args.stacks_copied += 1;
    }

    let fp = object_footprint(op);
    let src_meta = op.as_ptr().sub(fp.metadata_bytes);
    let copy_total = fp.metadata_bytes + fp.copy_bytes;
    let new_meta = copy_object(args.pool, to_list, src_meta, fp.total_bytes(), copy_total)?;
    let new_op = ObjPtr::from_addr(new_meta as usize + fp.metadata_bytes);

    install_fwd_ptr(op, new_op);
    args.bytes_copied += copy_total as u64;
    args.objects_copied += 1;
    slot.write(new_op);
    Ok(())
}

/// Forward every pointer field of the object at `op`.
///
/// # Safety
/// As [`forward`]; `op` must be a live, unforwarded object.
pub unsafe fn forward_object_fields(args: &mut ForwardArgs, op: ObjPtr) -> Result<(), GcError> {
    let mut failure = None;
    for_each_objptr(op, |slot| {
        if failure.is_none() {
            if let Err(err) = forward(args, slot) {
                failure = Some(err);
            }
        }
    });
    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Forward a remembered down-pointer and keep the edge remembered.
///
/// Forwards the pointee through `field`, then re-records the triple in the
/// remembered set of the pointee's to-space level when that level is inside
/// the window. (`holder` and `field` must already denote the holder's
/// current location.)
///
/// # Safety
/// As [`forward`], with `field` pointing into a live holder object.
pub unsafe fn forward_down_ptr(
    args: &mut ForwardArgs,
    holder: ObjPtr,
    field: *mut ObjPtr,
) -> Result<(), GcError> {
    forward(args, field)?;

    let pointee = field.read();
    if !pointee.is_objptr() || !args.pool.contains(pointee.raw() as usize) {
        return Ok(());
    }
    let head = (*Chunk::of(pointee)).level_head();
    let depth = (*head).depth();
    if depth == NO_DEPTH || depth < args.min_level || depth > args.max_level {
        // The edge now points below the window; the surviving remembered
        // set at the pointee's level already carries it.
        return Ok(());
    }

    let to_list = ensure_to_space(args, depth);
    remember_at(to_list, args.pool, holder, field, pointee)
}

/// The to-space list for `depth`, created on first use.
pub unsafe fn ensure_to_space(args: &mut ForwardArgs, depth: u32) -> *mut ChunkList {
    let slot = &mut args.to_space[depth as usize];
    if slot.is_null() {
        let list = ChunkList::new_level(depth, copy_space_owner());
        (*list).set_in_to_space(true);
        *slot = list;
    }
    *slot
}

/// Record a triple in the remembered set of `list`, creating the set on
/// first use.
pub(crate) unsafe fn remember_at(
    list: *mut ChunkList,
    pool: &ChunkPool,
    holder: ObjPtr,
    field: *mut ObjPtr,
    pointee: ObjPtr,
) -> Result<(), GcError> {
    let mut rs = (*list).remembered_set();
    if rs.is_null() {
        rs = ChunkList::new_plain();
        (*list).set_remembered_set(rs);
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

/// Copy `copy_total` bytes of an object (metadata first) into the tail of
/// `list`, reserving `total_bytes` there. Returns the copy's metadata start.
unsafe fn copy_object(
    pool: &ChunkPool,
    list: *mut ChunkList,
    src_meta: *const u8,
    total_bytes: usize,
    copy_total: usize,
) -> Result<*mut u8, GcError> {
    debug_assert!(copy_total <= total_bytes);

    let mut chunk = (*list).last();
    let must_extend = chunk.is_null()
        || !(*chunk).might_contain_multiple_objects()
        || ((*chunk).limit() as usize - (*chunk).frontier() as usize) < total_bytes
        || (*chunk).frontier() as usize >= (*chunk).first_block_end() as usize;
    if must_extend {
        chunk = allocate_chunk(list, pool, total_bytes)?;
    }

    let dst = (*chunk).frontier();
    std::ptr::copy_nonoverlapping(src_meta, dst, copy_total);
    (*chunk).set_frontier(dst.add(total_bytes));

    // Crossing the first block would break pointer masking for the next
    // object; start a fresh chunk instead.
    if (*chunk).frontier() as usize >= (*chunk).first_block_end() as usize {
        allocate_chunk(list, pool, HEAP_LIMIT_SLOP)?;
    }
    Ok(dst)
}
