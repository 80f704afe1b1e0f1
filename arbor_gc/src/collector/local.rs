//! The local collection driver.
//!
//! `collect_local` claims a suffix of the worker's depths from the deque,
//! lifts remembered edges out of the window (promotion), forwards the roots
//! (stack contents, thread contents, the thread itself, the deque's live
//! slots, the promoted edges), then scans to-space depth by depth until no
//! new objects appear. Old level lists go back to the pool, to-space becomes
//! the new levels, and the mutator frontier is repaired.

use log::debug;

use crate::barrier::for_each_remembered;
use crate::collector::forward::remember_at;
use crate::collector::{
    deferred_promote, ensure_to_space, forward, forward_down_ptr, forward_object_fields,
    ForwardArgs,
};
use crate::config::CollectionLevel;
use crate::error::GcError;
use crate::heap::{
    append_list, release_list, Chunk, HierarchicalHeap, HEAP_LIMIT_SLOP, MAX_DEPTH, NO_DEPTH,
};
use crate::object::{chase_fwd_ptr, has_fwd_ptr, object_at, GcStack, ObjPtr};
use crate::stats::GcTimer;
use crate::worker::Worker;

/// Run a local collection over the claimable suffix of the worker's depths.
///
/// The preconditions of collection are soft: when any fails (collection
/// disabled, no deque, sequential section, nothing claimable) the call logs
/// and returns `Ok`. Real failures — heap exhaustion, entanglement, a weak
/// object in the window — surface as errors and are fatal to the runtime.
pub fn collect_local(worker: &mut Worker, desired_scope: u32, force: bool) -> Result<(), GcError> {
    if worker.config.collection_level == CollectionLevel::None {
        return Ok(());
    }
    let Some(deque) = worker.deque.clone() else {
        debug!("skipping collection, deque not registered yet");
        return Ok(());
    };
    if !worker.current_thread().is_objptr() {
        debug!("skipping collection, world not initialized");
        return Ok(());
    }

    let current_depth = worker.current_depth();
    if !force && current_depth <= 1 {
        debug!("skipping collection during sequential section");
        return Ok(());
    }

    // Claim as many depths as we can, but only as far as desired.
    let original_bot = deque.poll_local_scope();
    let mut min_level = original_bot.min(MAX_DEPTH as u64) as u32;
    while min_level > desired_scope
        && min_level > worker.config.min_local_level
        && deque.try_claim_local_scope()
    {
        min_level -= 1;
    }

    let result = unsafe { collect_claimed(worker, min_level, current_depth, original_bot) };
    deque.release_local_scope(original_bot);
    result
}

/// Scan position inside one to-space level.
#[derive(Clone, Copy)]
struct ScanCursor {
    chunk: *mut Chunk,
    pos: *mut u8,
}

unsafe fn collect_claimed(
    worker: &mut Worker,
    claimed_min: u32,
    current_depth: u32,
    original_bot: u64,
) -> Result<(), GcError> {
    if claimed_min == 0 {
        debug!("skipping collection that includes root heap");
        return Ok(());
    }
    if claimed_min > current_depth {
        debug!(
            "skipping collection, claimed min {} above current depth {}",
            claimed_min, current_depth
        );
        return Ok(());
    }

    let min_level = match worker.config.collection_level {
        CollectionLevel::Superlocal => current_depth,
        _ => claimed_min,
    };
    let max_level = current_depth;

    let total_timer = GcTimer::start(true);

    // Flush mutator registers into the thread and stack objects.
    worker.exit_local_heap();
    let thread = worker.thread_ptr();
    let stack_op = (*thread).stack;
    let stack = GcStack::from_objptr(stack_op);
    if !worker.stack_top.is_null() {
        (*stack).used = worker.stack_top as u64 - (*stack).frames_start() as u64;
    }
    (*thread).exn_stack = worker.exn_stack;

    let hh = (*thread).hierarchical_heap;
    let pool = worker.pool.clone();
    let sizes_before = level_sizes(hh, max_level);

    debug!(
        "collecting levels [{}, {}] (claimed from {})",
        min_level, max_level, claimed_min
    );

    let mut args = ForwardArgs::new(
        &pool,
        min_level,
        max_level,
        stack_op,
        worker.config.initial_stack_reserved,
    );

    // Lift remembered edges out of the window before anything moves.
    let promo_timer = GcTimer::start(worker.config.detailed_gc_time);
    args.in_promotion = true;
    let promo = deferred_promote(hh, &mut args)?;
    args.in_promotion = false;
    promo_timer.stop(&worker.stats.promotion_time_ns);

    // Roots, in dependency order: the stack's frames, then the thread's
    // fields (which copies the stack object), then the thread itself, then
    // the deque's live slots, then the promoted edges.
    forward_object_fields(&mut args, stack_op)?;
    forward_object_fields(&mut args, worker.current_thread)?;
    forward(&mut args, &mut worker.current_thread as *mut ObjPtr)?;

    // Live deque slots span [top, original_bot): the tasks the claim loop
    // popped are still tasks, and become stealable again at release.
    if let Some(deque) = worker.deque.clone() {
        let slots = deque.slots();
        for index in deque.top()..original_bot {
            let slot = &slots[(index % arbor_sched::DEQUE_CAP as u64) as usize];
            let mut word = ObjPtr::from_raw(slot.load(std::sync::atomic::Ordering::Relaxed));
            forward(&mut args, &mut word as *mut ObjPtr)?;
            slot.store(word.raw(), std::sync::atomic::Ordering::Relaxed);
        }
    }

    let mut root_edges = Vec::new();
    for_each_remembered(promo.global_down_ptrs, |e| root_edges.push(e));
    for edge in root_edges {
        forward_down_ptr(&mut args, edge.holder, edge.field)?;
    }

    // The thread may have moved; refresh the skip identities.
    let thread = worker.thread_ptr();
    let expected_thread = worker.current_thread;
    let expected_stack = (*thread).stack;

    scan_to_space(&mut args, min_level, max_level, expected_stack, expected_thread)?;

    // Re-remember in-window edges whose holders survived the trace.
    for entry in &promo.deferred {
        let holder = if has_fwd_ptr(entry.holder) {
            chase_fwd_ptr(entry.holder)
        } else {
            let head = (*Chunk::of(entry.holder)).level_head();
            if head.is_null() || !(*head).is_in_to_space() {
                continue; // holder did not survive
            }
            entry.holder
        };
        let field = (holder.raw() as usize
            + (entry.field as usize - entry.holder.raw() as usize))
            as *mut ObjPtr;
        let pointee = field.read();
        if !pointee.is_objptr() || !pool.contains(pointee.raw() as usize) {
            continue;
        }
        let depth = (*(*Chunk::of(pointee)).level_head()).depth();
        if depth == NO_DEPTH {
            continue;
        }
        let list = if depth >= min_level && depth <= max_level {
            ensure_to_space(&mut args, depth)
        } else {
            let level = (*hh).level(depth);
            if level.is_null() {
                continue;
            }
            level
        };
        remember_at(list, &pool, holder, field, pointee)?;
    }

    // From-space is dead now; catch stale pointers early in debug builds.
    #[cfg(debug_assertions)]
    scrub_old_levels(hh, min_level, max_level);

    // Free old chunks, then install to-space as the new levels.
    for depth in min_level..=max_level {
        let level = (*hh).level(depth);
        if !level.is_null() {
            release_list(&pool, level);
            (*hh).set_level(depth, std::ptr::null_mut());
        }
    }
    release_list(&pool, promo.global_down_ptrs);

    for depth in 0..=max_level {
        let to_level = args.to_space[depth as usize];
        if to_level.is_null() {
            continue;
        }
        (*to_level).set_owner(hh);
        (*to_level).set_in_to_space(false);
        if (*hh).level(depth).is_null() {
            (*hh).set_level(depth, to_level);
        } else {
            append_list((*hh).level(depth), to_level);
        }
    }

    // Repair the mutator's chunk: tail of the deepest surviving level, with
    // a fresh chunk when that tail cannot take small objects.
    let mut last: *mut Chunk = std::ptr::null_mut();
    let mut depth = max_level + 1;
    while depth > 0 {
        depth -= 1;
        let level = (*hh).level(depth);
        if !level.is_null() && !(*level).last().is_null() {
            last = (*level).last();
            break;
        }
    }
    (*hh).set_last_allocated_chunk(last);
    if !last.is_null() && !(*last).might_contain_multiple_objects() {
        (*hh).extend(&pool, current_depth, HEAP_LIMIT_SLOP)?;
    }
    worker.reload_frontier();

    // Survival accounting drives the next threshold.
    let survived = args.bytes_copied + args.bytes_moved;
    let thread = worker.thread_ptr();
    (*thread).bytes_survived_last_collection = survived;
    (*hh).reset_allocation_budget();
    (*hh).set_collection_threshold(HierarchicalHeap::next_collection_threshold(
        &worker.config,
        survived as usize,
    ));

    worker.stats.record_collection(
        args.bytes_copied,
        args.bytes_moved,
        args.objects_copied,
        args.objects_moved,
        args.stacks_copied,
    );
    total_timer.stop(&worker.stats.collection_time_ns);

    if log::log_enabled!(log::Level::Debug) {
        let sizes_after = level_sizes(hh, max_level);
        for depth in 0..=max_level as usize {
            let (before, after) = (sizes_before[depth], sizes_after[depth]);
            if before != 0 || after != 0 {
                debug!("level {}: {} -> {} used bytes", depth, before, after);
            }
        }
        debug!(
            "collection done: {} copied, {} moved, {} stacks",
            args.bytes_copied, args.bytes_moved, args.stacks_copied
        );
    }

    Ok(())
}

/// Scan every to-space level, deepest first, until a full sweep copies
/// nothing new. Cursors persist across sweeps, so each object is scanned
/// exactly once.
unsafe fn scan_to_space(
    args: &mut ForwardArgs,
    min_level: u32,
    max_level: u32,
    expected_stack: ObjPtr,
    expected_thread: ObjPtr,
) -> Result<(), GcError> {
    let mut cursors = [ScanCursor {
        chunk: std::ptr::null_mut(),
        pos: std::ptr::null_mut(),
    }; MAX_DEPTH];

    loop {
        let mut progress = false;
        let mut depth = max_level + 1;
        while depth > min_level {
            depth -= 1;
            let list = args.to_space[depth as usize];
            if list.is_null() {
                continue;
            }
            let mut cursor = cursors[depth as usize];
            if cursor.chunk.is_null() {
                cursor.chunk = (*list).first();
                if cursor.chunk.is_null() {
                    continue;
                }
                cursor.pos = (*cursor.chunk).start();
            }
            loop {
                while (cursor.pos as usize) < (*cursor.chunk).frontier() as usize {
                    let (op, total) = object_at(cursor.pos);
                    if op != expected_stack && op != expected_thread {
                        forward_object_fields(args, op)?;
                    }
                    cursor.pos = cursor.pos.add(total);
                    progress = true;
                }
                let next = (*cursor.chunk).next();
                if next.is_null() {
                    break;
                }
                cursor.chunk = next;
                cursor.pos = (*next).start();
            }
            cursors[depth as usize] = cursor;
        }
        if !progress {
            return Ok(());
        }
    }
}

/// Used bytes per level, for the before/after log line.
unsafe fn level_sizes(hh: *mut HierarchicalHeap, max_level: u32) -> Vec<usize> {
    (0..=max_level as usize)
        .map(|depth| {
            let level = (*hh).level(depth as u32);
            if level.is_null() {
                0
            } else {
                (*level).used_bytes()
            }
        })
        .collect()
}

/// Fill dead from-space payloads with a poison byte.
#[cfg(debug_assertions)]
unsafe fn scrub_old_levels(hh: *mut HierarchicalHeap, min_level: u32, max_level: u32) {
    for depth in min_level..=max_level {
        let level = (*hh).level(depth);
        if level.is_null() {
            continue;
        }
        let mut chunk = (*level).first();
        while !chunk.is_null() {
            let start = (*chunk).start();
            let length = (*chunk).limit() as usize - start as usize;
            std::ptr::write_bytes(start, 0xBF, length);
            chunk = (*chunk).next();
        }
    }
}
