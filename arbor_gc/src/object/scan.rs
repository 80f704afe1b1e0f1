//! Field enumeration and size computation.
//!
//! The collector walks objects two ways: from an object pointer (roots,
//! copied objects) and from a raw to-space position (chunk scanning, where
//! only the metadata start is known). Both paths land in
//! [`object_footprint`] and [`for_each_objptr`].

use crate::object::stack::GcStack;
use crate::object::{
    header_of, sequence_length, DecodedHeader, ObjPtr, ObjectTag, NORMAL_METADATA_SIZE,
    SEQUENCE_METADATA_SIZE, STACK_METADATA_SIZE, STACK_STRUCT_SIZE,
};

/// The sizes that govern copying an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectFootprint {
    /// Object type.
    pub tag: ObjectTag,
    /// Metadata bytes in front of the payload pointer.
    pub metadata_bytes: usize,
    /// Payload bytes the object occupies.
    pub object_bytes: usize,
    /// Payload bytes a copy must transfer (stacks: only the frames in use).
    pub copy_bytes: usize,
}

impl ObjectFootprint {
    /// Total footprint including metadata.
    #[inline]
    pub fn total_bytes(&self) -> usize {
        self.metadata_bytes + self.object_bytes
    }
}

/// Compute the footprint of the object at `op`.
///
/// # Safety
/// `op` must point at the payload of an unforwarded heap object.
pub unsafe fn object_footprint(op: ObjPtr) -> ObjectFootprint {
    let DecodedHeader::Object {
        tag,
        non_ptr_bytes,
        num_ptrs,
    } = header_of(op).decode()
    else {
        unreachable!("object_footprint on forwarded object");
    };

    match tag {
        ObjectTag::Normal | ObjectTag::Weak => {
            let object_bytes = non_ptr_bytes as usize + num_ptrs as usize * 8;
            ObjectFootprint {
                tag,
                metadata_bytes: NORMAL_METADATA_SIZE,
                object_bytes,
                copy_bytes: object_bytes,
            }
        }
        ObjectTag::Sequence => {
            let stride = non_ptr_bytes as usize + num_ptrs as usize * 8;
            let length = sequence_length(op) as usize;
            // Empty sequences still occupy one word so a scan always advances.
            let object_bytes = crate::heap::align_up(stride * length, 8).max(8);
            ObjectFootprint {
                tag,
                metadata_bytes: SEQUENCE_METADATA_SIZE,
                object_bytes,
                copy_bytes: object_bytes,
            }
        }
        ObjectTag::Stack => {
            let stack = &*GcStack::from_objptr(op);
            ObjectFootprint {
                tag,
                metadata_bytes: STACK_METADATA_SIZE,
                object_bytes: STACK_STRUCT_SIZE + stack.reserved as usize,
                copy_bytes: STACK_STRUCT_SIZE + stack.used as usize,
            }
        }
    }
}

/// Visit the address of every pointer-bearing field of the object at `op`.
///
/// Stack slots are passed unconditionally; the caller is expected to ignore
/// words that do not classify as object pointers (that filter is also what
/// keeps immediates out of the collector everywhere else).
///
/// # Safety
/// As [`object_footprint`]; the callback may rewrite the visited slots but
/// must not touch the object's header.
pub unsafe fn for_each_objptr<F: FnMut(*mut ObjPtr)>(op: ObjPtr, mut f: F) {
    let DecodedHeader::Object {
        tag,
        non_ptr_bytes,
        num_ptrs,
    } = header_of(op).decode()
    else {
        unreachable!("for_each_objptr on forwarded object");
    };

    match tag {
        ObjectTag::Normal | ObjectTag::Weak => {
            let base = op.as_ptr().add(non_ptr_bytes as usize) as *mut ObjPtr;
            for i in 0..num_ptrs as usize {
                f(base.add(i));
            }
        }
        ObjectTag::Sequence => {
            if num_ptrs == 0 {
                return;
            }
            let stride = non_ptr_bytes as usize + num_ptrs as usize * 8;
            let length = sequence_length(op) as usize;
            let mut elem = op.as_ptr();
            for _ in 0..length {
                let base = elem.add(non_ptr_bytes as usize) as *mut ObjPtr;
                for i in 0..num_ptrs as usize {
                    f(base.add(i));
                }
                elem = elem.add(stride);
            }
        }
        ObjectTag::Stack => {
            let stack = &*GcStack::from_objptr(op);
            let slots = stack.used as usize / 8;
            let base = stack.frames_start() as *mut ObjPtr;
            for i in 0..slots {
                f(base.add(i));
            }
        }
    }
}

/// Parse the object whose *metadata* starts at `p`.
///
/// Returns the payload pointer and the total footprint, so a to-space scan
/// can hop object to object. The first metadata word disambiguates: headers
/// carry the valid bit, sequence counters keep it clear.
///
/// # Safety
/// `p` must be the metadata start of a live object in a chunk the caller is
/// scanning.
pub unsafe fn object_at(p: *mut u8) -> (ObjPtr, usize) {
    let first = (p as *const u64).read();
    let op = if first & 1 != 0 {
        ObjPtr::from_addr(p as usize + NORMAL_METADATA_SIZE)
    } else {
        ObjPtr::from_addr(p as usize + SEQUENCE_METADATA_SIZE)
    };
    let footprint = object_footprint(op);
    (op, footprint.total_bytes())
}
