//! Object header encoding.
//!
//! A header is one machine word:
//!
//! ```text
//! bit  0      valid bit: 1 for a header, 0 for a forwarding pointer
//! bits 1-2    type tag (normal | sequence | stack | weak)
//! bits 3-22   non-pointer payload bytes (per element, for sequences)
//! bits 23-42  pointer field count (per element, for sequences)
//! bit  63     mark bit (used by whole-heap collection, preserved here)
//! ```
//!
//! Once an object moves, its header word is overwritten with the forwarding
//! pointer itself: addresses are 8-aligned, so the clear valid bit is what
//! distinguishes the two states.

use crate::object::ObjPtr;

const VALID_BIT: u64 = 1;
const TAG_SHIFT: u32 = 1;
const TAG_MASK: u64 = 0b11;
const NON_PTR_SHIFT: u32 = 3;
const NON_PTR_MASK: u64 = (1 << 20) - 1;
const NUM_PTRS_SHIFT: u32 = 23;
const NUM_PTRS_MASK: u64 = (1 << 20) - 1;
const MARK_BIT: u64 = 1 << 63;

/// Object type tag.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectTag {
    /// Fixed-size object: non-pointer bytes followed by pointer fields.
    Normal = 0,
    /// Flat array of elements, each non-pointer bytes then pointer fields.
    Sequence = 1,
    /// An execution stack; sized by its own `reserved` field.
    Stack = 2,
    /// A weak reference; cleared by whole-heap collection only.
    Weak = 3,
}

/// A raw header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Header(u64);

/// A header word, decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodedHeader {
    /// A live object's layout.
    Object {
        /// Type tag.
        tag: ObjectTag,
        /// Non-pointer bytes (per element for sequences).
        non_ptr_bytes: u32,
        /// Pointer-field count (per element for sequences).
        num_ptrs: u32,
    },
    /// The object has moved; the word is its new location.
    Forwarded(ObjPtr),
}

impl Header {
    /// Build a header for an object of the given layout.
    pub fn object(tag: ObjectTag, non_ptr_bytes: u32, num_ptrs: u32) -> Header {
        debug_assert!(u64::from(non_ptr_bytes) <= NON_PTR_MASK);
        debug_assert!(u64::from(num_ptrs) <= NUM_PTRS_MASK);
        Header(
            VALID_BIT
                | (tag as u64) << TAG_SHIFT
                | u64::from(non_ptr_bytes) << NON_PTR_SHIFT
                | u64::from(num_ptrs) << NUM_PTRS_SHIFT,
        )
    }

    /// The word that replaces a header once the object has moved.
    #[inline]
    pub fn forwarding(target: ObjPtr) -> Header {
        debug_assert!(target.is_objptr());
        Header(target.raw())
    }

    /// Reinterpret a raw word.
    #[inline]
    pub const fn from_raw(raw: u64) -> Header {
        Header(raw)
    }

    /// The raw word.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Whether this word is a forwarding pointer.
    #[inline]
    pub const fn is_forwarded(self) -> bool {
        self.0 != 0 && self.0 & VALID_BIT == 0
    }

    /// Whether this word is a well-formed object header.
    #[inline]
    pub const fn is_valid_object(self) -> bool {
        self.0 & VALID_BIT != 0
    }

    /// Decode into header contents or forwarding target.
    pub fn decode(self) -> DecodedHeader {
        if self.is_valid_object() {
            let tag = match (self.0 >> TAG_SHIFT) & TAG_MASK {
                0 => ObjectTag::Normal,
                1 => ObjectTag::Sequence,
                2 => ObjectTag::Stack,
                _ => ObjectTag::Weak,
            };
            DecodedHeader::Object {
                tag,
                non_ptr_bytes: ((self.0 >> NON_PTR_SHIFT) & NON_PTR_MASK) as u32,
                num_ptrs: ((self.0 >> NUM_PTRS_SHIFT) & NUM_PTRS_MASK) as u32,
            }
        } else {
            DecodedHeader::Forwarded(ObjPtr::from_raw(self.0))
        }
    }

    /// The type tag of a valid header.
    pub fn tag(self) -> ObjectTag {
        debug_assert!(self.is_valid_object());
        match (self.0 >> TAG_SHIFT) & TAG_MASK {
            0 => ObjectTag::Normal,
            1 => ObjectTag::Sequence,
            2 => ObjectTag::Stack,
            _ => ObjectTag::Weak,
        }
    }

    /// Set the mark bit.
    #[inline]
    pub const fn with_mark(self) -> Header {
        Header(self.0 | MARK_BIT)
    }

    /// Clear the mark bit.
    #[inline]
    pub const fn without_mark(self) -> Header {
        Header(self.0 & !MARK_BIT)
    }

    /// Whether the mark bit is set.
    #[inline]
    pub const fn is_marked(self) -> bool {
        self.0 & MARK_BIT != 0
    }
}
