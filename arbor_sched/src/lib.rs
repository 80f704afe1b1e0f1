//! Arbor work-stealing scheduler primitives.
//!
//! This crate holds the two lock-free building blocks the Arbor runtime
//! shares between its scheduler and its garbage collector:
//!
//! - A bounded [`Deque`] (Chase–Lev): the owning worker pushes and pops the
//!   bottom end, any other worker steals from the top end.
//! - The *local scope* protocol: the deque's `bot` cursor doubles as the
//!   boundary of the depths a worker currently owns, so the collector claims
//!   depths for exclusive collection by popping the bottom end and restores
//!   the cursor when it is done.
//!
//! Tasks are stored as raw object-pointer words. The deque never inspects
//! them; the garbage collector walks the ring slots as roots.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod deque;
mod scope;

pub use deque::{Deque, DepthOnNonEmpty, DEQUE_CAP};
