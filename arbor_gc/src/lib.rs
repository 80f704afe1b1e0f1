//! Arbor hierarchical-heap garbage collector.
//!
//! The runtime gives every worker a *hierarchical heap*: an array of chunk
//! lists indexed by fork depth. A worker allocates by bumping a frontier in
//! the chunk at its deepest level, and collects locally by claiming a suffix
//! of its depths from the work-stealing deque and copying the live objects of
//! those levels into fresh chunk lists. Child computations cannot reference
//! their siblings' heaps, so no global synchronization is needed.
//!
//! # Architecture
//!
//! - **Chunks and blocks** ([`heap`]): a block-aligned region carved into
//!   fixed-size blocks; chunks group one or more blocks and link into
//!   per-depth lists. Any object pointer finds its chunk by masking.
//! - **Objects** ([`object`]): one-word headers carrying a type tag, field
//!   layout, and — once an object has moved — its forwarding pointer.
//! - **Remembered sets** ([`barrier`]): chunk-backed triples recording
//!   cross-level pointers at the pointee's level.
//! - **Collection** ([`collector`]): deferred promotion lifts cross-window
//!   edges, then a copying trace forwards roots and scans to-space to a
//!   fixpoint. Single-object chunks are relinked instead of copied.
//! - **Mutator interface** ([`worker`], [`world`]): the frontier/limit bump
//!   allocator, the allocation slow path, stack growth, and world setup.
//!
//! # Safety
//!
//! The heap is a raw-memory arena; nearly everything below [`worker`] is
//! `unsafe` plumbing with the usual copying-collector contract: object
//! headers must be valid before a collection, and the mutator must only hold
//! pointers at depths its worker owns.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod barrier;
pub mod collector;
pub mod config;
pub mod error;
pub mod heap;
pub mod invariant;
pub mod object;
pub mod stats;
pub mod worker;
pub mod world;

pub use config::{CollectionLevel, HhConfig};
pub use error::GcError;
pub use heap::{ChunkPool, HierarchicalHeap, BLOCK_SIZE, HEAP_LIMIT_SLOP, MAX_DEPTH};
pub use object::ObjPtr;
pub use stats::GcStats;
pub use worker::{DequeRegistry, Worker};
pub use world::{duplicate_world, init_world, new_thread_with_heap, switch_to_thread, VectorInit};

pub use collector::collect_local;
