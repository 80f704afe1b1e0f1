//! Collector error kinds.
//!
//! None of these are recoverable: the runtime boundary turns every error
//! into a diagnostic and aborts. Internal code still propagates them as
//! `Result` so the unit tests can observe failure modes directly.

/// A fatal condition raised by the collector or allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcError {
    /// The backing region has no blocks left for the requested chunk.
    OutOfHeap,
    /// A push on a full deque: the program exceeded the maximum fork depth.
    ForkDepthExceeded,
    /// Forwarding reached an object deeper than the collection window, i.e.
    /// the mutator created a cross-owner pointer.
    Entanglement {
        /// The offending pointer.
        objptr: u64,
        /// The depth the pointer resolved to.
        depth: u32,
        /// Lower bound of the collection window.
        min_level: u32,
        /// Upper bound of the collection window.
        max_level: u32,
    },
    /// Forwarding encountered a weak object. Weak references are only
    /// supported at depth 0, outside the reach of local collection.
    WeakDuringLocal,
    /// A heap invariant did not hold (assertion builds surface these before
    /// they corrupt the heap).
    InvariantViolated(&'static str),
}

impl std::fmt::Display for GcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GcError::OutOfHeap => write!(f, "out of space for hierarchical heap"),
            GcError::ForkDepthExceeded => {
                write!(f, "work deque full: maximum fork depth exceeded")
            }
            GcError::Entanglement {
                objptr,
                depth,
                min_level,
                max_level,
            } => write!(
                f,
                "entanglement: {:#x} is at depth {}, outside window [{}, {}]",
                objptr, depth, min_level, max_level
            ),
            GcError::WeakDuringLocal => {
                write!(f, "weak object reached by local collection")
            }
            GcError::InvariantViolated(what) => write!(f, "invariant violated: {}", what),
        }
    }
}

impl std::error::Error for GcError {}

impl GcError {
    /// Report the error and abort the process.
    ///
    /// This is the runtime boundary's policy for every [`GcError`]; library
    /// code returns `Result` instead of calling this.
    pub fn die(self) -> ! {
        log::error!("fatal: {}", self);
        eprintln!("arbor: fatal: {}", self);
        std::process::abort()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_mentions_window() {
        let err = GcError::Entanglement {
            objptr: 0x4000,
            depth: 5,
            min_level: 2,
            max_level: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("depth 5"));
        assert!(msg.contains("[2, 3]"));
    }

    #[test]
    fn errors_are_comparable() {
        assert_eq!(GcError::OutOfHeap, GcError::OutOfHeap);
        assert_ne!(GcError::OutOfHeap, GcError::WeakDuringLocal);
    }
}
