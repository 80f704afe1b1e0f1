//! Collection statistics and phase timing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Cumulative statistics for a worker's local collections.
///
/// All counters are relaxed atomics so the mutator fast path can bump them
/// without synchronization.
#[derive(Debug, Default)]
pub struct GcStats {
    /// Number of local collections run to completion.
    pub local_collections: AtomicU64,
    /// Total bytes handed out by the bump allocator.
    pub bytes_allocated: AtomicU64,
    /// Bytes physically copied into to-space.
    pub bytes_copied: AtomicU64,
    /// Bytes logically moved via the single-object-chunk optimization.
    pub bytes_moved: AtomicU64,
    /// Objects copied.
    pub objects_copied: AtomicU64,
    /// Objects moved without copying.
    pub objects_moved: AtomicU64,
    /// Stack objects copied (they have their own size policy).
    pub stacks_copied: AtomicU64,
    /// Time spent in deferred promotion, when detailed timing is on.
    pub promotion_time_ns: AtomicU64,
    /// Time spent in local collection overall.
    pub collection_time_ns: AtomicU64,
    /// High-water mark of live heap bytes seen by any collection.
    pub max_heap_size: AtomicU64,
}

impl GcStats {
    /// Create zeroed statistics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record bytes handed out by the allocator.
    #[inline]
    pub fn record_allocation(&self, bytes: usize) {
        self.bytes_allocated.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Fold one collection's forwarding counters into the totals.
    pub fn record_collection(
        &self,
        bytes_copied: u64,
        bytes_moved: u64,
        objects_copied: u64,
        objects_moved: u64,
        stacks_copied: u64,
    ) {
        self.local_collections.fetch_add(1, Ordering::Relaxed);
        self.bytes_copied.fetch_add(bytes_copied, Ordering::Relaxed);
        self.bytes_moved.fetch_add(bytes_moved, Ordering::Relaxed);
        self.objects_copied.fetch_add(objects_copied, Ordering::Relaxed);
        self.objects_moved.fetch_add(objects_moved, Ordering::Relaxed);
        self.stacks_copied.fetch_add(stacks_copied, Ordering::Relaxed);
        let survived = bytes_copied + bytes_moved;
        self.max_heap_size.fetch_max(survived, Ordering::Relaxed);
    }

    /// Total survivor bytes across all collections.
    pub fn bytes_survived(&self) -> u64 {
        self.bytes_copied.load(Ordering::Relaxed) + self.bytes_moved.load(Ordering::Relaxed)
    }

    /// Average collection pause.
    pub fn avg_collection_pause(&self) -> Duration {
        let count = self.local_collections.load(Ordering::Relaxed);
        if count == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.collection_time_ns.load(Ordering::Relaxed) / count)
    }

    /// Print a summary of collection activity.
    pub fn print_summary(&self) {
        eprintln!("=== Arbor GC Statistics ===");
        eprintln!(
            "Allocated: {}",
            format_bytes(self.bytes_allocated.load(Ordering::Relaxed))
        );
        eprintln!(
            "Local collections: {} ({:?} avg pause)",
            self.local_collections.load(Ordering::Relaxed),
            self.avg_collection_pause()
        );
        eprintln!(
            "Survivors: {} copied ({} objects), {} moved ({} chunks), {} stacks",
            format_bytes(self.bytes_copied.load(Ordering::Relaxed)),
            self.objects_copied.load(Ordering::Relaxed),
            format_bytes(self.bytes_moved.load(Ordering::Relaxed)),
            self.objects_moved.load(Ordering::Relaxed),
            self.stacks_copied.load(Ordering::Relaxed)
        );
        eprintln!(
            "Promotion time: {:?}",
            Duration::from_nanos(self.promotion_time_ns.load(Ordering::Relaxed))
        );
    }
}

/// Format bytes in human-readable form.
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Timer for a collection phase.
///
/// Accumulates into the given counter on `stop`, but only when the worker
/// asked for detailed timing — the `Instant` read is not free on every
/// platform.
pub struct GcTimer {
    start: Option<Instant>,
}

impl GcTimer {
    /// Start timing if `enabled`.
    pub fn start(enabled: bool) -> Self {
        Self {
            start: enabled.then(Instant::now),
        }
    }

    /// Stop and fold the elapsed time into `counter`.
    pub fn stop(self, counter: &AtomicU64) {
        if let Some(start) = self.start {
            counter.fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_accounting() {
        let stats = GcStats::new();
        stats.record_collection(1000, 4096, 10, 1, 1);
        stats.record_collection(500, 0, 5, 0, 1);

        assert_eq!(stats.local_collections.load(Ordering::Relaxed), 2);
        assert_eq!(stats.bytes_survived(), 5596);
        assert_eq!(stats.max_heap_size.load(Ordering::Relaxed), 5096);
    }

    #[test]
    fn timer_disabled_records_nothing() {
        let counter = AtomicU64::new(0);
        let timer = GcTimer::start(false);
        timer.stop(&counter);
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn timer_enabled_records_elapsed() {
        let counter = AtomicU64::new(0);
        let timer = GcTimer::start(true);
        std::thread::sleep(Duration::from_millis(1));
        timer.stop(&counter);
        assert!(counter.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn format_bytes_units() {
        assert_eq!(format_bytes(512), "512 bytes");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
    }
}
