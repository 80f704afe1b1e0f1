//! Collector configuration parameters.
//!
//! All sizes and thresholds are tunable per worker. Defaults suit typical
//! fork-join workloads; the presets cover the common extremes.

use crate::heap::BLOCK_SIZE;

/// How aggressively local collection claims depths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionLevel {
    /// Local collection disabled entirely.
    None,
    /// Collect only the leaf: the window is pinned to the current depth.
    Superlocal,
    /// Collect every depth the deque lets the worker claim.
    All,
}

/// Configuration for a worker's hierarchical heap.
///
/// # Example
///
/// ```ignore
/// use arbor_gc::HhConfig;
///
/// let config = HhConfig {
///     region_size: 256 * 1024 * 1024,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct HhConfig {
    /// Collection aggressiveness.
    ///
    /// Default: [`CollectionLevel::All`]
    pub collection_level: CollectionLevel,

    /// Lower bound on scope claiming: collection never claims a depth below
    /// this, so shallower levels are only reclaimed by their own owner later.
    ///
    /// Default: 1 (the root level is never locally collected)
    pub min_local_level: u32,

    /// Lift cross-window down-pointers before copying begins.
    ///
    /// Always on; the field exists so the option surface matches the
    /// runtime's control table.
    pub deferred_promotion: bool,

    /// Record per-phase (promotion vs. copy) timing in the statistics.
    ///
    /// Default: false
    pub detailed_gc_time: bool,

    /// Size of the backing block region in bytes. Must be a multiple of
    /// [`BLOCK_SIZE`]. Exhausting it is fatal.
    ///
    /// Default: 64MB
    pub region_size: usize,

    /// Bytes a depth may allocate before local collection is considered.
    ///
    /// Default: 64KB
    pub initial_collection_threshold: usize,

    /// The next collection threshold is the survivors of the last collection
    /// times this factor (floored at the initial threshold).
    ///
    /// Default: 8.0
    pub threshold_growth_factor: f64,

    /// Reserved bytes of a freshly created stack object.
    ///
    /// Default: 1KB
    pub initial_stack_reserved: usize,
}

impl Default for HhConfig {
    fn default() -> Self {
        Self {
            collection_level: CollectionLevel::All,
            min_local_level: 1,
            deferred_promotion: true,
            detailed_gc_time: false,
            region_size: 64 * 1024 * 1024,
            initial_collection_threshold: 64 * 1024,
            threshold_growth_factor: 8.0,
            initial_stack_reserved: 1024,
        }
    }
}

impl HhConfig {
    /// Configuration for memory-constrained runs.
    pub fn low_memory() -> Self {
        Self {
            region_size: 8 * 1024 * 1024,
            initial_collection_threshold: 16 * 1024,
            threshold_growth_factor: 4.0,
            ..Default::default()
        }
    }

    /// Configuration that trades space for fewer collections.
    pub fn high_throughput() -> Self {
        Self {
            region_size: 256 * 1024 * 1024,
            initial_collection_threshold: 512 * 1024,
            threshold_growth_factor: 16.0,
            ..Default::default()
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.region_size < 16 * BLOCK_SIZE || self.region_size % BLOCK_SIZE != 0 {
            return Err(ConfigError::BadRegionSize);
        }
        if self.initial_collection_threshold < BLOCK_SIZE {
            return Err(ConfigError::ThresholdTooSmall);
        }
        if self.threshold_growth_factor < 1.0 {
            return Err(ConfigError::BadGrowthFactor);
        }
        if self.min_local_level == 0 {
            return Err(ConfigError::MinLocalLevelZero);
        }
        if self.initial_stack_reserved < 256 || self.initial_stack_reserved % 8 != 0 {
            return Err(ConfigError::BadStackReserve);
        }
        if !self.deferred_promotion {
            return Err(ConfigError::PromotionRequired);
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Region size must be a multiple of the block size, minimum 16 blocks.
    BadRegionSize,
    /// Collection threshold must cover at least one block.
    ThresholdTooSmall,
    /// Growth factor below 1.0 would shrink the threshold forever.
    BadGrowthFactor,
    /// A zero `min_local_level` would let collection claim the root heap.
    MinLocalLevelZero,
    /// Stack reserve must be at least 256 bytes and word-aligned.
    BadStackReserve,
    /// Deferred promotion cannot be disabled.
    PromotionRequired,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::BadRegionSize => {
                write!(f, "region size must be a multiple of the block size (>= 16 blocks)")
            }
            ConfigError::ThresholdTooSmall => {
                write!(f, "collection threshold must be at least one block")
            }
            ConfigError::BadGrowthFactor => write!(f, "threshold growth factor must be >= 1.0"),
            ConfigError::MinLocalLevelZero => {
                write!(f, "min local level must be at least 1; the root heap is never local")
            }
            ConfigError::BadStackReserve => {
                write!(f, "initial stack reserve must be >= 256 and word-aligned")
            }
            ConfigError::PromotionRequired => write!(f, "deferred promotion cannot be disabled"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(HhConfig::default().validate().is_ok());
    }

    #[test]
    fn preset_configs_are_valid() {
        assert!(HhConfig::low_memory().validate().is_ok());
        assert!(HhConfig::high_throughput().validate().is_ok());
    }

    #[test]
    fn unaligned_region_rejected() {
        let config = HhConfig {
            region_size: 64 * 1024 * 1024 + 1,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::BadRegionSize));
    }

    #[test]
    fn zero_min_local_level_rejected() {
        let config = HhConfig {
            min_local_level: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::MinLocalLevelZero));
    }

    #[test]
    fn promotion_cannot_be_disabled() {
        let config = HhConfig {
            deferred_promotion: false,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::PromotionRequired));
    }
}
