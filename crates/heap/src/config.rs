#![forbid(unsafe_code)]

use thiserror::Error;

use crate::WORD_BYTES;

/// The smallest supported block size in words.
pub const MIN_BLOCK_SIZE: usize = 16;

/// The largest supported block size in words, offsets in a handle are 32 bits.
pub const MAX_BLOCK_SIZE: usize = 1 << 31;

/// Tuning parameters of a [crate::Heap].
///
/// The collection thresholds are percentages, see [crate::Decision] for how
/// they steer the choice between growing and collecting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeapConfig {
    /// The number of words in a block. Cells larger than a block get a block of their own.
    pub block_size: usize,

    /// The initial number of size classes, the table grows on demand.
    pub initial_max_term_size: usize,

    /// The directory starts with `2^initial_table_class` buckets.
    pub initial_table_class: u32,

    /// The directory doubles once `100 * len / buckets` exceeds this value.
    pub max_load_percent: usize,

    /// A size class with fewer blocks always grows instead of collecting.
    pub min_blocks_per_class: usize,

    /// The number of empty blocks that are kept for reuse, beyond this they are returned to the system.
    pub max_free_blocks: usize,

    /// The number of consecutive minor collections after which a major collection is forced.
    pub max_minors_between_majors: usize,

    /// Collect again when the previous collection reclaimed more than this percentage.
    pub good_gc_ratio: usize,

    /// Grow when the number of blocks increased by less than this percentage since the last collection.
    pub small_allocation_rate_ratio: usize,

    /// Run a major collection when old terms grew by at least this percentage since the last major collection.
    pub old_increase_rate_ratio: usize,

    /// The number of survived collections after which a term is old, at most 3.
    pub promotion_age: u8,

    /// Performs a major collection before every allocation, to find rooting mistakes.
    pub aggressive_gc: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        let block_size = 8192;

        Self {
            block_size,
            initial_max_term_size: 256,
            initial_table_class: 17,
            max_load_percent: 80,
            min_blocks_per_class: 2 * (20 << 20) / (10 * block_size * WORD_BYTES),
            max_free_blocks: 100,
            max_minors_between_majors: 10,
            good_gc_ratio: 50,
            small_allocation_rate_ratio: 75,
            old_increase_rate_ratio: 50,
            promotion_age: 3,
            aggressive_gc: false,
        }
    }
}

impl HeapConfig {
    /// A configuration that collects early and keeps few empty blocks around.
    pub fn low_memory() -> Self {
        Self {
            initial_table_class: 10,
            min_blocks_per_class: 2,
            max_free_blocks: 30,
            max_minors_between_majors: 2,
            small_allocation_rate_ratio: 25,
            ..Self::default()
        }
    }

    /// Checks that the parameters are in their supported ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size) {
            return Err(ConfigError::BlockSize(self.block_size));
        }

        if self.initial_max_term_size < 4 {
            return Err(ConfigError::InitialMaxTermSize(self.initial_max_term_size));
        }

        if !(1..=40).contains(&self.initial_table_class) {
            return Err(ConfigError::TableClass(self.initial_table_class));
        }

        if !(1..=1000).contains(&self.max_load_percent) {
            return Err(ConfigError::MaxLoad(self.max_load_percent));
        }

        if !(1..=3).contains(&self.promotion_age) {
            return Err(ConfigError::PromotionAge(self.promotion_age));
        }

        Ok(())
    }

    /// The number of words in a block of the given size class.
    pub(crate) fn block_words(&self, size: usize) -> usize {
        self.block_size.max(size)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("block size {0} is not in the range {MIN_BLOCK_SIZE}..={MAX_BLOCK_SIZE} words")]
    BlockSize(usize),

    #[error("initial maximum term size {0} is smaller than 4")]
    InitialMaxTermSize(usize),

    #[error("initial table class {0} is not in the range 1..=40")]
    TableClass(u32),

    #[error("maximum load {0}% is not in the range 1..=1000")]
    MaxLoad(usize),

    #[error("promotion age {0} is not in the range 1..=3")]
    PromotionAge(u8),
}
