#![forbid(unsafe_code)]

use crate::ClassStatistics;
use crate::HeapConfig;
use crate::WORD_BYTES;

/// What to do when a size class has no free cell left.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Add a block to the size class.
    Grow,

    /// Collect the young generation.
    Minor,

    /// Collect the whole heap.
    Major,
}

/// Chooses between growing and collecting from the statistics of the
/// previous collections.
#[derive(Debug, Default)]
pub(crate) struct Scheduler {
    pub minors_since_last_major: usize,

    /// Bytes in old terms right after the last major collection.
    pub old_bytes_after_last_major: usize,

    /// Bytes in old terms after the most recent collection.
    pub old_bytes_since_last_major: usize,
}

impl Scheduler {
    /// Decides for size class `size`, which owns `blocks` blocks and has
    /// `statistics` from the previous collection.
    ///
    /// 1. A class with fewer than [HeapConfig::min_blocks_per_class] blocks grows.
    /// 2. When the previous collection reclaimed more than [HeapConfig::good_gc_ratio]
    ///    percent of the class, collect again. This is a minor collection unless
    ///    [HeapConfig::max_minors_between_majors] minors ran since the last major.
    /// 3. When the class grew by less than [HeapConfig::small_allocation_rate_ratio]
    ///    percent since the previous collection, grow.
    /// 4. Otherwise run a major collection when the old generation grew by at
    ///    least [HeapConfig::old_increase_rate_ratio] percent since the last
    ///    major collection, and a minor collection when it did not.
    pub fn decide(&self, config: &HeapConfig, size: usize, blocks: usize, statistics: &ClassStatistics) -> Decision {
        if blocks < config.min_blocks_per_class {
            return Decision::Grow;
        }

        let reclaimed_bytes = statistics.reclaimed_cells * size * WORD_BYTES;
        let block_bytes = config.block_words(size) * WORD_BYTES;
        let reclaimed_ratio = 100 * reclaimed_bytes / (1 + statistics.blocks_before_collection * block_bytes);

        if reclaimed_ratio > config.good_gc_ratio {
            return if self.minors_since_last_major < config.max_minors_between_majors {
                Decision::Minor
            } else {
                Decision::Major
            };
        }

        let allocation_rate =
            100 * blocks.saturating_sub(statistics.blocks_before_collection) / (1 + statistics.blocks_before_collection);
        if allocation_rate < config.small_allocation_rate_ratio {
            return Decision::Grow;
        }

        let old_increase_rate = 100
            * self
                .old_bytes_since_last_major
                .saturating_sub(self.old_bytes_after_last_major)
            / (1 + self.old_bytes_after_last_major);
        if old_increase_rate < config.old_increase_rate_ratio {
            Decision::Minor
        } else {
            Decision::Major
        }
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn config() -> HeapConfig {
        HeapConfig {
            block_size: 128,
            min_blocks_per_class: 4,
            max_minors_between_majors: 2,
            good_gc_ratio: 50,
            small_allocation_rate_ratio: 75,
            old_increase_rate_ratio: 50,
            ..HeapConfig::default()
        }
    }

    fn statistics(blocks_before_collection: usize, reclaimed_cells: usize) -> ClassStatistics {
        ClassStatistics {
            blocks_before_collection,
            reclaimed_cells,
            reclaimed_blocks: 0,
        }
    }

    // Cells of four words, 32 per block of 128 words.
    #[test_case(3, statistics(0, 0), 0, 0, 0 => Decision::Grow ; "too few blocks")]
    #[test_case(4, statistics(4, 100), 0, 0, 0 => Decision::Minor ; "good reclamation")]
    #[test_case(4, statistics(4, 100), 2, 0, 0 => Decision::Major ; "good reclamation after many minors")]
    #[test_case(6, statistics(4, 10), 0, 0, 0 => Decision::Grow ; "low allocation rate")]
    #[test_case(10, statistics(4, 10), 0, 1000, 1200 => Decision::Minor ; "slow old growth")]
    #[test_case(10, statistics(4, 10), 0, 1000, 2000 => Decision::Major ; "fast old growth")]
    #[test_case(10, statistics(0, 0), 0, 0, 0 => Decision::Minor ; "degenerate baseline")]
    fn test_decide(blocks: usize, statistics: ClassStatistics, minors: usize, old_after: usize, old_since: usize) -> Decision {
        let scheduler = Scheduler {
            minors_since_last_major: minors,
            old_bytes_after_last_major: old_after,
            old_bytes_since_last_major: old_since,
        };

        scheduler.decide(&config(), 4, blocks, &statistics)
    }
}
