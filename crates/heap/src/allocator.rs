use std::alloc::Layout;
use std::alloc::handle_alloc_error;
use std::fmt;

use itertools::Itertools;
use log::debug;
use log::error;

use crate::BlockArena;
use crate::ConsistencyError;
use crate::HeapConfig;
use crate::Link;
use crate::Term;
use crate::fatal;

/// Statistics of a size class that drive the collection scheduler. They are
/// reset at the start of every collection.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ClassStatistics {
    /// The number of blocks the class owned when the last collection started.
    pub blocks_before_collection: usize,

    /// The number of cells the last collection reclaimed.
    pub reclaimed_cells: usize,

    /// The number of blocks the last collection gave back to the arena.
    pub reclaimed_blocks: usize,
}

/// A read-only view on a size class.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SizeClassMetrics {
    pub size: usize,
    pub blocks: usize,
    pub free_cells: usize,

    /// The blocks that are skipped by minor collections.
    pub old_blocks: usize,

    pub statistics: ClassStatistics,
}

/// The allocation state of all cells with the same number of words.
#[derive(Default)]
pub(crate) struct SizeClass {
    /// Slots of the blocks of this class, the last one is the bump block.
    pub blocks: Vec<usize>,

    /// The bump cursor into the last block.
    pub top: usize,

    pub free_list: Option<Term>,
    pub free_cells: usize,
    pub statistics: ClassStatistics,
}

impl SizeClass {
    /// Returns true iff the given block is the bump block of this class.
    pub fn is_current(&self, slot: usize) -> bool {
        self.blocks.last() == Some(&slot)
    }
}

/// Hands out zeroed cells per size class: first from the bump region of the
/// current block, then from the free list. Deciding what to do when both are
/// exhausted is left to the heap.
pub(crate) struct CellAllocator {
    pub arena: BlockArena,
    pub classes: Vec<SizeClass>,
    allocated_count: u64,
}

impl CellAllocator {
    pub fn new(config: &HeapConfig) -> Self {
        let mut classes = Vec::new();
        classes.resize_with(config.initial_max_term_size, SizeClass::default);

        Self {
            arena: BlockArena::new(config.block_size, config.max_free_blocks),
            classes,
            allocated_count: 0,
        }
    }

    /// The number of size classes, cells up to `max_term_size() - 1` words can be allocated.
    pub fn max_term_size(&self) -> usize {
        self.classes.len()
    }

    /// Returns the number of allocation requests so far.
    pub fn allocated_count(&self) -> u64 {
        self.allocated_count
    }

    pub fn count_allocation(&mut self) {
        self.allocated_count += 1;
    }

    pub fn class(&self, size: usize) -> &SizeClass {
        &self.classes[size]
    }

    pub fn metrics(&self, size: usize) -> Option<SizeClassMetrics> {
        self.classes.get(size).map(|class| SizeClassMetrics {
            size,
            blocks: class.blocks.len(),
            free_cells: class.free_cells,
            old_blocks: class
                .blocks
                .iter()
                .filter(|&&slot| self.arena.block(slot).is_old())
                .count(),
            statistics: class.statistics,
        })
    }

    /// Grows the class table so that cells of `size` words are supported.
    /// The table at least doubles, unless that much memory is not available.
    pub fn ensure_class(&mut self, size: usize) {
        let length = self.classes.len();
        if size < length {
            return;
        }

        let needed = size + 1;
        let mut new_length = needed.max(2 * length);
        if self.classes.try_reserve_exact(new_length - length).is_err() {
            new_length = needed;
            if self.classes.try_reserve_exact(new_length - length).is_err() {
                error!("Failed to grow the size class table to {new_length} entries");
                handle_alloc_error(Layout::new::<SizeClass>())
            }
        }

        self.classes.resize_with(new_length, SizeClass::default);
        debug!("Grew the size class table from {length} to {new_length} entries");
    }

    /// Returns a zeroed cell from the bump region or the free list of the class.
    pub fn try_allocate(&mut self, size: usize) -> Option<Term> {
        let class = &mut self.classes[size];

        if let Some(&slot) = class.blocks.last() {
            if class.top + size <= self.arena.block(slot).end() {
                let term = Term::new(slot, class.top);
                class.top += size;
                return Some(term);
            }
        }

        let term = class.free_list?;
        class.free_list = match self.arena.link(term) {
            Link::FreeList(next) => next,
            Link::Bucket(_) => fatal(ConsistencyError::LinkRole {
                term,
                role: "free list",
            }),
        };
        class.free_cells -= 1;

        self.arena.cell_mut(term).fill(0);
        Some(term)
    }

    /// Adds a block to the class and returns its first cell.
    pub fn grow(&mut self, size: usize) -> Term {
        let slot = self.arena.acquire(size);

        let class = &mut self.classes[size];
        class.blocks.push(slot);
        class.top = size;

        Term::new(slot, 0)
    }

    /// Iterates over the cells on the free list of the class.
    pub fn free_list(&self, size: usize) -> impl Iterator<Item = Term> + '_ {
        let mut current = self.classes[size].free_list;

        std::iter::from_fn(move || {
            let term = current?;
            current = self.arena.link(term).target();
            Some(term)
        })
    }
}

impl fmt::Debug for CellAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (size, class) in self.classes.iter().enumerate() {
            if !class.blocks.is_empty() {
                writeln!(
                    f,
                    "size {size}: blocks [{}], top {}, free [{:?}]",
                    class.blocks.iter().format(", "),
                    class.top,
                    self.free_list(size).format(", ")
                )?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::Header;

    fn config() -> HeapConfig {
        HeapConfig {
            block_size: 16,
            initial_max_term_size: 8,
            ..HeapConfig::default()
        }
    }

    #[test]
    fn test_bump_allocation() {
        let mut allocator = CellAllocator::new(&config());

        assert_eq!(allocator.try_allocate(3), None);
        let first = allocator.grow(3);
        assert_eq!(first.offset(), 0);

        // Five cells of three words fit in a block of sixteen words.
        let offsets: Vec<usize> = (0..4).filter_map(|_| allocator.try_allocate(3).map(Term::offset)).collect();
        assert_eq!(offsets, vec![3, 6, 9, 12]);
        assert_eq!(allocator.try_allocate(3), None);
        assert_eq!(allocator.class(3).blocks.len(), 1);
    }

    #[test]
    fn test_free_list_allocation() {
        let mut allocator = CellAllocator::new(&config());
        let first = allocator.grow(4);
        let second = allocator.try_allocate(4).unwrap();
        while allocator.try_allocate(4).is_some() {}

        // Thread both cells onto the free list the way a sweep does.
        for term in [first, second] {
            allocator.arena.set_header(term, Header::FREE);
            let head = allocator.classes[4].free_list;
            allocator.arena.set_link(term, Link::FreeList(head));
            allocator.arena.cell_mut(term)[2] = 99;
            allocator.classes[4].free_list = Some(term);
            allocator.classes[4].free_cells += 1;
        }

        assert_eq!(allocator.free_list(4).collect::<Vec<_>>(), vec![second, first]);
        assert_eq!(allocator.try_allocate(4), Some(second));
        assert!(allocator.arena.cell(second).iter().all(|&word| word == 0));
        assert_eq!(allocator.try_allocate(4), Some(first));
        assert_eq!(allocator.try_allocate(4), None);
        assert_eq!(allocator.class(4).free_cells, 0);
    }

    #[test]
    fn test_ensure_class_doubles() {
        let mut allocator = CellAllocator::new(&config());
        assert_eq!(allocator.max_term_size(), 8);

        allocator.ensure_class(7);
        assert_eq!(allocator.max_term_size(), 8);

        allocator.ensure_class(8);
        assert_eq!(allocator.max_term_size(), 16);

        allocator.ensure_class(100);
        assert_eq!(allocator.max_term_size(), 101);
    }
}
