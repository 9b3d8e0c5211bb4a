#![forbid(unsafe_code)]

use std::time::Instant;

use log::debug;
use tstore_utilities::debug_trace;

use crate::BlockArena;
use crate::ClassStatistics;
use crate::ConsistencyError;
use crate::Header;
use crate::Heap;
use crate::Link;
use crate::Tag;
use crate::Term;
use crate::TermKind;
use crate::WORD_BYTES;
use crate::fatal;

/// Marks terms during a collection. Passed to [crate::Markable::mark] for every
/// pinned location.
pub struct Marker<'a> {
    arena: &'a mut BlockArena,
    stack: &'a mut Vec<Term>,

    /// Terms of this age or older are not visited.
    age_limit: u8,
}

impl Marker<'_> {
    /// Marks the given term and every term reachable from it.
    pub fn mark(&mut self, term: Term) {
        if !self.visit(term) {
            return;
        }

        self.stack.push(term);
        while let Some(term) = self.stack.pop() {
            let header = self.arena.header(term);

            for position in header.references() {
                if let Some(child) = Term::from_word(self.arena.payload(term)[position]) {
                    if self.visit(child) {
                        self.stack.push(child);
                    }
                }
            }
        }
    }

    /// Sets the mark bit, returns false when the term was marked already or is
    /// too old to be visited.
    fn visit(&mut self, term: Term) -> bool {
        let header = self.arena.header(term);
        if header.is_free() {
            fatal(ConsistencyError::InvalidTerm(term.to_word()));
        }

        if header.is_marked() || header.age() >= self.age_limit {
            return false;
        }

        self.arena.set_header(term, header.with_mark(true));
        true
    }
}

#[derive(Default)]
struct SweepSummary {
    reclaimed_cells: usize,
    reclaimed_blocks: usize,
    old_bytes: usize,
}

impl Heap {
    /// Reclaims the unreachable terms of the young generation.
    ///
    /// Old terms are neither visited nor reclaimed: every sub-term of an old
    /// term is at least as old, so the young generation can be marked on its
    /// own. Blocks stay with their size class.
    pub fn collect_minor(&mut self) {
        self.collect(false);
    }

    /// Reclaims every unreachable term. Blocks without live terms are given
    /// back to the arena and unused symbols are removed.
    pub fn collect_major(&mut self) {
        self.collect(true);
    }

    fn collect(&mut self, major: bool) {
        for class in &mut self.allocator.classes {
            class.statistics = ClassStatistics {
                blocks_before_collection: class.blocks.len(),
                ..ClassStatistics::default()
            };
        }

        let mark_time = Instant::now();
        self.mark(major);
        let mark_time_elapsed = mark_time.elapsed();

        let sweep_time = Instant::now();
        let summary = self.sweep(major);
        let removed_symbols = if major { self.symbols.sweep() } else { 0 };

        if major {
            self.major_collections += 1;
            self.scheduler.minors_since_last_major = 0;
            self.scheduler.old_bytes_after_last_major = summary.old_bytes;
        } else {
            self.minor_collections += 1;
            self.scheduler.minors_since_last_major += 1;
        }
        self.scheduler.old_bytes_since_last_major = summary.old_bytes;

        debug!(
            "{} collection: marking took {}ms, sweeping took {}ms, {} terms and {} blocks reclaimed, {} symbols removed",
            if major { "Major" } else { "Minor" },
            mark_time_elapsed.as_millis(),
            sweep_time.elapsed().as_millis(),
            summary.reclaimed_cells,
            summary.reclaimed_blocks,
            removed_symbols
        );
        debug!("{}", self.metrics());
    }

    fn mark(&mut self, major: bool) {
        let mut marker = Marker {
            arena: &mut self.allocator.arena,
            stack: &mut self.stack,
            age_limit: if major { u8::MAX } else { self.config.promotion_age },
        };

        self.roots.mark(&mut marker);
        for &term in &self.temporaries {
            marker.mark(term);
        }
        marker.mark(self.empty_list);
    }

    /// Visits every cell below the used region of every block. Surviving
    /// terms lose their mark and age, the others leave the directory and
    /// become free. The free lists are rebuilt from scratch.
    ///
    /// A minor sweep skips the blocks that only held old terms at the
    /// previous sweep, they have no free cells and nothing to reclaim.
    fn sweep(&mut self, major: bool) -> SweepSummary {
        let promotion_age = self.config.promotion_age;
        let allocator = &mut self.allocator;
        let mut summary = SweepSummary::default();

        for size in 0..allocator.classes.len() {
            if allocator.classes[size].blocks.is_empty() {
                continue;
            }

            let blocks = std::mem::take(&mut allocator.classes[size].blocks);
            let current = blocks.last().copied();
            let top = allocator.classes[size].top;

            let mut retained = Vec::with_capacity(blocks.len());
            let mut free_list = None;
            let mut free_cells = 0;
            let mut reclaimed_cells = 0;
            let mut reclaimed_blocks = 0;

            for slot in blocks {
                let is_current = Some(slot) == current;
                let limit = if is_current { top } else { allocator.arena.block(slot).end() };

                if !major && !is_current && allocator.arena.block(slot).is_old() {
                    // Minor marking does not visit old terms, so they survive untouched.
                    summary.old_bytes += limit * WORD_BYTES;
                    retained.push(slot);
                    continue;
                }

                let mut free_in_block = 0;
                let mut old_in_block = 0;
                for offset in (0..limit).step_by(size) {
                    let term = Term::new(slot, offset);
                    let header = allocator.arena.header(term);

                    if header.is_free() {
                        free_in_block += 1;
                        continue;
                    }

                    let old = header.age() >= promotion_age;
                    if header.is_marked() || (!major && old) {
                        let age = if old { header.age() } else { header.age() + 1 };
                        allocator.arena.set_header(term, header.with_mark(false).with_age(age));

                        if age >= promotion_age {
                            summary.old_bytes += size * WORD_BYTES;
                            old_in_block += 1;
                        }

                        if major && header.tag() == Tag::Term(TermKind::Application) {
                            self.symbols.mark(header.symbol_index());
                        }
                    } else {
                        debug_trace!("Reclaiming {term:?} {header:?}");
                        self.directory.release(&mut allocator.arena, term);
                        allocator.arena.set_header(term, Header::FREE);

                        free_in_block += 1;
                        reclaimed_cells += 1;
                    }
                }

                if major && !is_current && free_in_block == limit / size {
                    debug_trace!("Recycling block {slot} of size class {size}");
                    allocator.arena.recycle(slot);
                    reclaimed_blocks += 1;
                    continue;
                }

                allocator
                    .arena
                    .set_old(slot, !is_current && old_in_block == limit / size);

                for offset in (0..limit).step_by(size) {
                    let term = Term::new(slot, offset);
                    if allocator.arena.header(term).is_free() {
                        allocator.arena.set_link(term, Link::FreeList(free_list));
                        free_list = Some(term);
                        free_cells += 1;
                    }
                }

                retained.push(slot);
            }

            let class = &mut allocator.classes[size];
            class.blocks = retained;
            class.free_list = free_list;
            class.free_cells = free_cells;
            class.statistics.reclaimed_cells = reclaimed_cells;
            class.statistics.reclaimed_blocks = reclaimed_blocks;

            summary.reclaimed_cells += reclaimed_cells;
            summary.reclaimed_blocks += reclaimed_blocks;
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::cell::RefCell;
    use std::rc::Rc;

    use test_log::test;
    use tstore_utilities::random_test;

    use crate::HeapConfig;
    use crate::SlotList;
    use crate::TermArray;
    use crate::TermList;
    use crate::TermSlot;
    use crate::random_term;

    use super::*;

    /// Blocks of five integer cells, and size classes that always grow.
    fn tiny_blocks() -> HeapConfig {
        HeapConfig {
            block_size: 16,
            initial_table_class: 6,
            min_blocks_per_class: 1000,
            ..HeapConfig::default()
        }
    }

    fn free_cells(heap: &Heap, size: usize) -> usize {
        heap.size_class(size).map_or(0, |class| class.free_cells)
    }

    #[test]
    fn test_unpinned_list_is_reclaimed() {
        let mut heap = Heap::new();
        let x = heap.make_int(42);
        let list = heap.make_list(&[x]);

        let slot: TermSlot = Rc::new(Cell::new(Some(list)));
        let root = heap.pin(&slot);

        heap.collect_major();
        assert!(heap.is_valid_term(list.to_word()));
        assert_eq!(heap.list_elements(list).collect::<Vec<_>>(), vec![x]);

        heap.unpin(root);
        heap.collect_major();

        assert!(!heap.classify(list.to_word()).is_term());
        assert!(!heap.classify(x.to_word()).is_term());
        assert_eq!(heap.live_term_count(), 1);
    }

    #[test]
    fn test_exclusive_descendants_are_reclaimed() {
        let mut heap = Heap::new();
        let f = heap.create_symbol("f", 2);
        let g = heap.create_symbol("g", 1);
        let h = heap.create_symbol("h", 1);
        let a = heap.create_symbol("a", 0);
        let b = heap.create_symbol("b", 0);

        let a = heap.constant(a);
        let shared = heap.apply(h, [a]);
        let shared_slot: TermSlot = Rc::new(Cell::new(Some(shared)));
        let _shared_root = heap.pin(&shared_slot);

        let b = heap.constant(b);
        let ga = heap.apply(g, [a]);
        let term = heap.apply(f, [ga, b]);
        let slot: TermSlot = Rc::new(Cell::new(Some(term)));
        let root = heap.pin(&slot);

        heap.collect_major();
        for size in 2..5 {
            assert_eq!(free_cells(&heap, size), 0, "Nothing is garbage yet");
        }
        let live = heap.live_term_count();

        heap.unpin(root);
        heap.collect_major();

        // The cells of f(g(a), b), g(a) and b, one per size class.
        assert_eq!(free_cells(&heap, 2), 1);
        assert_eq!(free_cells(&heap, 3), 1);
        assert_eq!(free_cells(&heap, 4), 1);
        assert_eq!(heap.live_term_count(), live - 3);

        assert!(heap.is_valid_term(a.to_word()));
        assert!(heap.is_valid_term(shared.to_word()));
        assert!(!heap.is_valid_term(term.to_word()));
        assert!(!heap.is_valid_term(b.to_word()));
    }

    #[test]
    fn test_free_list_reuse() {
        let mut heap = Heap::with_config(tiny_blocks()).unwrap();

        for value in 0..10 {
            heap.make_int(value);
        }
        assert_eq!(heap.size_class(3).map(|class| class.blocks), Some(2));

        heap.collect_minor();
        let class = heap.size_class(3).unwrap();
        assert_eq!(class.statistics.reclaimed_cells, 10);
        assert_eq!(class.free_cells, 10);

        let blocks = heap.block_count();
        for value in 10..20 {
            heap.make_int(value);
        }

        assert_eq!(heap.block_count(), blocks, "No block was added");
        assert_eq!(free_cells(&heap, 3), 0);

        heap.make_int(20);
        assert_eq!(heap.size_class(3).map(|class| class.blocks), Some(3));
    }

    #[test]
    fn test_minor_collection_keeps_old_terms() {
        let mut heap = Heap::with_config(HeapConfig {
            promotion_age: 1,
            ..tiny_blocks()
        })
        .unwrap();

        let young = heap.make_int(1);
        let old = heap.make_int(2);
        let slot: TermSlot = Rc::new(Cell::new(Some(old)));
        let root = heap.pin(&slot);

        // The first collection promotes the surviving term.
        heap.collect_minor();
        assert!(!heap.is_valid_term(young.to_word()));
        assert!(heap.is_valid_term(old.to_word()));

        heap.unpin(root);
        heap.collect_minor();
        assert!(heap.is_valid_term(old.to_word()), "Old terms survive minor collections");
        assert_eq!(heap.size_class(3).unwrap().statistics.reclaimed_cells, 0);

        heap.collect_major();
        assert!(!heap.is_valid_term(old.to_word()));
        assert_eq!(heap.size_class(3).unwrap().statistics.reclaimed_cells, 1);
        assert_eq!(heap.minor_collections(), 2);
        assert_eq!(heap.major_collections(), 1);
    }

    #[test]
    fn test_minor_collection_skips_old_blocks() {
        let mut heap = Heap::with_config(HeapConfig {
            promotion_age: 1,
            ..tiny_blocks()
        })
        .unwrap();

        let pinned: TermArray = Rc::new(RefCell::new(Vec::new()));
        let root = heap.pin_array(&pinned);
        for value in 0..5 {
            let term = heap.make_int(value);
            pinned.borrow_mut().push(Some(term));
        }
        heap.make_int(5);

        // Promotes the five pinned integers, which fill the first block.
        heap.collect_minor();
        assert_eq!(heap.size_class(3).unwrap().old_blocks, 1);

        heap.unpin_array(root);
        let first = pinned.borrow()[0].unwrap();
        let header = heap.allocator.arena.header(first);
        heap.allocator.arena.set_header(first, header.with_age(0));

        // A sweep of the old block would reclaim the unreachable young term.
        heap.collect_minor();
        assert!(heap.is_valid_term(first.to_word()));
        assert_eq!(heap.size_class(3).unwrap().statistics.reclaimed_cells, 0);
        assert_eq!(heap.size_class(3).unwrap().old_blocks, 1);

        heap.collect_major();
        assert!(!heap.is_valid_term(first.to_word()));
        let class = heap.size_class(3).unwrap();
        assert_eq!(class.statistics.reclaimed_cells, 5);
        assert_eq!(class.statistics.reclaimed_blocks, 1);
        assert_eq!(class.old_blocks, 0);
    }

    #[test]
    fn test_major_collection_recycles_blocks() {
        let mut heap = Heap::with_config(tiny_blocks()).unwrap();

        for value in 0..15 {
            heap.make_int(value);
        }
        let blocks = heap.block_count();
        assert_eq!(heap.size_class(3).map(|class| class.blocks), Some(3));

        heap.collect_major();

        // The bump block stays with its class, the two full blocks are recycled.
        let class = heap.size_class(3).unwrap();
        assert_eq!(class.blocks, 1);
        assert_eq!(class.free_cells, 5);
        assert_eq!(class.statistics.reclaimed_blocks, 2);
        assert_eq!(heap.recycled_block_count(), 2);

        for value in 0..6 {
            heap.make_int(value);
        }

        assert_eq!(heap.recycled_block_count(), 1);
        assert_eq!(heap.block_count(), blocks);
    }

    #[test]
    fn test_unused_symbols_are_removed() {
        let mut heap = Heap::new();
        let f = heap.create_symbol("f", 0);
        let g = heap.create_symbol("g", 0);

        let constant = heap.constant(f);
        let slot: TermSlot = Rc::new(Cell::new(Some(constant)));
        let root = heap.pin(&slot);
        heap.release_symbol(f);
        heap.release_symbol(g);

        heap.collect_major();
        assert_eq!(heap.symbol_count(), 1, "Symbol f is still used by a term");
        assert_eq!(heap.symbol_name(heap.symbol(constant)), "f");

        heap.unpin(root);
        heap.collect_major();
        assert_eq!(heap.symbol_count(), 0);
    }

    #[test]
    fn test_pinned_slot_list() {
        let mut heap = Heap::new();
        let list: TermList = Rc::new(RefCell::new(SlotList::new()));
        let root = heap.pin_list(&list);

        let a = heap.make_int(1);
        list.borrow_mut().push(Some(a));
        let b = heap.make_int(2);
        list.borrow_mut().push(Some(b));

        heap.collect_major();
        assert!(heap.is_valid_term(a.to_word()));
        assert!(heap.is_pinned(b));

        // Only the latest contents are roots.
        list.borrow_mut().pop();
        heap.collect_major();
        assert!(heap.is_valid_term(a.to_word()));
        assert!(!heap.is_valid_term(b.to_word()));

        heap.unpin_list(root);
        heap.collect_major();
        assert!(!heap.is_valid_term(a.to_word()));
    }

    #[test]
    fn test_automatic_collection_bounds_heap() {
        let mut heap = Heap::with_config(HeapConfig {
            min_blocks_per_class: 2,
            ..tiny_blocks()
        })
        .unwrap();

        for value in 0..1000 {
            heap.make_int(value);
        }

        assert!(heap.minor_collections() + heap.major_collections() > 0);
        assert!(heap.size_class(3).unwrap().blocks <= 3);
    }

    #[test]
    fn test_disabled_collection_grows() {
        let mut heap = Heap::with_config(HeapConfig {
            min_blocks_per_class: 2,
            ..tiny_blocks()
        })
        .unwrap();
        heap.automatic_garbage_collection(false);

        for value in 0..1000 {
            heap.make_int(value);
        }

        assert_eq!(heap.minor_collections() + heap.major_collections(), 0);
        assert_eq!(heap.size_class(3).unwrap().blocks, 200);
        assert_eq!(heap.live_term_count(), 1001);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_random_reachability() {
        random_test(10, |rng| {
            let mut heap = Heap::with_config(HeapConfig {
                block_size: 256,
                initial_table_class: 8,
                aggressive_gc: true,
                ..HeapConfig::default()
            })
            .unwrap();

            let pinned: TermArray = Rc::new(RefCell::new(Vec::new()));
            let root = heap.pin_array(&pinned);

            let mut expected = Vec::new();
            for _ in 0..5 {
                let term = random_term(&mut heap, rng, &[("f", 2), ("g", 1)], &["a", "b"], 10);
                pinned.borrow_mut().push(Some(term));
                expected.push(format!("{}", heap.display(term)));
            }

            heap.collect_minor();
            heap.collect_major();

            for (term, representation) in pinned.borrow().iter().flatten().zip(&expected) {
                assert!(heap.is_valid_term(term.to_word()));
                assert_eq!(heap.find(*term), Some(*term));
                assert_eq!(&format!("{}", heap.display(*term)), representation);
            }

            heap.unpin_array(root);
            heap.collect_major();
            assert_eq!(heap.live_term_count(), 1, "Only the empty list remains");
            assert_eq!(heap.symbol_count(), 0);
        });
    }
}
