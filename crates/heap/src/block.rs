use std::alloc::Layout;
use std::alloc::handle_alloc_error;
use std::ptr::NonNull;

use allocator_api2::alloc::Allocator;
use allocator_api2::alloc::Global;
use log::debug;
use log::error;

use crate::CELL_PREFIX;
use crate::ConsistencyError;
use crate::Header;
use crate::Link;
use crate::Term;
use crate::Word;
use crate::fatal;

/// A zero initialised chunk of words that is carved into cells of one size.
pub(crate) struct Block {
    memory: NonNull<Word>,
    capacity: usize,

    /// The cell size, zero when the block is on the recycled list.
    size: usize,

    /// The end of the region that fits whole cells.
    end: usize,

    /// Set by a sweep that found only old terms in the block.
    old: bool,
}

impl Block {
    /// Obtains a zeroed block of `capacity` words from the system, aborts when
    /// no memory is available.
    fn allocate(capacity: usize) -> Block {
        let layout = Self::layout(capacity);

        match Global.allocate_zeroed(layout) {
            Ok(memory) => Block {
                memory: memory.cast::<Word>(),
                capacity,
                size: 0,
                end: 0,
                old: false,
            },
            Err(_) => {
                error!("Failed to allocate a block of {capacity} words");
                handle_alloc_error(layout)
            }
        }
    }

    fn layout(capacity: usize) -> Layout {
        match Layout::array::<Word>(capacity) {
            Ok(layout) => layout,
            Err(_) => {
                error!("A block of {capacity} words exceeds the address space");
                handle_alloc_error(Layout::new::<Word>())
            }
        }
    }

    /// Prepares the block for cells of the given size.
    fn assign(&mut self, size: usize) {
        debug_assert!(size > 0 && size <= self.capacity);
        self.size = size;
        self.end = self.capacity - self.capacity % size;
        self.old = false;
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns true iff every cell of the block held an old term at the last sweep.
    pub fn is_old(&self) -> bool {
        self.old
    }

    pub fn words(&self) -> &[Word] {
        // SAFETY: The memory holds `capacity` initialised words and is owned by this block.
        unsafe { std::slice::from_raw_parts(self.memory.as_ptr(), self.capacity) }
    }

    pub fn words_mut(&mut self) -> &mut [Word] {
        // SAFETY: As in `words`, and the mutable borrow of self makes the access unique.
        unsafe { std::slice::from_raw_parts_mut(self.memory.as_ptr(), self.capacity) }
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        // SAFETY: The memory was allocated by `Global` with exactly this layout.
        unsafe { Global.deallocate(self.memory.cast(), Self::layout(self.capacity)) }
    }
}

/// Owns every block of a heap. The slot of a block in the arena is the block
/// part of the handles of its cells, slots are reused after their block has
/// been returned to the system.
pub(crate) struct BlockArena {
    slots: Vec<Option<Block>>,

    /// Slots without a block.
    vacant: Vec<usize>,

    /// Slots of empty blocks that are kept for reuse.
    recycled: Vec<usize>,

    block_size: usize,
    max_free_blocks: usize,
}

impl BlockArena {
    pub fn new(block_size: usize, max_free_blocks: usize) -> Self {
        Self {
            slots: Vec::new(),
            vacant: Vec::new(),
            recycled: Vec::new(),
            block_size,
            max_free_blocks,
        }
    }

    /// Returns a zeroed block for cells of the given size, reusing a recycled block when possible.
    pub fn acquire(&mut self, size: usize) -> usize {
        let capacity = self.block_size.max(size);

        let reusable = self
            .recycled
            .iter()
            .rposition(|&slot| self.slots[slot].as_ref().is_some_and(|block| block.capacity >= capacity));

        if let Some(position) = reusable {
            let slot = self.recycled.swap_remove(position);
            let block = self.block_mut(slot);
            block.words_mut().fill(0);
            block.assign(size);
            return slot;
        }

        let mut block = Block::allocate(capacity);
        block.assign(size);

        match self.vacant.pop() {
            Some(slot) => {
                self.slots[slot] = Some(block);
                slot
            }
            None => {
                self.slots.push(Some(block));
                self.slots.len() - 1
            }
        }
    }

    /// Takes the block out of its size class. It is kept for reuse unless
    /// [crate::HeapConfig::max_free_blocks] empty blocks are kept already,
    /// then its memory is returned to the system.
    pub fn recycle(&mut self, slot: usize) {
        if self.recycled.len() >= self.max_free_blocks {
            debug!("Returning block {slot} to the system");
            self.slots[slot] = None;
            self.vacant.push(slot);
        } else {
            let block = self.block_mut(slot);
            block.size = 0;
            block.end = 0;
            block.old = false;
            self.recycled.push(slot);
        }
    }

    /// Returns the number of blocks, including recycled ones.
    pub fn block_count(&self) -> usize {
        self.slots.len() - self.vacant.len()
    }

    /// The number of words in all blocks, including recycled ones.
    pub fn allocated_words(&self) -> usize {
        self.slots.iter().flatten().map(Block::capacity).sum()
    }

    pub fn recycled_count(&self) -> usize {
        self.recycled.len()
    }

    /// Returns the block in the given slot, if any.
    pub fn get(&self, slot: usize) -> Option<&Block> {
        self.slots.get(slot).and_then(|block| block.as_ref())
    }

    pub fn block(&self, slot: usize) -> &Block {
        match self.get(slot) {
            Some(block) => block,
            None => fatal(ConsistencyError::InvalidTerm(Term::new(slot, 0).to_word())),
        }
    }

    fn block_mut(&mut self, slot: usize) -> &mut Block {
        match self.slots.get_mut(slot).and_then(|block| block.as_mut()) {
            Some(block) => block,
            None => fatal(ConsistencyError::InvalidTerm(Term::new(slot, 0).to_word())),
        }
    }

    pub fn set_old(&mut self, slot: usize, old: bool) {
        self.block_mut(slot).old = old;
    }

    /// The words of the cell at the given handle.
    pub fn cell(&self, term: Term) -> &[Word] {
        let block = self.block(term.slot());
        if block.size == 0 || term.offset() + block.size > block.end {
            fatal(ConsistencyError::InvalidTerm(term.to_word()));
        }

        &block.words()[term.offset()..term.offset() + block.size]
    }

    pub fn cell_mut(&mut self, term: Term) -> &mut [Word] {
        let block = self.block_mut(term.slot());
        let size = block.size;
        if size == 0 || term.offset() + size > block.end {
            fatal(ConsistencyError::InvalidTerm(term.to_word()));
        }

        &mut block.words_mut()[term.offset()..term.offset() + size]
    }

    pub fn header(&self, term: Term) -> Header {
        Header::from_word(self.cell(term)[0])
    }

    pub fn set_header(&mut self, term: Term, header: Header) {
        self.cell_mut(term)[0] = header.to_word();
    }

    pub fn payload(&self, term: Term) -> &[Word] {
        &self.cell(term)[CELL_PREFIX..]
    }

    /// Reads the link word in the role given by the header of the cell.
    pub fn link(&self, term: Term) -> Link {
        let cell = self.cell(term);
        let next = Term::from_word(cell[1]);

        if Header::from_word(cell[0]).is_free() {
            Link::FreeList(next)
        } else {
            Link::Bucket(next)
        }
    }

    /// Writes the link word, the role of the link must match the header of the cell.
    pub fn set_link(&mut self, term: Term, link: Link) {
        let free = self.header(term).is_free();

        match link {
            Link::Bucket(_) if free => fatal(ConsistencyError::LinkRole { term, role: "bucket" }),
            Link::FreeList(_) if !free => fatal(ConsistencyError::LinkRole { term, role: "free list" }),
            _ => {}
        }

        self.cell_mut(term)[1] = link.target().map_or(0, Term::to_word);
    }

    /// Returns the successor of a live term in its directory bucket.
    pub fn bucket_link(&self, term: Term) -> Option<Term> {
        match self.link(term) {
            Link::Bucket(next) => next,
            Link::FreeList(_) => fatal(ConsistencyError::LinkRole { term, role: "bucket" }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_is_zeroed() {
        let mut arena = BlockArena::new(16, 4);
        let slot = arena.acquire(3);

        let block = arena.block(slot);
        assert_eq!(block.size(), 3);
        assert_eq!(block.end(), 15);
        assert!(block.words().iter().all(|&word| word == 0));
        assert_eq!(arena.block_count(), 1);
        assert_eq!(arena.allocated_words(), 16);
    }

    #[test]
    fn test_large_cells_get_their_own_block() {
        let mut arena = BlockArena::new(16, 4);
        let slot = arena.acquire(40);

        assert_eq!(arena.block(slot).capacity(), 40);
        assert_eq!(arena.block(slot).end(), 40);
    }

    #[test]
    fn test_recycle_and_reuse() {
        let mut arena = BlockArena::new(16, 1);
        let first = arena.acquire(4);
        let second = arena.acquire(4);

        arena.cell_mut(Term::new(first, 4))[0] = 42;
        arena.set_old(first, true);
        arena.recycle(first);
        assert_eq!(arena.recycled_count(), 1);
        assert_eq!(arena.block(first).size(), 0);

        // The recycled list is full, so this block is released.
        arena.recycle(second);
        assert_eq!(arena.recycled_count(), 1);
        assert!(arena.get(second).is_none());
        assert_eq!(arena.block_count(), 1);

        let reused = arena.acquire(5);
        assert_eq!(reused, first);
        assert!(!arena.block(reused).is_old());
        assert_eq!(arena.block(reused).end(), 15);
        assert!(arena.block(reused).words().iter().all(|&word| word == 0));

        // Takes the vacant slot.
        assert_eq!(arena.acquire(4), second);
    }

    #[test]
    fn test_link_roles() {
        let mut arena = BlockArena::new(16, 1);
        let slot = arena.acquire(4);
        let cell = Term::new(slot, 0);
        let next = Term::new(slot, 4);

        arena.set_link(cell, Link::FreeList(Some(next)));
        assert_eq!(arena.link(cell), Link::FreeList(Some(next)));

        arena.set_header(cell, Header::list(0));
        assert_eq!(arena.link(cell), Link::Bucket(Some(next)));
        arena.set_link(cell, Link::Bucket(None));
        assert_eq!(arena.bucket_link(cell), None);
    }

    #[test]
    #[should_panic]
    fn test_bucket_link_on_free_cell() {
        let mut arena = BlockArena::new(16, 1);
        let slot = arena.acquire(4);
        arena.set_link(Term::new(slot, 0), Link::Bucket(None));
    }
}
