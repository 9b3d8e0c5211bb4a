#![forbid(unsafe_code)]

use crate::CellAllocator;
use crate::Term;
use crate::Word;

/// What an arbitrary word refers to in a heap.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AddressClass {
    /// The header of a live term.
    Term(Term),

    /// A word inside a live term, which starts at the given handle.
    InsideTerm(Term),

    /// A word inside a block that is not used by a live term.
    Free,

    /// Not a word of any block of the heap.
    Outside,
}

impl AddressClass {
    /// Returns true iff the address refers to the header of a live term.
    pub fn is_term(self) -> bool {
        matches!(self, AddressClass::Term(_))
    }
}

impl CellAllocator {
    /// Classifies a word in constant time: the block is found through its
    /// slot and the enclosing cell by rounding the offset down to the cell size.
    pub fn classify(&self, word: Word) -> AddressClass {
        // Handles store the block slot plus one in the upper half.
        if word >> 32 == 0 {
            return AddressClass::Outside;
        }

        let Some(address) = Term::from_word(word) else {
            return AddressClass::Outside;
        };

        let slot = address.slot();
        let Some(block) = self.arena.get(slot) else {
            return AddressClass::Outside;
        };

        let size = block.size();
        if size == 0 {
            // The block is on the recycled list.
            return AddressClass::Outside;
        }

        let class = self.class(size);
        let limit = if class.is_current(slot) { class.top } else { block.end() };
        if address.offset() >= limit {
            return AddressClass::Outside;
        }

        let start = Term::new(slot, address.offset() - address.offset() % size);
        if self.arena.header(start).is_free() {
            AddressClass::Free
        } else if start == address {
            AddressClass::Term(start)
        } else {
            AddressClass::InsideTerm(start)
        }
    }

    /// Returns true iff the word is exactly the handle of a live term.
    pub fn is_valid_term(&self, word: Word) -> bool {
        self.classify(word).is_term()
    }
}
