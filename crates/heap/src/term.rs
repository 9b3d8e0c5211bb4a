#![forbid(unsafe_code)]

use std::fmt;
use std::num::NonZeroU64;
use std::ops::Range;

use crate::ConsistencyError;
use crate::fatal;

/// The unit of storage, every cell is an array of words.
pub type Word = u64;

/// The number of bytes in a [Word].
pub const WORD_BYTES: usize = size_of::<Word>();

/// The largest arity of an application, and the saturation point of list lengths.
pub const MAX_ARITY: usize = (1 << 24) - 1;

/// Every cell starts with a header word followed by the link word.
pub(crate) const CELL_PREFIX: usize = 2;

pub(crate) const INT_SIZE: usize = CELL_PREFIX + 1;
pub(crate) const LIST_SIZE: usize = CELL_PREFIX + 2;

/// Returns the cell size of an application with the given arity.
pub(crate) fn application_size(arity: usize) -> usize {
    CELL_PREFIX + arity
}

/// Returns the cell size of a blob with the given number of bytes. The first
/// payload word stores the byte length.
pub(crate) fn blob_size(length: usize) -> usize {
    CELL_PREFIX + 1 + length.div_ceil(WORD_BYTES)
}

/// A handle to a term in a [crate::Heap].
///
/// The handle names the cell of the term as a block slot and a word offset in
/// that block. The heap stores every term at most once, so two handles are
/// equal iff the terms they refer to are equal.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Term(NonZeroU64);

impl Term {
    pub(crate) fn new(slot: usize, offset: usize) -> Term {
        debug_assert!(offset <= u32::MAX as usize, "Offset {offset} does not fit in a handle");
        let word = ((slot as u64 + 1) << 32) | offset as u64;

        match NonZeroU64::new(word) {
            Some(word) => Term(word),
            None => fatal(ConsistencyError::InvalidTerm(word)),
        }
    }

    /// Returns the word representation of this handle, it is never zero.
    pub fn to_word(self) -> Word {
        self.0.get()
    }

    /// Converts a word back into a handle, zero is not a handle.
    ///
    /// The result is only meaningful for words obtained from [Term::to_word],
    /// use [crate::Heap::classify] to check whether it refers to a live term.
    pub fn from_word(word: Word) -> Option<Term> {
        NonZeroU64::new(word).map(Term)
    }

    /// Converts a payload word that must hold a reference.
    pub(crate) fn from_reference(word: Word) -> Term {
        match Term::from_word(word) {
            Some(term) => term,
            None => fatal(ConsistencyError::InvalidTerm(word)),
        }
    }

    pub(crate) fn slot(self) -> usize {
        ((self.0.get() >> 32) - 1) as usize
    }

    pub(crate) fn offset(self) -> usize {
        (self.0.get() & 0xFFFF_FFFF) as usize
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Term({}:{})", self.slot(), self.offset())
    }
}

/// The kind of value stored in a term.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TermKind {
    Int,
    List,
    Application,
    Blob,
}

/// The type tag of a cell, free cells are not terms.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Tag {
    Free,
    Term(TermKind),
}

const TAG_MASK: Word = 0b111;
const MARK_BIT: Word = 1 << 3;
const AGE_SHIFT: u32 = 4;
const AGE_MASK: Word = 0b11 << AGE_SHIFT;
const LENGTH_SHIFT: u32 = 8;
const LENGTH_MASK: Word = (MAX_ARITY as Word) << LENGTH_SHIFT;
const SYMBOL_SHIFT: u32 = 32;

const TAG_FREE: Word = 0;
const TAG_INT: Word = 1;
const TAG_LIST: Word = 2;
const TAG_APPLICATION: Word = 3;
const TAG_BLOB: Word = 4;

/// The first word of every cell.
///
/// Layout, from the least significant bit: the tag (3 bits), the mark bit,
/// the age (2 bits), two unused bits, the length (24 bits, the arity of an
/// application or the saturated length of a list) and the symbol index of an
/// application (32 bits). A zero word is the header of a free cell.
#[derive(Copy, Clone, PartialEq, Eq)]
pub(crate) struct Header(Word);

impl Header {
    pub const FREE: Header = Header(TAG_FREE);

    pub fn application(symbol_index: u32, arity: usize) -> Header {
        debug_assert!(arity <= MAX_ARITY);
        Header(TAG_APPLICATION | ((arity as Word) << LENGTH_SHIFT) | ((symbol_index as Word) << SYMBOL_SHIFT))
    }

    pub fn int() -> Header {
        Header(TAG_INT)
    }

    /// The header of a list cell, lengths beyond [MAX_ARITY] are saturated.
    pub fn list(length: usize) -> Header {
        Header(TAG_LIST | ((length.min(MAX_ARITY) as Word) << LENGTH_SHIFT))
    }

    pub fn blob() -> Header {
        Header(TAG_BLOB)
    }

    pub fn from_word(word: Word) -> Header {
        Header(word)
    }

    pub fn to_word(self) -> Word {
        self.0
    }

    pub fn tag(self) -> Tag {
        match self.0 & TAG_MASK {
            TAG_FREE => Tag::Free,
            TAG_INT => Tag::Term(TermKind::Int),
            TAG_LIST => Tag::Term(TermKind::List),
            TAG_APPLICATION => Tag::Term(TermKind::Application),
            TAG_BLOB => Tag::Term(TermKind::Blob),
            _ => fatal(ConsistencyError::CorruptHeader(self.0)),
        }
    }

    pub fn is_free(self) -> bool {
        self.0 & TAG_MASK == TAG_FREE
    }

    pub fn is_marked(self) -> bool {
        self.0 & MARK_BIT != 0
    }

    pub fn with_mark(self, marked: bool) -> Header {
        if marked {
            Header(self.0 | MARK_BIT)
        } else {
            Header(self.0 & !MARK_BIT)
        }
    }

    pub fn age(self) -> u8 {
        ((self.0 & AGE_MASK) >> AGE_SHIFT) as u8
    }

    pub fn with_age(self, age: u8) -> Header {
        debug_assert!(age <= 3);
        Header((self.0 & !AGE_MASK) | ((age as Word) << AGE_SHIFT))
    }

    pub fn length(self) -> usize {
        ((self.0 & LENGTH_MASK) >> LENGTH_SHIFT) as usize
    }

    pub fn symbol_index(self) -> u32 {
        (self.0 >> SYMBOL_SHIFT) as u32
    }

    /// The header without the collector bits, used for hashing and equality.
    pub fn hidden(self) -> Word {
        self.0 & !(MARK_BIT | AGE_MASK)
    }

    /// The payload positions that hold references to sub-terms.
    pub fn references(self) -> Range<usize> {
        match self.tag() {
            Tag::Term(TermKind::Application) => 0..self.length(),
            Tag::Term(TermKind::List) => 0..2,
            _ => 0..0,
        }
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Header({:?}, length: {}, symbol: {}, age: {}, marked: {})",
            self.tag(),
            self.length(),
            self.symbol_index(),
            self.age(),
            self.is_marked()
        )
    }
}

/// The second word of every cell, its role depends on whether the cell is free.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Link {
    /// The next term in the same directory bucket.
    Bucket(Option<Term>),

    /// The next cell on the free list of the size class.
    FreeList(Option<Term>),
}

impl Link {
    pub fn target(self) -> Option<Term> {
        match self {
            Link::Bucket(next) | Link::FreeList(next) => next,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_term_word_conversion() {
        let term = Term::new(0, 0);
        assert_ne!(term.to_word(), 0);
        assert_eq!(Term::from_word(term.to_word()), Some(term));
        assert_eq!(Term::from_word(0), None);

        let term = Term::new(12345, 8191);
        assert_eq!(term.slot(), 12345);
        assert_eq!(term.offset(), 8191);
    }

    #[test]
    fn test_header_fields() {
        let header = Header::application(77, 3).with_age(2).with_mark(true);

        assert_eq!(header.tag(), Tag::Term(TermKind::Application));
        assert_eq!(header.symbol_index(), 77);
        assert_eq!(header.length(), 3);
        assert_eq!(header.age(), 2);
        assert!(header.is_marked());
        assert_eq!(header.hidden(), Header::application(77, 3).to_word());
        assert_eq!(header.references(), 0..3);

        let cleared = header.with_mark(false).with_age(0);
        assert_eq!(cleared, Header::application(77, 3));
    }

    #[test]
    fn test_header_kinds() {
        assert!(Header::FREE.is_free());
        assert_eq!(Header::from_word(0).tag(), Tag::Free);
        assert_eq!(Header::int().references(), 0..0);
        assert_eq!(Header::blob().tag(), Tag::Term(TermKind::Blob));
        assert_eq!(Header::list(0).references(), 0..2);
        assert_eq!(Header::list(usize::MAX).length(), MAX_ARITY);
    }

    #[test]
    #[should_panic]
    fn test_corrupt_header() {
        Header::from_word(0b111).tag();
    }

    #[test]
    fn test_cell_sizes() {
        assert_eq!(application_size(0), 2);
        assert_eq!(application_size(2), 4);
        assert_eq!(blob_size(0), 3);
        assert_eq!(blob_size(1), 4);
        assert_eq!(blob_size(8), 4);
        assert_eq!(blob_size(9), 5);
    }
}
