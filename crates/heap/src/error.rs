#![forbid(unsafe_code)]

use log::error;
use thiserror::Error;

use crate::Symbol;
use crate::Term;
use crate::TermKind;
use crate::Word;

/// Violations of the heap invariants. These are programming errors in the
/// heap or in its client, continuing would silently corrupt the store, so they
/// are raised through [fatal] and never returned.
#[derive(Debug, Error)]
pub enum ConsistencyError {
    #[error("symbol {name} has arity {expected} but was applied to {actual} arguments")]
    ArityMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("arity {0} exceeds the maximum arity of a symbol")]
    ArityTooLarge(usize),

    #[error("argument {index} is out of range for a term of arity {arity}")]
    ArgumentOutOfRange { index: usize, arity: usize },

    #[error("{0:?} is not present in its directory bucket")]
    MissingFromBucket(Term),

    #[error("expected a term of kind {expected:?} but {term:?} is of kind {actual:?}")]
    WrongKind {
        term: Term,
        expected: TermKind,
        actual: TermKind,
    },

    #[error("the empty list has no head or tail")]
    EmptyList,

    #[error("word {0:#x} does not refer to a live term")]
    InvalidTerm(Word),

    #[error("a {role} link cannot be stored in {term:?}")]
    LinkRole { term: Term, role: &'static str },

    #[error("header {0:#x} has an invalid tag")]
    CorruptHeader(Word),

    #[error("{0:?} has been removed from the symbol table")]
    StaleSymbol(Symbol),

    #[error("{0:?} was released more often than it was created")]
    UnbalancedRelease(Symbol),

    #[error("{0} is not pinned in this heap")]
    UnknownRoot(String),
}

/// Reports a consistency violation and stops the program. Behaves the same in
/// debug and release builds.
#[cold]
#[track_caller]
pub(crate) fn fatal(error: ConsistencyError) -> ! {
    error!("Fatal heap consistency error: {error}");
    panic!("{error}");
}
