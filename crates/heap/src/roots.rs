#![forbid(unsafe_code)]

use std::cell::Cell;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use tstore_collections::ProtectionIndex;
use tstore_collections::ProtectionSet;
use tstore_utilities::LargeFormatter;

use crate::ConsistencyError;
use crate::Marker;
use crate::Term;
use crate::fatal;

/// A single term location owned by the client.
pub type TermSlot = Rc<Cell<Option<Term>>>;

/// An array of term locations owned by the client.
pub type TermArray = Rc<RefCell<Vec<Option<Term>>>>;

/// A linked list of term locations owned by the client.
pub type TermList = Rc<RefCell<SlotList>>;

/// Implemented by the locations that can be pinned. The collector reads the
/// current contents of every pinned location at every collection.
pub trait Markable {
    /// Marks all terms in the location as reachable.
    fn mark(&self, marker: &mut Marker);

    /// Returns true iff the location currently holds the given term.
    fn contains_term(&self, term: Term) -> bool;

    /// Returns the number of terms in the location.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Markable for Cell<Option<Term>> {
    fn mark(&self, marker: &mut Marker) {
        if let Some(term) = self.get() {
            marker.mark(term);
        }
    }

    fn contains_term(&self, term: Term) -> bool {
        self.get() == Some(term)
    }

    fn len(&self) -> usize {
        self.get().is_some() as usize
    }
}

impl Markable for Vec<Option<Term>> {
    fn mark(&self, marker: &mut Marker) {
        for term in self.iter().flatten() {
            marker.mark(*term);
        }
    }

    fn contains_term(&self, term: Term) -> bool {
        self.contains(&Some(term))
    }

    fn len(&self) -> usize {
        self.iter().flatten().count()
    }
}

impl<T: Markable> Markable for RefCell<T> {
    fn mark(&self, marker: &mut Marker) {
        self.borrow().mark(marker);
    }

    fn contains_term(&self, term: Term) -> bool {
        self.borrow().contains_term(term)
    }

    fn len(&self) -> usize {
        self.borrow().len()
    }
}

/// A singly linked list of term locations, for clients that keep their
/// temporaries on a stack.
#[derive(Default)]
pub struct SlotList {
    head: Option<Box<SlotNode>>,
    len: usize,
}

struct SlotNode {
    term: Option<Term>,
    next: Option<Box<SlotNode>>,
}

impl SlotList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a location on top of the list.
    pub fn push(&mut self, term: Option<Term>) {
        let next = self.head.take();
        self.head = Some(Box::new(SlotNode { term, next }));
        self.len += 1;
    }

    /// Removes the top location and returns its contents.
    pub fn pop(&mut self) -> Option<Option<Term>> {
        let node = self.head.take()?;
        self.head = node.next;
        self.len -= 1;
        Some(node.term)
    }

    /// Returns the contents of the top location.
    pub fn top(&self) -> Option<Option<Term>> {
        self.head.as_ref().map(|node| node.term)
    }

    /// Overwrites the top location, returns false when the list is empty.
    pub fn set_top(&mut self, term: Option<Term>) -> bool {
        match &mut self.head {
            Some(node) => {
                node.term = term;
                true
            }
            None => false,
        }
    }

    /// The number of locations in the list.
    pub fn slots(&self) -> usize {
        self.len
    }

    /// Iterates over the contents of the locations, from the top.
    pub fn iter(&self) -> impl Iterator<Item = Option<Term>> + '_ {
        let mut current = self.head.as_deref();
        std::iter::from_fn(move || {
            let node = current?;
            current = node.next.as_deref();
            Some(node.term)
        })
    }
}

impl Drop for SlotList {
    fn drop(&mut self) {
        // Unlink iteratively, dropping a long chain of boxes recursively overflows the stack.
        let mut current = self.head.take();
        while let Some(mut node) = current {
            current = node.next.take();
        }
    }
}

impl Markable for SlotList {
    fn mark(&self, marker: &mut Marker) {
        for term in self.iter().flatten() {
            marker.mark(term);
        }
    }

    fn contains_term(&self, term: Term) -> bool {
        self.iter().any(|slot| slot == Some(term))
    }

    fn len(&self) -> usize {
        self.iter().flatten().count()
    }
}

/// Returned by [crate::Heap::pin], releases the pin in [crate::Heap::unpin].
#[derive(Debug, PartialEq, Eq)]
pub struct Root {
    registry: usize,
    index: ProtectionIndex,
}

/// Returned by [crate::Heap::pin_array].
#[derive(Debug, PartialEq, Eq)]
pub struct ArrayRoot {
    registry: usize,
    index: ProtectionIndex,
}

/// Returned by [crate::Heap::pin_list].
#[derive(Debug, PartialEq, Eq)]
pub struct ListRoot {
    registry: usize,
    index: ProtectionIndex,
}

/// Hands out the identifiers that tie root handles to their registry.
static NEXT_REGISTRY: AtomicUsize = AtomicUsize::new(0);

/// The pinned locations of a heap.
pub(crate) struct RootRegistry {
    /// Unique among all registries of the process.
    id: usize,

    slots: ProtectionSet<TermSlot>,
    arrays: ProtectionSet<TermArray>,
    lists: ProtectionSet<TermList>,
}

impl Default for RootRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RootRegistry {
    pub fn new() -> Self {
        Self {
            id: NEXT_REGISTRY.fetch_add(1, Ordering::Relaxed),
            slots: ProtectionSet::new(),
            arrays: ProtectionSet::new(),
            lists: ProtectionSet::new(),
        }
    }

    pub fn pin(&mut self, slot: &TermSlot) -> Root {
        Root {
            registry: self.id,
            index: self.slots.protect(Rc::clone(slot)),
        }
    }

    pub fn unpin(&mut self, root: Root) {
        if root.registry != self.id || self.slots.unprotect(root.index).is_none() {
            fatal(ConsistencyError::UnknownRoot(format!("{root:?}")));
        }
    }

    pub fn pin_array(&mut self, array: &TermArray) -> ArrayRoot {
        ArrayRoot {
            registry: self.id,
            index: self.arrays.protect(Rc::clone(array)),
        }
    }

    pub fn unpin_array(&mut self, root: ArrayRoot) {
        if root.registry != self.id || self.arrays.unprotect(root.index).is_none() {
            fatal(ConsistencyError::UnknownRoot(format!("{root:?}")));
        }
    }

    pub fn pin_list(&mut self, list: &TermList) -> ListRoot {
        ListRoot {
            registry: self.id,
            index: self.lists.protect(Rc::clone(list)),
        }
    }

    pub fn unpin_list(&mut self, root: ListRoot) {
        if root.registry != self.id || self.lists.unprotect(root.index).is_none() {
            fatal(ConsistencyError::UnknownRoot(format!("{root:?}")));
        }
    }

    /// Marks the current contents of every pinned location.
    pub fn mark(&self, marker: &mut Marker) {
        for (_, slot) in self.slots.iter() {
            slot.mark(marker);
        }

        for (_, array) in self.arrays.iter() {
            array.mark(marker);
        }

        for (_, list) in self.lists.iter() {
            list.mark(marker);
        }
    }

    /// Returns true iff some pinned location holds the given term.
    pub fn contains_term(&self, term: Term) -> bool {
        self.slots.iter().any(|(_, slot)| slot.contains_term(term))
            || self.arrays.iter().any(|(_, array)| array.contains_term(term))
            || self.lists.iter().any(|(_, list)| list.contains_term(term))
    }

    /// Returns the number of pinned locations.
    pub fn len(&self) -> usize {
        self.slots.len() + self.arrays.len() + self.lists.len()
    }

    pub fn metrics(&self) -> RootMetrics<'_> {
        RootMetrics(self)
    }
}

/// Prints the sizes of the root protection sets.
pub struct RootMetrics<'a>(&'a RootRegistry);

impl fmt::Display for RootMetrics<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, len, maximum, insertions) in [
            (
                "slots",
                self.0.slots.len(),
                self.0.slots.maximum_size(),
                self.0.slots.number_of_insertions(),
            ),
            (
                "arrays",
                self.0.arrays.len(),
                self.0.arrays.maximum_size(),
                self.0.arrays.number_of_insertions(),
            ),
            (
                "lists",
                self.0.lists.len(),
                self.0.lists.maximum_size(),
                self.0.lists.number_of_insertions(),
            ),
        ] {
            writeln!(
                f,
                "Pinned {name}: {}, max {} and {} insertions",
                LargeFormatter(len),
                LargeFormatter(maximum),
                LargeFormatter(insertions)
            )?;
        }

        Ok(())
    }
}
