use std::fmt;

use tstore_utilities::GenerationCounter;
use tstore_utilities::GenerationalIndex;

/// Identifies an object in a [ProtectionSet]. In debug builds the index also
/// records the generation of its slot, so a stale index is detected.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct ProtectionIndex(GenerationalIndex);

impl fmt::Debug for ProtectionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:?}", self.0)
    }
}

/// Stores objects in slots and hands out the slot as index. Slots of removed
/// objects are threaded on a free list and reused first, so the set does not
/// grow beyond the largest number of objects it held at once.
#[derive(Debug)]
pub struct ProtectionSet<T> {
    slots: Vec<Slot<T>>,

    /// The most recently vacated slot.
    vacant: Option<usize>,

    len: usize,
    insertions: u64,
    generations: GenerationCounter,
}

#[derive(Debug)]
enum Slot<T> {
    Occupied(T),

    /// Points to the next vacant slot.
    Vacant(Option<usize>),
}

impl<T> ProtectionSet<T> {
    pub fn new() -> Self {
        ProtectionSet {
            slots: Vec::new(),
            vacant: None,
            len: 0,
            insertions: 0,
            generations: GenerationCounter::new(),
        }
    }

    /// The number of times [ProtectionSet::protect] was called.
    pub fn number_of_insertions(&self) -> u64 {
        self.insertions
    }

    /// The largest number of objects that were in the set at the same time.
    pub fn maximum_size(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the object with the given index, or `None` when it was removed.
    pub fn get(&self, index: ProtectionIndex) -> Option<&T> {
        if !self.generations.is_current(index.0) {
            return None;
        }

        match self.slots.get(self.generations.checked_slot(index.0)) {
            Some(Slot::Occupied(object)) => Some(object),
            _ => None,
        }
    }

    /// Returns true iff the object with the given index is still in the set.
    pub fn contains_root(&self, index: ProtectionIndex) -> bool {
        self.get(index).is_some()
    }

    /// Iterates over the objects in the set, in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (ProtectionIndex, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(slot, entry)| match entry {
            Slot::Occupied(object) => Some((ProtectionIndex(self.generations.current(slot)), object)),
            Slot::Vacant(_) => None,
        })
    }

    /// Inserts the object, reusing a vacant slot when there is one.
    pub fn protect(&mut self, object: T) -> ProtectionIndex {
        self.insertions += 1;
        self.len += 1;

        let slot = match self.vacant {
            Some(slot) => {
                if let Slot::Vacant(next) = self.slots[slot] {
                    self.vacant = next;
                }

                self.slots[slot] = Slot::Occupied(object);
                slot
            }
            None => {
                self.slots.push(Slot::Occupied(object));
                self.slots.len() - 1
            }
        };

        ProtectionIndex(self.generations.issue(slot))
    }

    /// Removes the object with the given index and returns it, or returns
    /// `None` when the index does not refer to an object in the set.
    pub fn unprotect(&mut self, index: ProtectionIndex) -> Option<T> {
        if !self.contains_root(index) {
            return None;
        }

        let slot = self.generations.checked_slot(index.0);
        match std::mem::replace(&mut self.slots[slot], Slot::Vacant(self.vacant)) {
            Slot::Occupied(object) => {
                self.vacant = Some(slot);
                self.len -= 1;
                Some(object)
            }
            Slot::Vacant(_) => None,
        }
    }
}

impl<T> Default for ProtectionSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use tstore_utilities::random_test;
    use tstore_utilities::test_logger;

    use super::*;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_random_protection_set() {
        random_test(100, |rng| {
            let mut set = ProtectionSet::new();
            let mut live: Vec<(ProtectionIndex, u32)> = Vec::new();

            for _ in 0..2000 {
                let value = rng.random_range(0..1000);
                live.push((set.protect(value), value));
            }

            for _ in 0..1000 {
                let (index, value) = live.swap_remove(rng.random_range(0..live.len()));
                assert_eq!(set.unprotect(index), Some(value));
            }

            // Fills the vacated slots without growing the set.
            for _ in 0..500 {
                let value = rng.random_range(0..1000);
                live.push((set.protect(value), value));
            }

            for (index, value) in &live {
                assert_eq!(set.get(*index), Some(value));
            }

            assert_eq!(set.iter().count(), 1500);
            assert_eq!(set.len(), 1500);
            assert_eq!(set.number_of_insertions(), 2500);
            assert_eq!(set.maximum_size(), 2000);
        });
    }

    #[test]
    fn test_vacant_slot_is_reused() {
        test_logger();

        let mut set = ProtectionSet::new();
        let first = set.protect("first");
        let second = set.protect("second");

        assert_eq!(set.unprotect(first), Some("first"));
        assert!(!set.contains_root(first));
        assert_eq!(set.unprotect(first), None);
        assert_eq!(set.get(second), Some(&"second"));

        set.protect("third");
        assert_eq!(set.maximum_size(), 2);
        assert_eq!(
            set.iter().map(|(_, object)| *object).collect::<Vec<_>>(),
            vec!["third", "second"]
        );
    }
}
