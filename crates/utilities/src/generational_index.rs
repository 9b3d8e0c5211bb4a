//! Slot indices that detect reuse of their slot in debug builds. Release
//! builds store the bare slot.

use std::fmt;
use std::hash::Hash;
use std::hash::Hasher;

/// A slot of a slot table, together with the generation the slot had when
/// the index was issued.
#[derive(Copy, Clone)]
pub struct GenerationalIndex {
    slot: usize,

    #[cfg(debug_assertions)]
    generation: u32,
}

impl GenerationalIndex {
    /// The slot this index refers to, without any generation check.
    pub fn slot(self) -> usize {
        self.slot
    }
}

/// The generation of every slot of one slot table. A slot starts a new
/// generation every time an index is issued for it.
#[derive(Clone, Debug, Default)]
pub struct GenerationCounter {
    #[cfg(debug_assertions)]
    generations: Vec<u32>,
}

impl GenerationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the next generation of the slot and returns its index.
    pub fn issue(&mut self, slot: usize) -> GenerationalIndex {
        #[cfg(debug_assertions)]
        {
            if slot >= self.generations.len() {
                self.generations.resize(slot + 1, 0);
            } else {
                self.generations[slot] = self.generations[slot].wrapping_add(1);
            }

            GenerationalIndex {
                slot,
                generation: self.generations[slot],
            }
        }

        #[cfg(not(debug_assertions))]
        GenerationalIndex { slot }
    }

    /// Returns the index of the slot in its current generation.
    pub fn current(&self, slot: usize) -> GenerationalIndex {
        GenerationalIndex {
            slot,
            #[cfg(debug_assertions)]
            generation: self.generations.get(slot).copied().unwrap_or_default(),
        }
    }

    /// Returns false when the slot was reissued after the index was created.
    /// Always true in release builds.
    pub fn is_current(&self, index: GenerationalIndex) -> bool {
        #[cfg(debug_assertions)]
        {
            self.generations.get(index.slot) == Some(&index.generation)
        }

        #[cfg(not(debug_assertions))]
        {
            let _ = index;
            true
        }
    }

    /// Returns the slot of the index, panics in debug builds when the index is stale.
    pub fn checked_slot(&self, index: GenerationalIndex) -> usize {
        debug_assert!(self.is_current(index), "Use of the stale index {index:?}");
        index.slot
    }
}

impl PartialEq for GenerationalIndex {
    fn eq(&self, other: &Self) -> bool {
        #[cfg(debug_assertions)]
        if self.generation != other.generation {
            return false;
        }

        self.slot == other.slot
    }
}

impl Eq for GenerationalIndex {}

impl Hash for GenerationalIndex {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.slot.hash(state);
    }
}

impl fmt::Debug for GenerationalIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.slot)?;

        #[cfg(debug_assertions)]
        write!(f, "@{}", self.generation)?;

        Ok(())
    }
}
