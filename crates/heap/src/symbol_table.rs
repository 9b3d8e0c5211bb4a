#![forbid(unsafe_code)]

use std::fmt;

use log::debug;
use rustc_hash::FxHashMap;
use tstore_utilities::debug_trace;

use crate::ConsistencyError;
use crate::MAX_ARITY;
use crate::fatal;

/// A function symbol, a name together with an arity. Symbols are shared:
/// creating the same name and arity twice gives the same symbol.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Symbol {
    index: u32,
    generation: u32,
}

impl Symbol {
    pub(crate) fn index(self) -> u32 {
        self.index
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({}@{})", self.index, self.generation)
    }
}

struct SymbolEntry {
    name: String,
    arity: usize,

    /// The number of times the client created this symbol without releasing it.
    references: usize,

    /// Set during a major collection when a surviving term uses the symbol.
    marked: bool,
}

#[derive(Default)]
struct SymbolSlot {
    generation: u32,
    entry: Option<SymbolEntry>,
}

/// Stores the symbols of a heap. A symbol is removed by a major collection
/// once the client released it and no term uses it anymore.
#[derive(Default)]
pub(crate) struct SymbolTable {
    slots: Vec<SymbolSlot>,
    vacant: Vec<u32>,
    lookup: FxHashMap<(String, usize), u32>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of symbols in the table.
    pub fn len(&self) -> usize {
        self.lookup.len()
    }

    /// Returns the symbol with the given name and arity, and holds one more reference to it.
    pub fn create(&mut self, name: &str, arity: usize) -> Symbol {
        if arity > MAX_ARITY {
            fatal(ConsistencyError::ArityTooLarge(arity));
        }

        let key = (name.to_string(), arity);
        if let Some(&index) = self.lookup.get(&key) {
            let slot = &mut self.slots[index as usize];
            if let Some(entry) = &mut slot.entry {
                entry.references += 1;
            }

            return Symbol {
                index,
                generation: slot.generation,
            };
        }

        let entry = SymbolEntry {
            name: key.0.clone(),
            arity,
            references: 1,
            marked: false,
        };

        let index = match self.vacant.pop() {
            Some(index) => index,
            None => {
                self.slots.push(SymbolSlot::default());
                (self.slots.len() - 1) as u32
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.entry = Some(entry);
        self.lookup.insert(key, index);

        debug_trace!("Created symbol {name} with arity {arity} at index {index}");
        Symbol {
            index,
            generation: slot.generation,
        }
    }

    /// Drops one reference that was obtained by [SymbolTable::create].
    pub fn release(&mut self, symbol: Symbol) {
        let entry = self.entry_mut(symbol);
        if entry.references == 0 {
            fatal(ConsistencyError::UnbalancedRelease(symbol));
        }

        entry.references -= 1;
    }

    pub fn name(&self, symbol: Symbol) -> &str {
        &self.entry(symbol).name
    }

    pub fn arity(&self, symbol: Symbol) -> usize {
        self.entry(symbol).arity
    }

    /// Returns the symbol that is currently stored at the given index.
    pub fn recall(&self, index: u32) -> Symbol {
        match self.slots.get(index as usize) {
            Some(slot) if slot.entry.is_some() => Symbol {
                index,
                generation: slot.generation,
            },
            _ => fatal(ConsistencyError::StaleSymbol(Symbol { index, generation: 0 })),
        }
    }

    /// Marks the symbol at the given index as used by a live term.
    pub fn mark(&mut self, index: u32) {
        if let Some(entry) = self.slots.get_mut(index as usize).and_then(|slot| slot.entry.as_mut()) {
            entry.marked = true;
        }
    }

    /// Removes the symbols that are neither marked nor referenced, clears all
    /// marks and returns the number of removed symbols.
    pub fn sweep(&mut self) -> usize {
        let mut removed = 0;

        for (index, slot) in self.slots.iter_mut().enumerate() {
            let Some(entry) = &mut slot.entry else {
                continue;
            };

            if entry.marked || entry.references > 0 {
                entry.marked = false;
                continue;
            }

            debug_trace!("Dropping symbol {} with arity {}", entry.name, entry.arity);
            if let Some(entry) = slot.entry.take() {
                self.lookup.remove(&(entry.name, entry.arity));
            }

            slot.generation = slot.generation.wrapping_add(1);
            self.vacant.push(index as u32);
            removed += 1;
        }

        if removed > 0 {
            debug!("Removed {removed} symbols, {} remain", self.len());
        }

        removed
    }

    fn entry(&self, symbol: Symbol) -> &SymbolEntry {
        match self.slots.get(symbol.index as usize) {
            Some(SymbolSlot {
                generation,
                entry: Some(entry),
            }) if *generation == symbol.generation => entry,
            _ => fatal(ConsistencyError::StaleSymbol(symbol)),
        }
    }

    fn entry_mut(&mut self, symbol: Symbol) -> &mut SymbolEntry {
        match self.slots.get_mut(symbol.index as usize) {
            Some(SymbolSlot {
                generation,
                entry: Some(entry),
            }) if *generation == symbol.generation => entry,
            _ => fatal(ConsistencyError::StaleSymbol(symbol)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbols_are_shared() {
        let mut table = SymbolTable::new();
        let f = table.create("f", 2);
        let g = table.create("f", 1);

        assert_eq!(table.create("f", 2), f);
        assert_ne!(f, g);
        assert_eq!(table.name(f), "f");
        assert_eq!(table.arity(g), 1);
        assert_eq!(table.len(), 2);
        assert_eq!(table.recall(f.index()), f);
    }

    #[test]
    fn test_sweep_keeps_referenced_and_marked() {
        let mut table = SymbolTable::new();
        let held = table.create("held", 0);
        let used = table.create("used", 1);
        let unused = table.create("unused", 2);

        table.release(used);
        table.release(unused);
        table.mark(used.index());

        assert_eq!(table.sweep(), 1);
        assert_eq!(table.len(), 2);
        assert_eq!(table.name(held), "held");
        assert_eq!(table.name(used), "used");

        // The mark is cleared, so the next sweep removes it.
        assert_eq!(table.sweep(), 1);

        // A recreated symbol reuses the slot with a new generation.
        let again = table.create("unused", 2);
        assert_ne!(again, unused);
    }

    #[test]
    #[should_panic]
    fn test_stale_symbol() {
        let mut table = SymbolTable::new();
        let f = table.create("f", 0);
        table.release(f);
        table.sweep();
        table.name(f);
    }

    #[test]
    #[should_panic]
    fn test_unbalanced_release() {
        let mut table = SymbolTable::new();
        let f = table.create("f", 0);
        table.release(f);
        table.release(f);
    }
}
