#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::rc::Rc;

use rand::Rng;
use rand::seq::IndexedRandom;

use crate::Heap;
use crate::Term;
use crate::TermArray;

/// Creates a random term from the given function symbols, constants and small
/// integers by performing `iterations` constructions. Every constructed term
/// becomes a candidate argument of the following constructions, so the result
/// shares sub-terms.
///
/// The result is not pinned, it must be pinned before the next term is created.
pub fn random_term(
    heap: &mut Heap,
    rng: &mut impl Rng,
    symbols: &[(&str, usize)],
    constants: &[&str],
    iterations: usize,
) -> Term {
    assert!(!constants.is_empty(), "Constants are needed to create a term");
    assert!(!symbols.is_empty() || iterations == 0);

    let subterms: TermArray = Rc::new(RefCell::new(Vec::new()));
    let root = heap.pin_array(&subterms);

    for name in constants {
        let symbol = heap.create_symbol(name, 0);
        let constant = heap.constant(symbol);
        heap.release_symbol(symbol);
        subterms.borrow_mut().push(Some(constant));
    }

    for value in 0..rng.random_range(0..4) {
        let int = heap.make_int(value);
        subterms.borrow_mut().push(Some(int));
    }

    let mut result = subterms.borrow()[0];
    for _ in 0..iterations {
        let Some(&(name, arity)) = symbols.choose(rng) else {
            break;
        };

        let arguments: Vec<Term> = {
            let subterms = subterms.borrow();
            (0..arity)
                .filter_map(|_| subterms.choose(rng).copied().flatten())
                .collect()
        };

        let symbol = heap.create_symbol(name, arity);
        let term = if rng.random_bool(0.1) {
            let application = heap.construct(symbol, &arguments);
            subterms.borrow_mut().push(Some(application));
            heap.make_list(&[application, arguments.first().copied().unwrap_or(application)])
        } else {
            heap.construct(symbol, &arguments)
        };
        heap.release_symbol(symbol);

        subterms.borrow_mut().push(Some(term));
        result = Some(term);
    }

    heap.unpin_array(root);
    result.unwrap_or_else(|| heap.empty_list())
}

#[cfg(test)]
mod tests {
    use super::*;

    use tstore_utilities::random_test;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_random_term_is_shared() {
        random_test(20, |rng| {
            let mut heap = Heap::new();
            let term = random_term(&mut heap, rng, &[("f", 2), ("g", 1)], &["a", "b"], 50);

            assert!(heap.is_valid_term(term.to_word()));
            assert_eq!(heap.find(term), Some(term));
        });
    }
}
