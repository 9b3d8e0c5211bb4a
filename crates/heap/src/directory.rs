#![forbid(unsafe_code)]

use std::hash::Hasher;

use log::debug;
use rustc_hash::FxHasher;

use crate::BlockArena;
use crate::ConsistencyError;
use crate::Header;
use crate::Link;
use crate::Term;
use crate::Word;
use crate::fatal;

/// Hashes the structure of a term: the header without its collector bits
/// followed by every payload word, in order.
pub(crate) fn structural_hash(header: Header, payload: &[Word]) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write_u64(header.hidden());
    for &word in payload {
        hasher.write_u64(word);
    }

    hasher.finish()
}

/// The hash-consing table. Every live term is on exactly one bucket chain,
/// chained through the link words of the cells.
pub(crate) struct Directory {
    buckets: Vec<Option<Term>>,
    len: usize,
    max_load_percent: usize,
    resize_count: usize,
}

impl Directory {
    pub fn new(table_class: u32, max_load_percent: usize) -> Self {
        Self {
            buckets: vec![None; 1 << table_class],
            len: 0,
            max_load_percent,
            resize_count: 0,
        }
    }

    /// The number of terms in the directory.
    pub fn len(&self) -> usize {
        self.len
    }

    /// The number of buckets.
    pub fn table_size(&self) -> usize {
        self.buckets.len()
    }

    pub fn resize_count(&self) -> usize {
        self.resize_count
    }

    fn bucket(&self, hash: u64) -> usize {
        (hash as usize) & (self.buckets.len() - 1)
    }

    /// Returns the term with the given structure. A hit is moved to the front
    /// of its bucket.
    pub fn lookup(&mut self, arena: &mut BlockArena, hash: u64, header: Header, payload: &[Word]) -> Option<Term> {
        let bucket = self.bucket(hash);

        let mut previous = None;
        let mut current = self.buckets[bucket];
        while let Some(term) = current {
            let next = arena.bucket_link(term);

            if arena.header(term).hidden() == header.hidden() && arena.payload(term) == payload {
                if let Some(previous) = previous {
                    arena.set_link(previous, Link::Bucket(next));
                    arena.set_link(term, Link::Bucket(self.buckets[bucket]));
                    self.buckets[bucket] = Some(term);
                }

                return Some(term);
            }

            previous = current;
            current = next;
        }

        None
    }

    /// Returns the term in the directory that is structurally equal to the given one.
    pub fn find(&self, arena: &BlockArena, term: Term) -> Option<Term> {
        let header = arena.header(term);
        let payload = arena.payload(term);

        let mut current = self.buckets[self.bucket(structural_hash(header, payload))];
        while let Some(candidate) = current {
            if arena.header(candidate).hidden() == header.hidden() && arena.payload(candidate) == payload {
                return Some(candidate);
            }

            current = arena.bucket_link(candidate);
        }

        None
    }

    /// Puts a freshly written term at the front of its bucket, and doubles the
    /// table when the load exceeds the maximum.
    pub fn insert(&mut self, arena: &mut BlockArena, term: Term, hash: u64) {
        let bucket = self.bucket(hash);
        arena.set_link(term, Link::Bucket(self.buckets[bucket]));
        self.buckets[bucket] = Some(term);
        self.len += 1;

        if 100 * self.len / self.buckets.len() > self.max_load_percent {
            self.resize(arena);
        }
    }

    /// Unlinks a term that is about to be reclaimed. The term must be present.
    pub fn release(&mut self, arena: &mut BlockArena, term: Term) {
        let bucket = self.bucket(structural_hash(arena.header(term), arena.payload(term)));

        let mut previous = None;
        let mut current = self.buckets[bucket];
        while let Some(candidate) = current {
            let next = arena.bucket_link(candidate);

            if candidate == term {
                match previous {
                    Some(previous) => arena.set_link(previous, Link::Bucket(next)),
                    None => self.buckets[bucket] = next,
                }

                self.len -= 1;
                return;
            }

            previous = current;
            current = next;
        }

        fatal(ConsistencyError::MissingFromBucket(term))
    }

    /// Doubles the table. Every old bucket `i` is split into bucket `i` and
    /// bucket `i + old_size`, depending on the newly significant hash bit, and
    /// both chains keep their relative order.
    fn resize(&mut self, arena: &mut BlockArena) {
        let old_size = self.buckets.len();
        self.buckets.resize(2 * old_size, None);

        for bucket in 0..old_size {
            let mut current = self.buckets[bucket].take();
            let mut tails: [Option<Term>; 2] = [None, None];

            while let Some(term) = current {
                current = arena.bucket_link(term);
                arena.set_link(term, Link::Bucket(None));

                let hash = structural_hash(arena.header(term), arena.payload(term));
                let high = (hash as usize) & old_size != 0;
                let target = if high { bucket + old_size } else { bucket };

                match tails[high as usize] {
                    Some(tail) => arena.set_link(tail, Link::Bucket(Some(term))),
                    None => self.buckets[target] = Some(term),
                }
                tails[high as usize] = Some(term);
            }
        }

        self.resize_count += 1;
        debug!(
            "Resized the term directory from {} to {} buckets for {} terms",
            old_size,
            self.buckets.len(),
            self.len
        );
    }

    /// Iterates over the terms in the given bucket.
    #[cfg(test)]
    pub fn chain<'a>(&self, arena: &'a BlockArena, bucket: usize) -> impl Iterator<Item = Term> + 'a {
        let mut current = self.buckets[bucket];
        std::iter::from_fn(move || {
            let term = current?;
            current = arena.bucket_link(term);
            Some(term)
        })
    }
}
