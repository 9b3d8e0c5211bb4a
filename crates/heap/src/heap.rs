#![forbid(unsafe_code)]

use std::fmt;

use itertools::Itertools;
use log::debug;
use tstore_utilities::BytesFormatter;
use tstore_utilities::LargeFormatter;
use tstore_utilities::debug_trace;

use crate::AddressClass;
use crate::ArrayRoot;
use crate::CELL_PREFIX;
use crate::CellAllocator;
use crate::ConfigError;
use crate::ConsistencyError;
use crate::Decision;
use crate::Directory;
use crate::Header;
use crate::HeapConfig;
use crate::ListRoot;
use crate::MAX_ARITY;
use crate::Root;
use crate::RootRegistry;
use crate::Scheduler;
use crate::SizeClassMetrics;
use crate::Symbol;
use crate::SymbolTable;
use crate::Tag;
use crate::Term;
use crate::TermArray;
use crate::TermKind;
use crate::TermList;
use crate::TermSlot;
use crate::WORD_BYTES;
use crate::Word;
use crate::fatal;
use crate::structural_hash;

/// A store of maximally shared terms.
///
/// Terms are only reclaimed by a collection, and a collection may be started
/// by any operation that creates a term. Terms that must survive such an
/// operation have to be reachable from a pinned location, see [Heap::pin].
/// The arguments of a term under construction are kept alive by the heap itself.
pub struct Heap {
    pub(crate) config: HeapConfig,
    pub(crate) allocator: CellAllocator,
    pub(crate) directory: Directory,
    pub(crate) symbols: SymbolTable,
    pub(crate) roots: RootRegistry,
    pub(crate) scheduler: Scheduler,

    /// The worklist of the marking phase.
    pub(crate) stack: Vec<Term>,

    /// Terms that must survive the allocation of the term being constructed.
    pub(crate) temporaries: Vec<Term>,

    pub(crate) empty_list: Term,
    garbage_collection: bool,

    pub(crate) minor_collections: usize,
    pub(crate) major_collections: usize,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    /// Creates a heap with the default configuration.
    pub fn new() -> Heap {
        Self::from_valid_config(HeapConfig::default())
    }

    /// Creates a heap with the given configuration.
    pub fn with_config(config: HeapConfig) -> Result<Heap, ConfigError> {
        config.validate()?;
        Ok(Self::from_valid_config(config))
    }

    fn from_valid_config(config: HeapConfig) -> Heap {
        let mut heap = Heap {
            allocator: CellAllocator::new(&config),
            directory: Directory::new(config.initial_table_class, config.max_load_percent),
            symbols: SymbolTable::new(),
            roots: RootRegistry::new(),
            scheduler: Scheduler::default(),
            stack: Vec::new(),
            temporaries: Vec::new(),
            empty_list: Term::new(0, 0),
            garbage_collection: false,
            minor_collections: 0,
            major_collections: 0,
            config,
        };

        heap.empty_list = heap.intern(Header::list(0), &[0, 0]);
        heap.garbage_collection = true;

        debug!(
            "Created a heap with blocks of {} words and {} directory buckets",
            heap.config.block_size,
            heap.directory.table_size()
        );
        heap
    }

    /// Returns the configuration of the heap.
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Enables or disables automatic collections. When disabled, an exhausted
    /// size class always grows. Explicit collections are still performed.
    pub fn automatic_garbage_collection(&mut self, enabled: bool) {
        self.garbage_collection = enabled;
    }

    /// Returns the symbol with the given name and arity. Every call must be
    /// balanced by a [Heap::release_symbol] once the client no longer needs the symbol.
    pub fn create_symbol(&mut self, name: &str, arity: usize) -> Symbol {
        self.symbols.create(name, arity)
    }

    /// Releases a symbol obtained from [Heap::create_symbol]. It is removed by
    /// a major collection when no term uses it anymore.
    pub fn release_symbol(&mut self, symbol: Symbol) {
        self.symbols.release(symbol);
    }

    pub fn symbol_name(&self, symbol: Symbol) -> &str {
        self.symbols.name(symbol)
    }

    pub fn symbol_arity(&self, symbol: Symbol) -> usize {
        self.symbols.arity(symbol)
    }

    /// The number of symbols in the symbol table.
    pub fn symbol_count(&self) -> usize {
        self.symbols.len()
    }

    /// Returns the application of the symbol to the arguments. The number of
    /// arguments must match the arity of the symbol.
    pub fn construct(&mut self, symbol: Symbol, arguments: &[Term]) -> Term {
        let arity = self.symbols.arity(symbol);
        if arity != arguments.len() {
            fatal(ConsistencyError::ArityMismatch {
                name: self.symbols.name(symbol).to_string(),
                expected: arity,
                actual: arguments.len(),
            });
        }

        for &argument in arguments {
            self.check_term(argument);
        }

        let payload: Vec<Word> = arguments.iter().map(|argument| argument.to_word()).collect();
        self.intern(Header::application(symbol.index(), arity), &payload)
    }

    /// Fixed arity form of [Heap::construct].
    pub fn apply<const N: usize>(&mut self, symbol: Symbol, arguments: [Term; N]) -> Term {
        self.construct(symbol, &arguments)
    }

    /// Returns the application of the symbol to the elements of a list. The
    /// length of the list must match the arity of the symbol.
    pub fn construct_from_list(&mut self, symbol: Symbol, list: Term) -> Term {
        let arguments: Vec<Term> = self.list_elements(list).collect();
        self.construct(symbol, &arguments)
    }

    /// Returns the constant for a symbol of arity zero.
    pub fn constant(&mut self, symbol: Symbol) -> Term {
        self.construct(symbol, &[])
    }

    /// Returns a copy of the application with argument `index` replaced.
    pub fn set_argument(&mut self, term: Term, argument: Term, index: usize) -> Term {
        let header = self.expect_kind(term, TermKind::Application);
        if index >= header.length() {
            fatal(ConsistencyError::ArgumentOutOfRange {
                index,
                arity: header.length(),
            });
        }

        let mut arguments: Vec<Term> = self.arguments(term).collect();
        arguments[index] = argument;

        let symbol = self.symbols.recall(header.symbol_index());
        self.construct(symbol, &arguments)
    }

    pub fn make_int(&mut self, value: i64) -> Term {
        self.intern(Header::int(), &[value as Word])
    }

    /// Returns the empty list, which is never reclaimed.
    pub fn empty_list(&self) -> Term {
        self.empty_list
    }

    /// Returns the list with `element` in front of `list`.
    pub fn insert(&mut self, list: Term, element: Term) -> Term {
        let header = self.expect_kind(list, TermKind::List);
        self.check_term(element);

        self.intern(
            Header::list(header.length() + 1),
            &[element.to_word(), list.to_word()],
        )
    }

    /// Returns the list of the given elements, in order.
    pub fn make_list(&mut self, elements: &[Term]) -> Term {
        let protected = self.temporaries.len();
        self.temporaries.extend_from_slice(elements);

        let mut list = self.empty_list;
        for &element in elements.iter().rev() {
            list = self.insert(list, element);
        }

        self.temporaries.truncate(protected);
        list
    }

    /// Returns a term holding the given bytes.
    pub fn make_blob(&mut self, bytes: &[u8]) -> Term {
        let mut payload = Vec::with_capacity(1 + bytes.len().div_ceil(WORD_BYTES));
        payload.push(bytes.len() as Word);
        payload.extend(bytes.chunks(WORD_BYTES).map(|chunk| {
            let mut word = [0u8; WORD_BYTES];
            word[..chunk.len()].copy_from_slice(chunk);
            Word::from_le_bytes(word)
        }));

        self.intern(Header::blob(), &payload)
    }

    /// Returns the kind of a live term.
    pub fn kind(&self, term: Term) -> TermKind {
        match self.allocator.arena.header(term).tag() {
            Tag::Term(kind) => kind,
            Tag::Free => fatal(ConsistencyError::InvalidTerm(term.to_word())),
        }
    }

    /// Returns the head symbol of an application.
    pub fn symbol(&self, term: Term) -> Symbol {
        let header = self.expect_kind(term, TermKind::Application);
        self.symbols.recall(header.symbol_index())
    }

    /// Returns the arity of an application.
    pub fn arity(&self, term: Term) -> usize {
        self.expect_kind(term, TermKind::Application).length()
    }

    /// Returns argument `index` of an application.
    pub fn argument(&self, term: Term, index: usize) -> Term {
        let header = self.expect_kind(term, TermKind::Application);
        if index >= header.length() {
            fatal(ConsistencyError::ArgumentOutOfRange {
                index,
                arity: header.length(),
            });
        }

        Term::from_reference(self.allocator.arena.payload(term)[index])
    }

    /// Iterates over the arguments of an application.
    pub fn arguments(&self, term: Term) -> impl ExactSizeIterator<Item = Term> + '_ {
        self.expect_kind(term, TermKind::Application);
        self.allocator
            .arena
            .payload(term)
            .iter()
            .map(|&word| Term::from_reference(word))
    }

    pub fn int_value(&self, term: Term) -> i64 {
        self.expect_kind(term, TermKind::Int);
        self.allocator.arena.payload(term)[0] as i64
    }

    pub fn is_empty_list(&self, term: Term) -> bool {
        term == self.empty_list
    }

    /// Returns the first element of a non-empty list.
    pub fn list_head(&self, list: Term) -> Term {
        self.expect_non_empty_list(list);
        Term::from_reference(self.allocator.arena.payload(list)[0])
    }

    /// Returns a non-empty list without its first element.
    pub fn list_tail(&self, list: Term) -> Term {
        self.expect_non_empty_list(list);
        Term::from_reference(self.allocator.arena.payload(list)[1])
    }

    /// Returns the number of elements of a list.
    pub fn list_length(&self, list: Term) -> usize {
        let length = self.expect_kind(list, TermKind::List).length();
        if length < MAX_ARITY {
            length
        } else {
            // The stored length is saturated.
            self.list_elements(list).count()
        }
    }

    /// Iterates over the elements of a list.
    pub fn list_elements(&self, list: Term) -> impl Iterator<Item = Term> + '_ {
        self.expect_kind(list, TermKind::List);

        let mut current = list;
        std::iter::from_fn(move || {
            if self.is_empty_list(current) {
                return None;
            }

            let element = self.list_head(current);
            current = self.list_tail(current);
            Some(element)
        })
    }

    /// Returns the bytes stored in a blob.
    pub fn blob_bytes(&self, term: Term) -> Vec<u8> {
        self.expect_kind(term, TermKind::Blob);

        let payload = self.allocator.arena.payload(term);
        let length = payload[0] as usize;
        let mut bytes: Vec<u8> = payload[1..].iter().flat_map(|word| word.to_le_bytes()).collect();
        bytes.truncate(length);
        bytes
    }

    /// Returns the structural hash of a live term, the hash that selects its directory bucket.
    pub fn structural_hash(&self, term: Term) -> u64 {
        self.check_term(term);
        structural_hash(self.allocator.arena.header(term), self.allocator.arena.payload(term))
    }

    /// Looks up a live term in the directory by its structure.
    pub fn find(&self, term: Term) -> Option<Term> {
        self.check_term(term);
        self.directory.find(&self.allocator.arena, term)
    }

    /// Pins a location, every term reachable from its contents survives all
    /// collections until the location is unpinned.
    pub fn pin(&mut self, slot: &TermSlot) -> Root {
        self.roots.pin(slot)
    }

    pub fn unpin(&mut self, root: Root) {
        self.roots.unpin(root);
    }

    /// Pins every location of an array, see [Heap::pin].
    pub fn pin_array(&mut self, array: &TermArray) -> ArrayRoot {
        self.roots.pin_array(array)
    }

    pub fn unpin_array(&mut self, root: ArrayRoot) {
        self.roots.unpin_array(root);
    }

    /// Pins every location of a list, see [Heap::pin].
    pub fn pin_list(&mut self, list: &TermList) -> ListRoot {
        self.roots.pin_list(list)
    }

    pub fn unpin_list(&mut self, root: ListRoot) {
        self.roots.unpin_list(root);
    }

    /// Returns true iff a pinned location currently holds the term.
    pub fn is_pinned(&self, term: Term) -> bool {
        self.roots.contains_term(term)
    }

    /// Classifies an arbitrary word, see [AddressClass].
    pub fn classify(&self, word: Word) -> AddressClass {
        self.allocator.classify(word)
    }

    /// Returns true iff the word is the handle of a live term.
    pub fn is_valid_term(&self, word: Word) -> bool {
        self.allocator.is_valid_term(word)
    }

    /// The number of cell allocations since the heap was created.
    pub fn allocated_count(&self) -> u64 {
        self.allocator.allocated_count()
    }

    /// The number of terms in the directory, including unreachable terms that
    /// have not been collected yet.
    pub fn live_term_count(&self) -> usize {
        self.directory.len()
    }

    /// The largest cell size, in words, supported without growing the class table.
    pub fn max_term_size(&self) -> usize {
        self.allocator.max_term_size()
    }

    /// Returns the state of the size class for cells of `size` words.
    pub fn size_class(&self, size: usize) -> Option<SizeClassMetrics> {
        self.allocator.metrics(size)
    }

    /// The number of blocks owned by the heap, including recycled blocks.
    pub fn block_count(&self) -> usize {
        self.allocator.arena.block_count()
    }

    /// The number of empty blocks kept for reuse.
    pub fn recycled_block_count(&self) -> usize {
        self.allocator.arena.recycled_count()
    }

    /// The number of entries in the directory, equal to [Heap::live_term_count].
    pub fn directory_len(&self) -> usize {
        self.directory.len()
    }

    pub fn directory_table_size(&self) -> usize {
        self.directory.table_size()
    }

    pub fn directory_resize_count(&self) -> usize {
        self.directory.resize_count()
    }

    pub fn minor_collections(&self) -> usize {
        self.minor_collections
    }

    pub fn major_collections(&self) -> usize {
        self.major_collections
    }

    /// Returns the metrics of the heap, can be formatted and written to output.
    pub fn metrics(&self) -> HeapMetrics<'_> {
        HeapMetrics(self)
    }

    /// Returns a value that formats the term, for instance `f(1, [a, b])`.
    pub fn display(&self, term: Term) -> TermDisplay<'_> {
        TermDisplay { heap: self, term }
    }

    /// Returns the term with the given structure, creating it when it does not exist yet.
    fn intern(&mut self, header: Header, payload: &[Word]) -> Term {
        let hash = structural_hash(header, payload);
        if let Some(term) = self
            .directory
            .lookup(&mut self.allocator.arena, hash, header, payload)
        {
            return term;
        }

        let protected = self.temporaries.len();
        for position in header.references() {
            if let Some(term) = Term::from_word(payload[position]) {
                self.temporaries.push(term);
            }
        }

        let term = self.allocate(CELL_PREFIX + payload.len());
        self.temporaries.truncate(protected);

        let cell = self.allocator.arena.cell_mut(term);
        cell[0] = header.to_word();
        cell[CELL_PREFIX..].copy_from_slice(payload);
        self.directory.insert(&mut self.allocator.arena, term, hash);

        debug_trace!("Created {term:?} {header:?}");
        term
    }

    /// Returns a zeroed cell of `size` words. When the size class is
    /// exhausted the scheduler decides between growing and collecting.
    fn allocate(&mut self, size: usize) -> Term {
        self.allocator.ensure_class(size);
        self.allocator.count_allocation();

        if self.config.aggressive_gc && self.garbage_collection {
            self.collect_major();
        }

        if let Some(term) = self.allocator.try_allocate(size) {
            return term;
        }

        let decision = if self.garbage_collection {
            let class = self.allocator.class(size);
            self.scheduler
                .decide(&self.config, size, class.blocks.len(), &class.statistics)
        } else {
            Decision::Grow
        };

        debug_trace!("Size class {size} is exhausted, decided to {decision:?}");
        match decision {
            Decision::Grow => return self.allocator.grow(size),
            Decision::Minor => self.collect_minor(),
            Decision::Major => self.collect_major(),
        }

        match self.allocator.try_allocate(size) {
            Some(term) => term,
            None => self.allocator.grow(size),
        }
    }

    /// Stops with a fatal error when the handle is not a live term.
    fn check_term(&self, term: Term) {
        if !self.allocator.is_valid_term(term.to_word()) {
            fatal(ConsistencyError::InvalidTerm(term.to_word()));
        }
    }

    fn expect_kind(&self, term: Term, expected: TermKind) -> Header {
        let header = self.allocator.arena.header(term);
        match header.tag() {
            Tag::Term(kind) if kind == expected => header,
            Tag::Term(actual) => fatal(ConsistencyError::WrongKind { term, expected, actual }),
            Tag::Free => fatal(ConsistencyError::InvalidTerm(term.to_word())),
        }
    }

    fn expect_non_empty_list(&self, list: Term) {
        self.expect_kind(list, TermKind::List);
        if self.is_empty_list(list) {
            fatal(ConsistencyError::EmptyList);
        }
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.metrics())?;
        write!(f, "{:?}", self.allocator)
    }
}

/// Formats the counters of a heap.
pub struct HeapMetrics<'a>(&'a Heap);

impl fmt::Display for HeapMetrics<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let heap = self.0;

        writeln!(
            f,
            "Heap has {} terms in {} blocks of {} ({} recycled) after {} allocations",
            LargeFormatter(heap.live_term_count()),
            LargeFormatter(heap.block_count()),
            BytesFormatter(heap.allocator.arena.allocated_words() * WORD_BYTES),
            LargeFormatter(heap.recycled_block_count()),
            LargeFormatter(heap.allocated_count())
        )?;
        writeln!(
            f,
            "Directory has {} buckets and was resized {} times, {} symbols",
            LargeFormatter(heap.directory_table_size()),
            heap.directory_resize_count(),
            LargeFormatter(heap.symbol_count())
        )?;
        writeln!(
            f,
            "{} minor and {} major collections",
            heap.minor_collections, heap.major_collections
        )?;

        for size in 0..heap.max_term_size() {
            if let Some(class) = heap.size_class(size).filter(|class| class.blocks > 0) {
                writeln!(
                    f,
                    "Size {size}: {} blocks, {} free cells, last collection reclaimed {} cells and {} blocks",
                    LargeFormatter(class.blocks),
                    LargeFormatter(class.free_cells),
                    LargeFormatter(class.statistics.reclaimed_cells),
                    class.statistics.reclaimed_blocks
                )?;
            }
        }

        write!(f, "{}", heap.roots.metrics())
    }
}

/// Formats a term, see [Heap::display].
pub struct TermDisplay<'a> {
    heap: &'a Heap,
    term: Term,
}

impl fmt::Display for TermDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let heap = self.heap;

        match heap.kind(self.term) {
            TermKind::Int => write!(f, "{}", heap.int_value(self.term)),
            TermKind::List => write!(
                f,
                "[{}]",
                heap.list_elements(self.term).map(|element| heap.display(element)).format(", ")
            ),
            TermKind::Application => {
                let symbol = heap.symbol(self.term);
                write!(f, "{}", heap.symbol_name(symbol))?;

                if heap.arity(self.term) > 0 {
                    write!(
                        f,
                        "({})",
                        heap.arguments(self.term).map(|argument| heap.display(argument)).format(", ")
                    )?;
                }

                Ok(())
            }
            TermKind::Blob => write!(f, "#{:02x}", heap.blob_bytes(self.term).iter().format("")),
        }
    }
}

impl fmt::Debug for TermDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
