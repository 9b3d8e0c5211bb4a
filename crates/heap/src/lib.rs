#![doc = include_str!("../README.md")]

mod address_index;
mod allocator;
mod block;
mod collector;
mod config;
mod directory;
mod error;
mod heap;
mod random_term;
mod roots;
mod scheduler;
mod symbol_table;
mod term;

pub use address_index::*;
pub use allocator::*;
use block::*;
pub use collector::*;
pub use config::*;
use directory::*;
pub use error::*;
pub use heap::*;
pub use random_term::*;
pub use roots::*;
pub use scheduler::*;
pub use symbol_table::*;
pub use term::*;
