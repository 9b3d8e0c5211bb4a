#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

mod protection_set;

pub use protection_set::*;
