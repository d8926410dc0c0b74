//! itchain Core - Shared types, hashing, and serialization
//!
//! This crate holds the data carried by the consensus layer without
//! interpreting it: blocks, transactions and peer/round identifiers.

pub mod error;
pub mod hash;
pub mod serialize;
pub mod types;

pub use error::CoreError;
pub use hash::{hash_blake3, merkle_root, Hash};
pub use types::*;
