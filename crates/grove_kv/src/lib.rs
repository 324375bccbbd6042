//! Transactional ordered key/value substrate for the Grove storage layer.
//!
//! This crate provides the `StorageEngine` abstraction, two engine
//! implementations (`MemoryEngine` in-memory and `FjallEngine` on-disk), an
//! optimistically-validated `Transaction` layer on top of them, an
//! order-preserving tuple codec, and a directory layer that maps named paths
//! to stable, prefix-free byte prefixes.

pub mod directory;
pub mod engine;
pub mod error;
pub mod tuple;
pub mod txn;

pub use directory::DirectoryLayer;
pub use engine::{FjallEngine, MemoryEngine, StorageEngine};
pub use error::KvError;
pub use tuple::{pack_segments, strinc, unpack_segments, Segment};
pub use txn::{Database, KeySelector, KeyValue, RangeIterator, Transaction};
