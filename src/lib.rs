//! `bitkeg`: an embedded, single-process, persistent key-value store
//! following the Bitcask model — an append-only log of records per data
//! directory, an in-memory index mapping keys to log positions, and offline
//! merge to reclaim space.
//!
//! Start with [`Engine::open`]; see `demos/basic_operations.rs` for a
//! complete walkthrough of put/get/delete, batches, and iteration.

mod batch;
mod constants;
mod engine;
mod error;
mod index;
mod io;
mod iterator;
mod merge;
mod options;
mod record;
mod recovery;
mod segment;
mod varint;

pub use batch::WriteBatch;
pub use engine::{Engine, EngineStats};
pub use error::{Result, StorageError};
pub use index::IndexType;
pub use iterator::EngineIterator;
pub use options::{IteratorOptions, Options, WriteBatchOptions};
pub use record::{LogRecordPosition, RecordType};
