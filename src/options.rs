//! Configuration structs for opening an engine, staging a batch, and
//! iterating.

use std::path::PathBuf;

pub use crate::index::IndexType;

/// Engine configuration. Construct with
/// `Options { dir_path: ..., ..Default::default() }`.
#[derive(Debug, Clone)]
pub struct Options {
    pub dir_path: PathBuf,
    pub data_file_size: u64,
    pub sync_writes: bool,
    pub bytes_per_sync: u64,
    pub index_type: IndexType,
    pub mmap_at_startup: bool,
    pub data_file_merge_ratio: f32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dir_path: PathBuf::from("/tmp/bitkeg"),
            data_file_size: 256 * 1024 * 1024,
            sync_writes: false,
            bytes_per_sync: 0,
            index_type: IndexType::BTree,
            mmap_at_startup: false,
            data_file_merge_ratio: 0.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WriteBatchOptions {
    pub max_batch_num: usize,
    pub sync_writes: bool,
}

impl Default for WriteBatchOptions {
    fn default() -> Self {
        Self {
            max_batch_num: 10_000,
            sync_writes: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IteratorOptions {
    pub prefix: Vec<u8>,
    pub reverse: bool,
}
