//! Index backend abstraction: an `Index` trait (`put`/`get`/`delete`/
//! `iterator`/`list_keys`) with three concrete backends, each providing its
//! own internal synchronization.

mod art;
mod bptree;
mod btree;

pub use art::ArtIndex;
pub use bptree::BPlusTreeIndex;
pub use btree::BTreeIndex;

use std::path::Path;

use crate::error::Result;
use crate::record::LogRecordPosition;

pub trait Index: Send + Sync + std::fmt::Debug {
    /// Inserts or replaces `key`, returning the position it previously
    /// pointed at, if any.
    fn put(&self, key: Vec<u8>, pos: LogRecordPosition) -> Result<Option<LogRecordPosition>>;

    fn get(&self, key: &[u8]) -> Option<LogRecordPosition>;

    /// Removes `key`, returning its old position and whether the underlying
    /// backend confirms the removal (always `true` for the in-memory
    /// backends; may be `false` for the disk-backed one on a failed write).
    fn delete(&self, key: &[u8]) -> Result<Option<(LogRecordPosition, bool)>>;

    fn size(&self) -> usize;

    /// Opens a point-in-time snapshot iterator over the index.
    fn iterator(&self, reverse: bool) -> Box<dyn IndexIterator>;

    fn close(&self) -> Result<()>;
}

pub trait IndexIterator: Send {
    fn rewind(&mut self);
    /// Positions the cursor at the first key `>= target` (or `<= target`
    /// when iterating in reverse).
    fn seek(&mut self, target: &[u8]);
    fn next(&mut self);
    fn valid(&self) -> bool;
    fn key(&self) -> &[u8];
    fn value(&self) -> LogRecordPosition;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    BTree,
    Art,
    BPlusTree,
}

pub(crate) fn new_indexer(index_type: IndexType, dir_path: &Path) -> Result<Box<dyn Index>> {
    Ok(match index_type {
        IndexType::BTree => Box::new(BTreeIndex::new()),
        IndexType::Art => Box::new(ArtIndex::new()),
        IndexType::BPlusTree => Box::new(BPlusTreeIndex::open(dir_path)?),
    })
}

/// Forward/reverse cursor over a sorted snapshot `Vec`, shared by the
/// `BTreeIndex`, `ArtIndex`, and `BPlusTreeIndex` backends — each of which
/// materializes its own snapshot differently but all of which hand it the
/// same traversal semantics.
pub(crate) struct SnapshotIterator {
    entries: Vec<(Vec<u8>, LogRecordPosition)>,
    reverse: bool,
    cursor: usize,
}

impl SnapshotIterator {
    pub(crate) fn new(mut entries: Vec<(Vec<u8>, LogRecordPosition)>, reverse: bool) -> Self {
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        if reverse {
            entries.reverse();
        }
        Self { entries, reverse, cursor: 0 }
    }
}

impl IndexIterator for SnapshotIterator {
    fn rewind(&mut self) {
        self.cursor = 0;
    }

    fn seek(&mut self, target: &[u8]) {
        self.cursor = if self.reverse {
            self.entries.partition_point(|(k, _)| k.as_slice() > target)
        } else {
            self.entries.partition_point(|(k, _)| k.as_slice() < target)
        };
    }

    fn next(&mut self) {
        self.cursor += 1;
    }

    fn valid(&self) -> bool {
        self.cursor < self.entries.len()
    }

    fn key(&self) -> &[u8] {
        &self.entries[self.cursor].0
    }

    fn value(&self) -> LogRecordPosition {
        self.entries[self.cursor].1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(offset: i64) -> LogRecordPosition {
        LogRecordPosition { file_id: 0, offset }
    }

    #[test]
    fn forward_seek_lands_on_first_key_gte_target() {
        let entries = vec![
            (b"a".to_vec(), pos(0)),
            (b"c".to_vec(), pos(1)),
            (b"e".to_vec(), pos(2)),
        ];
        let mut it = SnapshotIterator::new(entries, false);
        it.seek(b"b");
        assert_eq!(it.key(), b"c");
    }

    #[test]
    fn reverse_seek_lands_on_first_key_lte_target() {
        let entries = vec![
            (b"a".to_vec(), pos(0)),
            (b"c".to_vec(), pos(1)),
            (b"e".to_vec(), pos(2)),
        ];
        let mut it = SnapshotIterator::new(entries, true);
        it.seek(b"d");
        assert_eq!(it.key(), b"c");
    }
}
