//! In-memory ordered index backed by a `BTreeMap` under a `RwLock`.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::error::Result;
use crate::record::LogRecordPosition;

use super::{Index, IndexIterator, SnapshotIterator};

#[derive(Debug, Default)]
pub struct BTreeIndex {
    entries: RwLock<BTreeMap<Vec<u8>, LogRecordPosition>>,
}

impl BTreeIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Index for BTreeIndex {
    fn put(&self, key: Vec<u8>, pos: LogRecordPosition) -> Result<Option<LogRecordPosition>> {
        Ok(self.entries.write().expect("index lock poisoned").insert(key, pos))
    }

    fn get(&self, key: &[u8]) -> Option<LogRecordPosition> {
        self.entries.read().expect("index lock poisoned").get(key).copied()
    }

    fn delete(&self, key: &[u8]) -> Result<Option<(LogRecordPosition, bool)>> {
        Ok(self
            .entries
            .write()
            .expect("index lock poisoned")
            .remove(key)
            .map(|old| (old, true)))
    }

    fn size(&self) -> usize {
        self.entries.read().expect("index lock poisoned").len()
    }

    fn iterator(&self, reverse: bool) -> Box<dyn IndexIterator> {
        let snapshot = self
            .entries
            .read()
            .expect("index lock poisoned")
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        Box::new(SnapshotIterator::new(snapshot, reverse))
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(offset: i64) -> LogRecordPosition {
        LogRecordPosition { file_id: 0, offset }
    }

    #[test]
    fn put_get_delete() {
        let index = BTreeIndex::new();
        assert_eq!(index.put(b"a".to_vec(), pos(1)).unwrap(), None);
        assert_eq!(index.get(b"a"), Some(pos(1)));
        assert_eq!(index.put(b"a".to_vec(), pos(2)).unwrap(), Some(pos(1)));
        assert_eq!(index.delete(b"a").unwrap(), Some((pos(2), true)));
        assert_eq!(index.get(b"a"), None);
        assert_eq!(index.delete(b"a").unwrap(), None);
    }

    #[test]
    fn iterates_in_sorted_order() {
        let index = BTreeIndex::new();
        for (k, p) in [(b"c".to_vec(), 0), (b"a".to_vec(), 1), (b"b".to_vec(), 2)] {
            index.put(k, pos(p)).unwrap();
        }
        let mut it = index.iterator(false);
        it.rewind();
        let mut keys = Vec::new();
        while it.valid() {
            keys.push(it.key().to_vec());
            it.next();
        }
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }
}
