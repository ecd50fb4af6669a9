//! In-memory adaptive-structure index. Backed by an unordered `HashMap` —
//! average O(k) point lookups, same as a radix tree — with ordering only
//! materialized on demand via the shared snapshot iterator.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::Result;
use crate::record::LogRecordPosition;

use super::{Index, IndexIterator, SnapshotIterator};

#[derive(Debug, Default)]
pub struct ArtIndex {
    entries: RwLock<HashMap<Vec<u8>, LogRecordPosition>>,
}

impl ArtIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Index for ArtIndex {
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
