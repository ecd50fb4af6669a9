//! Persistent index backend: an append-and-compact log of `LogRecord`s
//! (reusing the record codec from `record.rs`) whose key/value are the
//! index entry's key and encoded `LogRecordPosition`. Survives a restart,
//! each mutation is a short, fsynced write transaction, and iteration opens
//! a read-only point-in-time snapshot of an in-memory mirror compacted from
//! the log.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};

use bytes::Bytes;

use crate::constants::BPTREE_INDEX_FILE_NAME;
use crate::error::Result;
use crate::record::{encode_position, LogRecord, LogRecordPosition, RecordType};
use crate::segment::Segment;

use super::{Index, IndexIterator, SnapshotIterator};

/// Rewrite the on-disk log from scratch once this many mutations have
/// accumulated since the last compaction.
const COMPACT_THRESHOLD: usize = 10_000;

#[derive(Debug)]
pub struct BPlusTreeIndex {
    dir_path: PathBuf,
    entries: RwLock<BTreeMap<Vec<u8>, LogRecordPosition>>,
    append_log: Mutex<Segment>,
    pending_since_compaction: Mutex<usize>,
}

impl BPlusTreeIndex {
    pub fn open(dir_path: impl Into<PathBuf>) -> Result<Self> {
        let dir_path = dir_path.into();
        let path = dir_path.join(BPTREE_INDEX_FILE_NAME);
        let mut entries = BTreeMap::new();

        let segment = Segment::open(path, 0)?;
        let mut offset = 0u64;
        loop {
            match segment.read_record(offset) {
                Ok((record, consumed)) => {
                    match record.record_type {
                        RecordType::Deleted => {
                            entries.remove(record.key.as_ref());
                        }
                        _ => {
                            let pos = crate::record::decode_position(&record.value)?;
                            entries.insert(record.key.to_vec(), pos);
                        }
                    }
                    offset += consumed as u64;
                }
                Err(crate::error::StorageError::EndOfSegment) => break,
                Err(e) => return Err(e),
            }
        }

        Ok(Self {
            dir_path,
            entries: RwLock::new(entries),
            append_log: Mutex::new(segment),
            pending_since_compaction: Mutex::new(0),
        })
    }

    fn append(&self, record: &LogRecord) -> Result<()> {
        let (bytes, _) = record.encode();
        {
            let mut segment = self.append_log.lock().expect("bptree log mutex poisoned");
            segment.write(&bytes)?;
            segment.sync()?;
        }

        let mut pending = self.pending_since_compaction.lock().expect("bptree counter mutex poisoned");
        *pending += 1;
        if *pending >= COMPACT_THRESHOLD {
            *pending = 0;
            drop(pending);
            self.compact()?;
        }
        Ok(())
    }

    fn compact(&self) -> Result<()> {
        let path = self.dir_path.join(BPTREE_INDEX_FILE_NAME);
        let tmp_path = self.dir_path.join(format!("{BPTREE_INDEX_FILE_NAME}.compact"));

        {
            let entries = self.entries.read().expect("bptree entries lock poisoned");
            let mut tmp_segment = Segment::open(tmp_path.clone(), 0)?;
            for (key, pos) in entries.iter() {
                let record = LogRecord {
                    record_type: RecordType::Normal,
                    key: Bytes::copy_from_slice(key),
                    value: Bytes::from(encode_position(pos)),
                };
                let (bytes, _) = record.encode();
                tmp_segment.write(&bytes)?;
            }
            tmp_segment.sync()?;
        }

        fs::rename(&tmp_path, &path)?;
        let reopened = Segment::open(path, 0)?;
        *self.append_log.lock().expect("bptree log mutex poisoned") = reopened;
        Ok(())
    }
}

impl Index for BPlusTreeIndex {
    fn put(&self, key: Vec<u8>, pos: LogRecordPosition) -> Result<Option<LogRecordPosition>> {
        let record = LogRecord {
            record_type: RecordType::Normal,
            key: Bytes::from(key.clone()),
            value: Bytes::from(encode_position(&pos)),
        };
        self.append(&record)?;
        Ok(self.entries.write().expect("bptree entries lock poisoned").insert(key, pos))
    }

    fn get(&self, key: &[u8]) -> Option<LogRecordPosition> {
        self.entries.read().expect("bptree entries lock poisoned").get(key).copied()
    }

    fn delete(&self, key: &[u8]) -> Result<Option<(LogRecordPosition, bool)>> {
        let old = self.entries.write().expect("bptree entries lock poisoned").remove(key);
        let Some(old) = old else {
            return Ok(None);
        };
        let record = LogRecord {
            record_type: RecordType::Deleted,
            key: Bytes::copy_from_slice(key),
            value: Bytes::new(),
        };
        self.append(&record)?;
        Ok(Some((old, true)))
    }

    fn size(&self) -> usize {
        self.entries.read().expect("bptree entries lock poisoned").len()
    }

    fn iterator(&self, reverse: bool) -> Box<dyn IndexIterator> {
        let snapshot = self
            .entries
            .read()
            .expect("bptree entries lock poisoned")
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        Box::new(SnapshotIterator::new(snapshot, reverse))
    }

    fn close(&self) -> Result<()> {
        self.compact()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(offset: i64) -> LogRecordPosition {
        LogRecordPosition { file_id: 0, offset }
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let index = BPlusTreeIndex::open(dir.path()).expect("open");
            index.put(b"a".to_vec(), pos(1)).unwrap();
            index.put(b"b".to_vec(), pos(2)).unwrap();
            index.delete(b"a").unwrap();
        }
        let reopened = BPlusTreeIndex::open(dir.path()).expect("reopen");
        assert_eq!(reopened.get(b"a"), None);
        assert_eq!(reopened.get(b"b"), Some(pos(2)));
    }

    #[test]
    fn compact_preserves_latest_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let index = BPlusTreeIndex::open(dir.path()).expect("open");
        index.put(b"a".to_vec(), pos(1)).unwrap();
        index.put(b"a".to_vec(), pos(2)).unwrap();
        index.compact().expect("compact");
        assert_eq!(index.get(b"a"), Some(pos(2)));

        drop(index);
        let reopened = BPlusTreeIndex::open(dir.path()).expect("reopen");
        assert_eq!(reopened.get(b"a"), Some(pos(2)));
    }
}
