//! Atomic multi-key batch commits. Writes are staged under a key-ordered map
//! and only touch the engine once `commit` is called, at which point every
//! staged record lands under one sequence number terminated by a durable
//! `TxnFinish` marker.

use std::collections::BTreeMap;
use std::sync::Mutex;

use bytes::Bytes;

use crate::constants::TXN_FINISHED_KEY;
use crate::engine::Engine;
use crate::error::{Result, StorageError};
use crate::options::WriteBatchOptions;
use crate::record::{encode_key, LogRecord, RecordType};

/// Ordered staging area for a single atomic commit. Multiple batches may be
/// open against the same `Engine` concurrently; each stages independently
/// and only takes the engine write lock during `commit`.
pub struct WriteBatch<'e> {
    engine: &'e Engine,
    options: WriteBatchOptions,
    pending_writes: Mutex<BTreeMap<Vec<u8>, LogRecord>>,
}

impl<'e> WriteBatch<'e> {
    pub(crate) fn new(engine: &'e Engine, options: WriteBatchOptions) -> Self {
        Self {
            engine,
            options,
            pending_writes: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn put(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<()> {
        let key: Bytes = key.into();
        if key.is_empty() {
            return Err(StorageError::EmptyKey);
        }
        let record = LogRecord {
            record_type: RecordType::Normal,
            key: key.clone(),
            value: value.into(),
        };
        self.pending_writes
            .lock()
            .expect("batch staging mutex poisoned")
            .insert(key.to_vec(), record);
        Ok(())
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(StorageError::EmptyKey);
        }

        let mut staging = self.pending_writes.lock().expect("batch staging mutex poisoned");
        let live = self.engine.index.get(key).is_some();

        if staging.remove(key).is_some() {
            if !live {
                return Ok(());
            }
        } else if !live {
            return Ok(());
        }

        staging.insert(
            key.to_vec(),
            LogRecord {
                record_type: RecordType::Deleted,
                key: Bytes::copy_from_slice(key),
                value: Bytes::new(),
            },
        );
        Ok(())
    }

    /// Commits every staged write atomically: all records land under one
    /// sequence number, terminated by a durable `TxnFinish` marker. A crash
    /// before that marker is flushed leaves the whole batch unobserved on
    /// the next recovery.
    pub fn commit(&self) -> Result<()> {
        let staging = {
            let mut guard = self.pending_writes.lock().expect("batch staging mutex poisoned");
            if guard.is_empty() {
                return Ok(());
            }
            if guard.len() > self.options.max_batch_num {
                return Err(StorageError::BatchTooLarge);
            }
            std::mem::take(&mut *guard)
        };

        let mut state = self.engine.state.write().expect("engine lock poisoned");
        let seq = state.seq_no + 1;
        state.seq_no = seq;

        let mut positions = Vec::with_capacity(staging.len());
        for (raw_key, record) in &staging {
            let encoded = LogRecord {
                record_type: record.record_type,
                key: encode_key(raw_key, seq),
                value: record.value.clone(),
            };
            let pos = self.engine.append_locked(&mut state, &encoded)?;
            positions.push((raw_key.clone(), record.record_type, pos));
        }

        let finish = LogRecord {
            record_type: RecordType::TxnFinish,
            key: encode_key(TXN_FINISHED_KEY, seq),
            value: Bytes::new(),
        };
        self.engine.append_locked(&mut state, &finish)?;

        if self.options.sync_writes {
            if let Some(active) = state.active_file.as_ref() {
                active.sync()?;
            }
        }
        drop(state);

        for (raw_key, record_type, pos) in positions {
            match record_type {
                RecordType::Deleted => {
                    if let Some((old_pos, _)) = self.engine.index.delete(&raw_key)? {
                        self.engine.reclaim_position(old_pos)?;
                    }
                    self.engine.reclaim_position(pos)?;
                }
                RecordType::Normal | RecordType::TxnFinish => {
                    if let Some(old_pos) = self.engine.index.put(raw_key, pos)? {
                        self.engine.reclaim_position(old_pos)?;
                    }
                }
            }
        }

        Ok(())
    }
}

impl Engine {
    pub fn new_write_batch(&self, options: WriteBatchOptions) -> WriteBatch<'_> {
        WriteBatch::new(self, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;

    fn open_engine(dir: &tempfile::TempDir) -> Engine {
        let options = Options {
            dir_path: dir.path().to_path_buf(),
            ..Options::default()
        };
        Engine::open(options).expect("open engine")
    }

    #[test]
    fn commit_applies_all_staged_writes_atomically() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = open_engine(&dir);

        let batch = engine.new_write_batch(WriteBatchOptions::default());
        batch.put(Bytes::from_static(b"a"), Bytes::from_static(b"1")).unwrap();
        batch.put(Bytes::from_static(b"b"), Bytes::from_static(b"2")).unwrap();
        batch.commit().unwrap();

        assert_eq!(engine.get(b"a").unwrap(), Bytes::from_static(b"1"));
        assert_eq!(engine.get(b"b").unwrap(), Bytes::from_static(b"2"));
    }

    #[test]
    fn uncommitted_batch_is_invisible() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = open_engine(&dir);

        let batch = engine.new_write_batch(WriteBatchOptions::default());
        batch.put(Bytes::from_static(b"a"), Bytes::from_static(b"1")).unwrap();
        assert!(matches!(engine.get(b"a"), Err(StorageError::KeyNotFound)));
    }

    #[test]
    fn delete_cancels_staged_put_for_never_written_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = open_engine(&dir);

        let batch = engine.new_write_batch(WriteBatchOptions::default());
        batch.put(Bytes::from_static(b"a"), Bytes::from_static(b"1")).unwrap();
        batch.delete(b"a").unwrap();
        batch.commit().unwrap();

        assert!(matches!(engine.get(b"a"), Err(StorageError::KeyNotFound)));
    }

    #[test]
    fn oversized_batch_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = open_engine(&dir);

        let batch = engine.new_write_batch(WriteBatchOptions {
            max_batch_num: 2,
            sync_writes: true,
        });
        batch.put(Bytes::from_static(b"a"), Bytes::from_static(b"1")).unwrap();
        batch.put(Bytes::from_static(b"b"), Bytes::from_static(b"2")).unwrap();
        batch.put(Bytes::from_static(b"c"), Bytes::from_static(b"3")).unwrap();
        assert!(matches!(batch.commit(), Err(StorageError::BatchTooLarge)));
    }

    #[test]
    fn rejected_batch_keeps_staged_writes_for_retry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = open_engine(&dir);

        let batch = engine.new_write_batch(WriteBatchOptions {
            max_batch_num: 2,
            sync_writes: true,
        });
        batch.put(Bytes::from_static(b"a"), Bytes::from_static(b"1")).unwrap();
        batch.put(Bytes::from_static(b"b"), Bytes::from_static(b"2")).unwrap();
        batch.put(Bytes::from_static(b"c"), Bytes::from_static(b"3")).unwrap();
        assert!(matches!(batch.commit(), Err(StorageError::BatchTooLarge)));

        batch.delete(b"c").unwrap();
        batch.commit().unwrap();

        assert_eq!(engine.get(b"a").unwrap(), Bytes::from_static(b"1"));
        assert_eq!(engine.get(b"b").unwrap(), Bytes::from_static(b"2"));
        assert!(matches!(engine.get(b"c"), Err(StorageError::KeyNotFound)));
    }

    #[test]
    fn batch_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let engine = open_engine(&dir);
            let batch = engine.new_write_batch(WriteBatchOptions::default());
            batch.put(Bytes::from_static(b"a"), Bytes::from_static(b"1")).unwrap();
            batch.put(Bytes::from_static(b"b"), Bytes::from_static(b"2")).unwrap();
            batch.commit().unwrap();
        }

        let engine = open_engine(&dir);
        assert_eq!(engine.get(b"a").unwrap(), Bytes::from_static(b"1"));
        assert_eq!(engine.get(b"b").unwrap(), Bytes::from_static(b"2"));
    }
}
