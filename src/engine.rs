//! The engine core: `open`, `put`, `get`, `delete`, `close`, `sync`,
//! `list_keys`, `fold`, plus the shared append path batches and the merge
//! reuse.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use bytes::Bytes;
use fs4::FileExt as _;

use crate::constants::{DATA_FILE_SUFFIX, HINT_FILE_NAME, LOCK_FILE_NAME, NON_TRANSACTION_SEQ_NO, SEQ_NO_FILE_NAME};
use crate::error::{Result, StorageError};
use crate::index::{new_indexer, Index, IndexType};
use crate::iterator::EngineIterator;
use crate::merge;
use crate::options::{IteratorOptions, Options};
use crate::record::{encode_key, LogRecord, LogRecordPosition, RecordType};
use crate::recovery;
use crate::segment::Segment;

/// Point-in-time snapshot of engine health, used by the merge ratio guard
/// and exposed for diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct EngineStats {
    pub key_count: usize,
    pub data_file_count: usize,
    pub reclaimable_bytes: u64,
    pub total_bytes: u64,
}

pub(crate) struct EngineState {
    pub(crate) active_file: Option<Segment>,
    pub(crate) older_files: HashMap<u32, Segment>,
    pub(crate) file_ids: Vec<u32>,
    pub(crate) next_file_id: u32,
    pub(crate) seq_no: u64,
    pub(crate) bytes_since_sync: u64,
    pub(crate) merging: bool,
    pub(crate) reclaimable_bytes: u64,
}

/// An open, embedded key-value store rooted at a single data directory.
pub struct Engine {
    pub(crate) options: Options,
    pub(crate) index: Box<dyn Index>,
    pub(crate) state: RwLock<EngineState>,
    lock_file: Mutex<Option<File>>,
    pub initial: bool,
}

impl Engine {
    pub fn open(options: Options) -> Result<Self> {
        if options.dir_path.as_os_str().is_empty() {
            return Err(StorageError::EmptyDirPath);
        }
        if options.data_file_size == 0 {
            return Err(StorageError::InvalidFileSize);
        }
        if !(0.0..=1.0).contains(&options.data_file_merge_ratio) {
            return Err(StorageError::InvalidMergeRatio);
        }

        let mut initial = false;
        if !options.dir_path.exists() {
            fs::create_dir_all(&options.dir_path)?;
            initial = true;
        }

        let lock_file = acquire_dir_lock(&options.dir_path)?;

        if fs::read_dir(&options.dir_path)?.next().is_none() {
            initial = true;
        }

        merge::load_merge_files(&options.dir_path)?;

        let index = new_indexer(options.index_type, &options.dir_path)?;

        let (mut older_files, mut active_file, file_ids) =
            load_data_files(&options.dir_path, options.mmap_at_startup)?;

        let mut seq_no = NON_TRANSACTION_SEQ_NO;
        let mut reclaimable_bytes = 0u64;
        if matches!(options.index_type, IndexType::BPlusTree) {
            if let Some(loaded) = load_seq_no(&options.dir_path)? {
                seq_no = loaded;
            }
        } else {
            if options.dir_path.join(HINT_FILE_NAME).exists() {
                tracing::debug!("loading index from hint file");
                recovery::load_index_from_hint_file(&options.dir_path, index.as_ref())?;
            }

            let merge_boundary = merge::persisted_merge_boundary(&options.dir_path)?;
            let (loaded_seq_no, loaded_reclaimable_bytes) = recovery::load_index_from_data_files(
                index.as_ref(),
                &file_ids,
                active_file.as_ref(),
                &older_files,
                merge_boundary,
            )?;
            seq_no = loaded_seq_no;
            reclaimable_bytes = loaded_reclaimable_bytes;

            if options.mmap_at_startup {
                if let Some(active) = active_file.as_mut() {
                    active.promote_to_standard(&options.dir_path)?;
                }
                for segment in older_files.values_mut() {
                    segment.promote_to_standard(&options.dir_path)?;
                }
            }
        }

        let next_file_id = file_ids.last().map_or(0, |id| id + 1);

        let state = EngineState {
            active_file,
            older_files,
            file_ids,
            next_file_id,
            seq_no,
            bytes_since_sync: 0,
            merging: false,
            reclaimable_bytes,
        };

        tracing::info!(dir = %options.dir_path.display(), initial, "engine opened");

        Ok(Self {
            options,
            index,
            state: RwLock::new(state),
            lock_file: Mutex::new(Some(lock_file)),
            initial,
        })
    }

    pub fn put(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<()> {
        let key: Bytes = key.into();
        if key.is_empty() {
            return Err(StorageError::EmptyKey);
        }
        let record = LogRecord {
            record_type: RecordType::Normal,
            key: encode_key(&key, NON_TRANSACTION_SEQ_NO),
            value: value.into(),
        };
        let pos = self.append_with_lock(&record)?;
        let old = self.index.put(key.to_vec(), pos)?;
        if let Some(old_pos) = old {
            self.reclaim_position(old_pos)?;
        }
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Bytes> {
        if key.is_empty() {
            return Err(StorageError::EmptyKey);
        }
        let state = self.state.read().expect("engine lock poisoned");
        let pos = self.index.get(key).ok_or(StorageError::KeyNotFound)?;
        self.read_value_at(&state, pos)
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(StorageError::EmptyKey);
        }
        let Some(old_pos) = self.index.get(key) else {
            return Ok(());
        };
        let record = LogRecord {
            record_type: RecordType::Deleted,
            key: encode_key(key, NON_TRANSACTION_SEQ_NO),
            value: Bytes::new(),
        };
        let tombstone_pos = self.append_with_lock(&record)?;
        self.index.delete(key)?;
        self.reclaim_position(old_pos)?;
        self.reclaim_position(tombstone_pos)?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        let state = self.state.read().expect("engine lock poisoned");
        if let Some(active) = state.active_file.as_ref() {
            active.sync()?;
        }
        Ok(())
    }

    pub fn list_keys(&self) -> Result<Vec<Bytes>> {
        let mut iter = self.index.iterator(false);
        iter.rewind();
        let mut keys = Vec::with_capacity(self.index.size());
        while iter.valid() {
            keys.push(Bytes::copy_from_slice(iter.key()));
            iter.next();
        }
        Ok(keys)
    }

    pub fn fold<F>(&self, mut visitor: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<bool>,
    {
        let state = self.state.read().expect("engine lock poisoned");
        let mut iter = self.index.iterator(false);
        iter.rewind();
        while iter.valid() {
            let pos = iter.value();
            let value = self.read_value_at(&state, pos)?;
            if !visitor(iter.key(), &value)? {
                break;
            }
            iter.next();
        }
        Ok(())
    }

    pub fn iter(&self, options: IteratorOptions) -> EngineIterator<'_> {
        EngineIterator::new(self, options)
    }

    pub fn stats(&self) -> Result<EngineStats> {
        let state = self.state.read().expect("engine lock poisoned");
        let mut total_bytes = 0u64;
        if let Some(active) = state.active_file.as_ref() {
            total_bytes += active.size()?;
        }
        for segment in state.older_files.values() {
            total_bytes += segment.size()?;
        }
        Ok(EngineStats {
            key_count: self.index.size(),
            data_file_count: state.file_ids.len(),
            reclaimable_bytes: state.reclaimable_bytes,
            total_bytes,
        })
    }

    pub fn merge(&self) -> Result<()> {
        merge::run(self)
    }

    pub fn close(&self) -> Result<()> {
        let held_lock = self.lock_file.lock().expect("lock-file mutex poisoned").take();

        self.index.close()?;

        if matches!(self.options.index_type, IndexType::BPlusTree) {
            let state = self.state.read().expect("engine lock poisoned");
            save_seq_no(&self.options.dir_path, state.seq_no)?;
        }

        {
            let state = self.state.write().expect("engine lock poisoned");
            if let Some(active) = state.active_file.as_ref() {
                active.sync()?;
                active.close()?;
            }
            for segment in state.older_files.values() {
                segment.close()?;
            }
        }

        if let Some(lock) = held_lock {
            release_dir_lock(lock)?;
        }
        Ok(())
    }

    /// Adds the on-disk size of the record at `pos` to the reclaimable-bytes
    /// tally backing `stats().reclaimable_bytes` and the merge ratio guard.
    /// Called whenever a write makes a previously live record dead: an
    /// overwriting `put`, a `delete`'s old value, and the tombstone record
    /// itself (always dead on arrival).
    pub(crate) fn reclaim_position(&self, pos: LogRecordPosition) -> Result<()> {
        let consumed = {
            let state = self.state.read().expect("engine lock poisoned");
            let segment = self.segment_for(&state, pos.file_id)?;
            let (_, consumed) = segment.read_record(pos.offset as u64)?;
            consumed as u64
        };
        self.state.write().expect("engine lock poisoned").reclaimable_bytes += consumed;
        Ok(())
    }

    pub(crate) fn read_value_at(&self, state: &EngineState, pos: LogRecordPosition) -> Result<Bytes> {
        let segment = self.segment_for(state, pos.file_id)?;
        let (record, _) = segment.read_record(pos.offset as u64)?;
        if record.record_type == RecordType::Deleted {
            return Err(StorageError::KeyNotFound);
        }
        Ok(record.value)
    }

    fn segment_for<'a>(&self, state: &'a EngineState, file_id: u32) -> Result<&'a Segment> {
        if let Some(active) = state.active_file.as_ref() {
            if active.file_id == file_id {
                return Ok(active);
            }
        }
        state
            .older_files
            .get(&file_id)
            .ok_or(StorageError::DataFileNotFound(file_id))
    }

    pub(crate) fn append_with_lock(&self, record: &LogRecord) -> Result<LogRecordPosition> {
        let mut state = self.state.write().expect("engine lock poisoned");
        self.append_locked(&mut state, record)
    }

    pub(crate) fn append_locked(&self, state: &mut EngineState, record: &LogRecord) -> Result<LogRecordPosition> {
        let (bytes, enc_len) = record.encode();

        if state.active_file.is_none() {
            self.open_new_active_file(state)?;
        }

        let active_write_off = state.active_file.as_ref().expect("just ensured above").write_off();
        if active_write_off + enc_len as u64 > self.options.data_file_size {
            self.rotate_active_file(state)?;
        }

        let active = state.active_file.as_mut().expect("just ensured above");
        let file_id = active.file_id;
        let offset_before = active.write(&bytes)?;

        state.bytes_since_sync += enc_len as u64;
        let should_sync = self.options.sync_writes
            || (self.options.bytes_per_sync > 0 && state.bytes_since_sync >= self.options.bytes_per_sync);
        if should_sync {
            state.active_file.as_ref().expect("just written").sync()?;
            state.bytes_since_sync = 0;
        }

        Ok(LogRecordPosition {
            file_id,
            offset: offset_before as i64,
        })
    }

    pub(crate) fn open_new_active_file(&self, state: &mut EngineState) -> Result<()> {
        let file_id = state.next_file_id;
        let segment = Segment::open_data_file(&self.options.dir_path, file_id)?;
        state.file_ids.push(file_id);
        state.next_file_id += 1;
        state.active_file = Some(segment);
        Ok(())
    }

    fn rotate_active_file(&self, state: &mut EngineState) -> Result<()> {
        if let Some(active) = state.active_file.as_ref() {
            active.sync()?;
        }
        let old = state.active_file.take().expect("rotation requires an active file");
        let old_id = old.file_id;
        state.older_files.insert(old_id, old);
        self.open_new_active_file(state)?;
        tracing::info!(closed_segment = old_id, "rotated active segment");
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::error!(error = %err, "failed to cleanly close engine on drop");
        }
    }
}

fn load_data_files(dir: &Path, mmap_at_startup: bool) -> Result<(HashMap<u32, Segment>, Option<Segment>, Vec<u32>)> {
    let mut file_ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(stem) = name.strip_suffix(DATA_FILE_SUFFIX) {
            if let Ok(id) = stem.parse::<u32>() {
                file_ids.push(id);
            }
        }
    }
    file_ids.sort_unstable();

    let mut older_files = HashMap::new();
    let mut active_file = None;
    for (i, &id) in file_ids.iter().enumerate() {
        let is_active = i == file_ids.len() - 1;
        let segment = if is_active {
            // the active segment must stay writable even under
            // `mmap_at_startup`; it is read through the standard backend
            // during the index scan and only completed segments are mapped.
            Segment::open_data_file(dir, id)?
        } else if mmap_at_startup {
            Segment::open_data_file_mmap(dir, id)?
        } else {
            Segment::open_data_file(dir, id)?
        };

        if is_active {
            active_file = Some(segment);
        } else {
            older_files.insert(id, segment);
        }
    }

    Ok((older_files, active_file, file_ids))
}

fn acquire_dir_lock(dir: &Path) -> Result<File> {
    let path = dir.join(LOCK_FILE_NAME);
    let file = OpenOptions::new().create(true).read(true).write(true).open(path)?;
    file.try_lock_exclusive().map_err(|_| StorageError::InUse)?;
    Ok(file)
}

fn release_dir_lock(file: File) -> Result<()> {
    fs4::FileExt::unlock(&file)?;
    Ok(())
}

fn save_seq_no(dir: &Path, seq_no: u64) -> Result<()> {
    let record = LogRecord {
        record_type: RecordType::Normal,
        key: Bytes::new(),
        value: Bytes::from(seq_no.to_string().into_bytes()),
    };
    let mut segment = Segment::open(dir.join(SEQ_NO_FILE_NAME), 0)?;
    let (bytes, _) = record.encode();
    segment.write(&bytes)?;
    segment.sync()?;
    Ok(())
}

fn load_seq_no(dir: &Path) -> Result<Option<u64>> {
    let path = dir.join(SEQ_NO_FILE_NAME);
    if !path.exists() {
        return Ok(None);
    }
    let segment = Segment::open(path.clone(), 0)?;
    let (record, _) = segment.read_record(0)?;
    drop(segment);
    fs::remove_file(&path)?;

    let text = std::str::from_utf8(&record.value).map_err(|_| StorageError::DirCorrupted)?;
    let seq_no = text.parse::<u64>().map_err(|_| StorageError::DirCorrupted)?;
    Ok(Some(seq_no))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_engine(dir: &tempfile::TempDir) -> Engine {
        let options = Options {
            dir_path: dir.path().to_path_buf(),
            ..Options::default()
        };
        Engine::open(options).expect("open engine")
    }

    #[test]
    fn put_get_delete_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = open_engine(&dir);

        engine.put(Bytes::from_static(b"k1"), Bytes::from_static(b"v1")).unwrap();
        assert_eq!(engine.get(b"k1").unwrap(), Bytes::from_static(b"v1"));

        engine.delete(b"k1").unwrap();
        assert!(matches!(engine.get(b"k1"), Err(StorageError::KeyNotFound)));
    }

    #[test]
    fn empty_key_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = open_engine(&dir);
        assert!(matches!(
            engine.put(Bytes::new(), Bytes::from_static(b"v")),
            Err(StorageError::EmptyKey)
        ));
        assert!(matches!(engine.get(b""), Err(StorageError::EmptyKey)));
    }

    #[test]
    fn recovers_after_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let engine = open_engine(&dir);
            engine.put(Bytes::from_static(b"a"), Bytes::from_static(b"1")).unwrap();
            engine.put(Bytes::from_static(b"b"), Bytes::from_static(b"2")).unwrap();
            engine.delete(b"a").unwrap();
        }

        let engine = open_engine(&dir);
        assert!(matches!(engine.get(b"a"), Err(StorageError::KeyNotFound)));
        assert_eq!(engine.get(b"b").unwrap(), Bytes::from_static(b"2"));
    }

    #[test]
    fn segment_rotation_on_size_threshold() {
        let dir = tempfile::tempdir().expect("tempdir");
        let options = Options {
            dir_path: dir.path().to_path_buf(),
            data_file_size: 64,
            ..Options::default()
        };
        let engine = Engine::open(options).expect("open engine");
        for i in 0..50u32 {
            let key = format!("key-{i}");
            engine.put(Bytes::from(key.into_bytes()), Bytes::from_static(b"0123456789")).unwrap();
        }
        let stats = engine.stats().unwrap();
        assert!(stats.data_file_count > 1, "expected rotation to produce more than one segment");
    }

    #[test]
    fn double_open_without_close_fails_with_in_use() {
        let dir = tempfile::tempdir().expect("tempdir");
        let _first = open_engine(&dir);
        let options = Options {
            dir_path: dir.path().to_path_buf(),
            ..Options::default()
        };
        let second = Engine::open(options);
        assert!(matches!(second, Err(StorageError::InUse)));
    }

    #[test]
    fn empty_directory_deletes_non_empty_value_on_missing_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = open_engine(&dir);
        // deleting a never-written key is a no-op, not an error
        engine.delete(b"never-written").unwrap();
    }
}
