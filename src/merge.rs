//! Offline merge/compaction: sync and rotate the active file under the write
//! lock, snapshot the older files, rewrite only their live records (with the
//! sequence prefix stripped) into a side `<dir>-merge` instance, write a hint
//! file alongside it, then install the result as the new segment set on the
//! next open.

use std::fs;
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::constants::{
    DATA_FILE_SUFFIX, HINT_FILE_NAME, LOCK_FILE_NAME, MERGE_DIR_SUFFIX, MERGE_FINISHED_FILE_NAME,
    NON_TRANSACTION_SEQ_NO, SEQ_NO_FILE_NAME,
};
use crate::engine::Engine;
use crate::error::{Result, StorageError};
use crate::options::Options;
use crate::record::{encode_key, encode_position, parse_key, LogRecord, RecordType};
use crate::segment::{segment_path, Segment};

pub(crate) fn merge_dir_path(dir: &Path) -> PathBuf {
    let parent = dir.parent().unwrap_or_else(|| Path::new(""));
    let base = dir.file_name().unwrap_or_default();
    parent.join(format!("{}{MERGE_DIR_SUFFIX}", base.to_string_lossy()))
}

/// Reads the boundary recorded by the last completed merge, `0` if none has
/// ever run. Every data file with an id below this boundary is fully
/// represented by the hint file and must not be rescanned during recovery.
pub(crate) fn persisted_merge_boundary(dir: &Path) -> Result<u32> {
    let path = dir.join(MERGE_FINISHED_FILE_NAME);
    if !path.exists() {
        return Ok(0);
    }
    let segment = Segment::open(path, 0)?;
    let (record, _) = segment.read_record(0)?;
    parse_boundary(&record.value)
}

fn parse_boundary(value: &[u8]) -> Result<u32> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .ok_or(StorageError::DirCorrupted)
}

/// Installs a previously completed merge, if one is waiting in `<dir>-merge`.
/// Runs once, at the very start of `Engine::open`, before segments are
/// loaded.
pub(crate) fn load_merge_files(dir: &Path) -> Result<()> {
    let merge_dir = merge_dir_path(dir);
    if !merge_dir.exists() {
        return Ok(());
    }

    let marker_path = merge_dir.join(MERGE_FINISHED_FILE_NAME);
    if !marker_path.exists() {
        tracing::warn!("found an incomplete merge directory, discarding it");
        fs::remove_dir_all(&merge_dir)?;
        return Ok(());
    }

    let marker_segment = Segment::open(marker_path, 0)?;
    let (record, _) = marker_segment.read_record(0)?;
    let boundary = parse_boundary(&record.value)?;
    drop(marker_segment);

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(stem) = name.strip_suffix(DATA_FILE_SUFFIX) {
            if let Ok(id) = stem.parse::<u32>() {
                if id < boundary {
                    fs::remove_file(entry.path())?;
                }
            }
        }
    }

    let existing_marker = dir.join(MERGE_FINISHED_FILE_NAME);
    if existing_marker.exists() {
        fs::remove_file(&existing_marker)?;
    }

    for entry in fs::read_dir(&merge_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if name == SEQ_NO_FILE_NAME || name == LOCK_FILE_NAME {
            continue;
        }
        fs::rename(entry.path(), dir.join(&name))?;
    }

    fs::remove_dir_all(&merge_dir)?;
    tracing::info!(boundary, "installed merge output");
    Ok(())
}

/// Runs a full merge cycle against an already-open `engine`.
pub(crate) fn run(engine: &Engine) -> Result<()> {
    let outcome = begin(engine)?;
    let Some((merge_file_ids, boundary)) = outcome else {
        return Ok(());
    };

    let result = rewrite(engine, &merge_file_ids, boundary);

    let mut state = engine.state.write().expect("engine lock poisoned");
    state.merging = false;
    result
}

fn begin(engine: &Engine) -> Result<Option<(Vec<u32>, u32)>> {
    let mut state = engine.state.write().expect("engine lock poisoned");
    if state.active_file.is_none() {
        return Ok(None);
    }
    if state.merging {
        return Err(StorageError::MergeInProgress);
    }

    let mut total_bytes = 0u64;
    if let Some(active) = state.active_file.as_ref() {
        total_bytes += active.size()?;
    }
    for segment in state.older_files.values() {
        total_bytes += segment.size()?;
    }
    if total_bytes > 0 {
        let ratio = state.reclaimable_bytes as f64 / total_bytes as f64;
        if (ratio as f32) < engine.options.data_file_merge_ratio {
            return Err(StorageError::MergeRatioUnreached);
        }
    }
    let available = fs4::available_space(&engine.options.dir_path)?;
    if available < total_bytes {
        return Err(StorageError::NotEnoughSpaceForMerge);
    }

    state.merging = true;

    let outcome = (|| -> Result<(Vec<u32>, u32)> {
        state.active_file.as_ref().expect("checked above").sync()?;
        let old = state.active_file.take().expect("checked above");
        let old_id = old.file_id;
        state.older_files.insert(old_id, old);
        engine.open_new_active_file(&mut state)?;
        let boundary = state.active_file.as_ref().expect("just opened").file_id;

        let mut ids: Vec<u32> = state.older_files.keys().copied().collect();
        ids.sort_unstable();
        Ok((ids, boundary))
    })();

    match outcome {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            state.merging = false;
            Err(e)
        }
    }
}

fn rewrite(engine: &Engine, merge_file_ids: &[u32], boundary: u32) -> Result<()> {
    let main_dir = engine.options.dir_path.clone();
    let merge_dir = merge_dir_path(&main_dir);
    if merge_dir.exists() {
        fs::remove_dir_all(&merge_dir)?;
    }
    fs::create_dir_all(&merge_dir)?;

    let merge_options = Options {
        dir_path: merge_dir.clone(),
        sync_writes: false,
        ..engine.options.clone()
    };
    let merge_engine = Engine::open(merge_options)?;

    let mut hint_segment = Segment::open(merge_dir.join(HINT_FILE_NAME), 0)?;

    for &file_id in merge_file_ids {
        let segment = Segment::open(segment_path(&main_dir, file_id), file_id)?;
        let mut offset = 0u64;
        loop {
            match segment.read_record(offset) {
                Ok((record, consumed)) => {
                    let (raw_key, _seq) = parse_key(&record.key);
                    let current = engine.index.get(&raw_key);
                    let is_live = current
                        .map(|pos| pos.file_id == file_id && pos.offset == offset as i64)
                        .unwrap_or(false);

                    if is_live {
                        let stripped = LogRecord {
                            record_type: record.record_type,
                            key: encode_key(&raw_key, NON_TRANSACTION_SEQ_NO),
                            value: record.value.clone(),
                        };
                        let new_pos = merge_engine.append_with_lock(&stripped)?;

                        let hint_record = LogRecord {
                            record_type: RecordType::Normal,
                            key: Bytes::from(raw_key),
                            value: Bytes::from(encode_position(&new_pos)),
                        };
                        let (bytes, _) = hint_record.encode();
                        hint_segment.write(&bytes)?;
                    }

                    offset += consumed as u64;
                }
                Err(StorageError::EndOfSegment) => break,
                Err(e) => return Err(e),
            }
        }
    }

    hint_segment.sync()?;
    merge_engine.sync()?;
    merge_engine.close()?;

    let marker_record = LogRecord {
        record_type: RecordType::Normal,
        key: Bytes::new(),
        value: Bytes::from(boundary.to_string().into_bytes()),
    };
    let mut marker_segment = Segment::open(merge_dir.join(MERGE_FINISHED_FILE_NAME), 0)?;
    let (bytes, _) = marker_record.encode();
    marker_segment.write(&bytes)?;
    marker_segment.sync()?;

    tracing::info!(boundary, merged_segments = merge_file_ids.len(), "merge completed");
    Ok(())
}
