//! Startup recovery: rebuilding the index from the segment log and, where
//! present, the hint file.

use std::collections::HashMap;
use std::path::Path;

use crate::constants::{HINT_FILE_NAME, NON_TRANSACTION_SEQ_NO};
use crate::error::{Result, StorageError};
use crate::index::Index;
use crate::record::{decode_position, parse_key, LogRecordPosition, RecordType};
use crate::segment::Segment;

/// Replays the hint file (if any) directly into the index: each hint record
/// is `key -> encoded LogRecordPosition`, already stripped of the sequence
/// prefix and already reflecting only the live record for that key as of
/// the last merge.
pub(crate) fn load_index_from_hint_file(dir: &Path, index: &dyn Index) -> Result<()> {
    let path = dir.join(HINT_FILE_NAME);
    if !path.exists() {
        return Ok(());
    }

    let segment = Segment::open(path, 0)?;
    let mut offset = 0u64;
    loop {
        match segment.read_record(offset) {
            Ok((record, consumed)) => {
                let pos = decode_position(&record.value)?;
                index.put(record.key.to_vec(), pos)?;
                offset += consumed as u64;
            }
            Err(StorageError::EndOfSegment) => break,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Scans every segment from `merge_boundary` onward (segments merged away
/// already have their effect captured by the hint file) and replays each
/// record into the index, buffering transactional writes until their
/// `TxnFinish` marker arrives. Returns the highest sequence number observed
/// (for the in-memory engine's `seq_no` counter to resume from) and the
/// total on-disk size of every record the replay finds already dead — a
/// tombstone, or a position a later write superseded — so the merge ratio
/// guard sees the garbage accumulated before this open, not just what the
/// current process produces.
pub(crate) fn load_index_from_data_files(
    index: &dyn Index,
    file_ids: &[u32],
    active_file: Option<&Segment>,
    older_files: &HashMap<u32, Segment>,
    merge_boundary: u32,
) -> Result<(u64, u64)> {
    let mut max_seq = NON_TRANSACTION_SEQ_NO;
    let mut reclaimable_bytes = 0u64;
    let mut pending: HashMap<u64, Vec<(Vec<u8>, RecordType, LogRecordPosition)>> = HashMap::new();

    for &file_id in file_ids {
        if file_id < merge_boundary {
            continue;
        }
        let segment = segment_for_file_id(active_file, older_files, file_id)?;

        let mut offset = 0u64;
        loop {
            match segment.read_record(offset) {
                Ok((record, consumed)) => {
                    let pos = LogRecordPosition { file_id, offset: offset as i64 };
                    let (raw_key, seq) = parse_key(&record.key);
                    max_seq = max_seq.max(seq);

                    if seq == NON_TRANSACTION_SEQ_NO {
                        apply(
                            index,
                            &raw_key,
                            record.record_type,
                            pos,
                            active_file,
                            older_files,
                            &mut reclaimable_bytes,
                        )?;
                    } else if record.record_type == RecordType::TxnFinish {
                        if let Some(batch) = pending.remove(&seq) {
                            for (key, record_type, batch_pos) in batch {
                                apply(
                                    index,
                                    &key,
                                    record_type,
                                    batch_pos,
                                    active_file,
                                    older_files,
                                    &mut reclaimable_bytes,
                                )?;
                            }
                        }
                    } else {
                        pending
                            .entry(seq)
                            .or_default()
                            .push((raw_key, record.record_type, pos));
                    }

                    offset += consumed as u64;
                }
                Err(StorageError::EndOfSegment) => break,
                Err(e) => return Err(e),
            }
        }
    }

    Ok((max_seq, reclaimable_bytes))
}

fn segment_for_file_id<'a>(
    active_file: Option<&'a Segment>,
    older_files: &'a HashMap<u32, Segment>,
    file_id: u32,
) -> Result<&'a Segment> {
    if active_file.map(|s| s.file_id) == Some(file_id) {
        Ok(active_file.expect("checked by the comparison above"))
    } else {
        older_files.get(&file_id).ok_or(StorageError::DataFileNotFound(file_id))
    }
}

fn apply(
    index: &dyn Index,
    key: &[u8],
    record_type: RecordType,
    pos: LogRecordPosition,
    active_file: Option<&Segment>,
    older_files: &HashMap<u32, Segment>,
    reclaimable_bytes: &mut u64,
) -> Result<()> {
    let superseded = match record_type {
        RecordType::Deleted => {
            // the tombstone record itself is dead on arrival
            reclaim(active_file, older_files, pos, reclaimable_bytes)?;
            index.delete(key)?.map(|(old_pos, _)| old_pos)
        }
        RecordType::Normal | RecordType::TxnFinish => index.put(key.to_vec(), pos)?,
    };
    if let Some(old_pos) = superseded {
        reclaim(active_file, older_files, old_pos, reclaimable_bytes)?;
    }
    Ok(())
}

fn reclaim(
    active_file: Option<&Segment>,
    older_files: &HashMap<u32, Segment>,
    pos: LogRecordPosition,
    reclaimable_bytes: &mut u64,
) -> Result<()> {
    let segment = segment_for_file_id(active_file, older_files, pos.file_id)?;
    let (_, consumed) = segment.read_record(pos.offset as u64)?;
    *reclaimable_bytes += consumed as u64;
    Ok(())
}
