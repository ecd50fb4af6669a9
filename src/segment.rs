//! Append-only segment files, named `%09d.data`.

use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::constants::DATA_FILE_SUFFIX;
use crate::error::{Result, StorageError};
use crate::io::{FileIoBackend, IoBackend, MmapIoBackend};
use crate::record::{decode_header, LogRecord, MAX_RECORD_HEADER_SIZE};

pub(crate) fn segment_path(dir: &Path, file_id: u32) -> PathBuf {
    dir.join(format!("{file_id:09}{DATA_FILE_SUFFIX}"))
}

/// A single segment file: either the active, appendable segment, or one of
/// the older, read-only segments.
#[derive(Debug)]
pub struct Segment {
    pub file_id: u32,
    io: Box<dyn IoBackend>,
    write_off: u64,
}

impl Segment {
    pub(crate) fn open(path: PathBuf, file_id: u32) -> Result<Self> {
        let io = FileIoBackend::open(&path)?;
        let write_off = io.size()?;
        Ok(Self { file_id, io: Box::new(io), write_off })
    }

    pub(crate) fn open_mmap(path: PathBuf, file_id: u32) -> Result<Self> {
        let io = MmapIoBackend::open(&path)?;
        let write_off = io.size()?;
        Ok(Self { file_id, io: Box::new(io), write_off })
    }

    pub(crate) fn open_data_file(dir: &Path, file_id: u32) -> Result<Self> {
        Self::open(segment_path(dir, file_id), file_id)
    }

    pub(crate) fn open_data_file_mmap(dir: &Path, file_id: u32) -> Result<Self> {
        Self::open_mmap(segment_path(dir, file_id), file_id)
    }

    /// Swaps this segment's backend from a read-only mmap to the standard
    /// file backend, used when a previously mmap'd segment must be written
    /// to again: only the active segment is ever promoted this way, and only
    /// once, right after load.
    pub(crate) fn promote_to_standard(&mut self, dir: &Path) -> Result<()> {
        let io = FileIoBackend::open(&segment_path(dir, self.file_id))?;
        self.write_off = io.size()?;
        self.io = Box::new(io);
        Ok(())
    }

    pub fn write_off(&self) -> u64 {
        self.write_off
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<u64> {
        let offset = self.write_off;
        self.io.write(buf)?;
        self.write_off += buf.len() as u64;
        Ok(offset)
    }

    pub fn sync(&self) -> Result<()> {
        self.io.sync()
    }

    pub fn close(&self) -> Result<()> {
        self.io.close()
    }

    pub fn size(&self) -> Result<u64> {
        self.io.size()
    }

    /// Reads and decodes the record whose header starts at `offset`, via two
    /// reads through the `IoBackend`: first the (possibly truncated-near-EOF)
    /// header span, then the `kSz + vSz` payload. Returns the record and the
    /// number of bytes it occupied on disk.
    pub fn read_record(&self, offset: u64) -> Result<(LogRecord, usize)> {
        let file_size = self.io.size()?;
        if offset >= file_size {
            return Err(StorageError::EndOfSegment);
        }

        let header_span = (MAX_RECORD_HEADER_SIZE as u64).min(file_size - offset) as usize;
        let mut header_buf = vec![0u8; header_span];
        self.io.read(&mut header_buf, offset)?;
        let (header, header_len) = decode_header(&header_buf).ok_or(StorageError::EndOfSegment)?;

        let payload_len = header.key_size + header.value_size;
        let mut payload = vec![0u8; payload_len];
        if payload_len > 0 {
            self.io.read(&mut payload, offset + header_len as u64)?;
        }

        let mut crc_input = Vec::with_capacity(header_len - 4 + payload_len);
        crc_input.extend_from_slice(&header_buf[4..header_len]);
        crc_input.extend_from_slice(&payload);
        if crc32fast::hash(&crc_input) != header.crc {
            return Err(StorageError::CorruptRecord);
        }

        let key = Bytes::copy_from_slice(&payload[..header.key_size]);
        let value = Bytes::copy_from_slice(&payload[header.key_size..]);
        let consumed = header_len + payload_len;
        Ok((
            LogRecord {
                record_type: header.record_type,
                key,
                value,
            },
            consumed,
        ))
    }
}
