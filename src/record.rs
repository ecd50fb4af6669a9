//! On-disk record codec and the encoded-key scheme.
//!
//! Wire format:
//!
//! ```text
//! +----------+------+-----------+-----------+----------+------------+
//! | crc32(4) | t(1) | kSz(var)  | vSz(var)  |   key    |   value    |
//! +----------+------+-----------+-----------+----------+------------+
//! ```
//!
//! `crc32` covers every byte from `t` onward. `kSz`/`vSz` are signed varints
//! (see `varint.rs`); the header is at most 15 bytes (4 + 1 + 5 + 5).

use bytes::Bytes;

use crate::constants::NON_TRANSACTION_SEQ_NO;
use crate::error::StorageError;
use crate::varint::{decode_svarint, decode_uvarint, encode_svarint, encode_uvarint};

/// `4 (crc) + 1 (type) + 5 (kSz) + 5 (vSz)`.
pub const MAX_RECORD_HEADER_SIZE: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Normal = 0,
    Deleted = 1,
    TxnFinish = 2,
}

impl RecordType {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Normal),
            1 => Some(Self::Deleted),
            2 => Some(Self::TxnFinish),
            _ => None,
        }
    }

    fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Where a record lives: which segment file, and the byte offset of its
/// header within that file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRecordPosition {
    pub file_id: u32,
    pub offset: i64,
}

#[derive(Debug, Clone)]
pub struct LogRecord {
    pub record_type: RecordType,
    pub key: Bytes,
    pub value: Bytes,
}

pub(crate) struct Header {
    pub(crate) crc: u32,
    pub(crate) record_type: RecordType,
    pub(crate) key_size: usize,
    pub(crate) value_size: usize,
}

impl LogRecord {
    /// Encodes this record, returning the full wire bytes and their length.
    pub fn encode(&self) -> (Vec<u8>, usize) {
        let mut tail = Vec::with_capacity(1 + 10 + 10 + self.key.len() + self.value.len());
        tail.push(self.record_type.as_byte());
        encode_svarint(self.key.len() as i64, &mut tail);
        encode_svarint(self.value.len() as i64, &mut tail);
        tail.extend_from_slice(&self.key);
        tail.extend_from_slice(&self.value);

        let crc = crc32fast::hash(&tail);
        let mut buf = Vec::with_capacity(4 + tail.len());
        buf.extend_from_slice(&crc.to_le_bytes());
        buf.extend_from_slice(&tail);
        let len = buf.len();
        (buf, len)
    }
}

/// Parses a record header out of `buf`. Returns `None` if `buf` is too short
/// to hold a header, or if its leading bytes are all zero — the sentinel for
/// "nothing further was ever written here" rather than a corrupt record.
pub(crate) fn decode_header(buf: &[u8]) -> Option<(Header, usize)> {
    if buf.len() <= 4 {
        return None;
    }

    let probe_len = buf.len().min(7);
    if buf[..probe_len].iter().all(|&b| b == 0) {
        return None;
    }

    let crc = u32::from_le_bytes(buf[0..4].try_into().ok()?);
    let record_type = RecordType::from_byte(buf[4])?;
    let (key_size, k_len) = decode_svarint(&buf[5..])?;
    let (value_size, v_len) = decode_svarint(buf.get(5 + k_len..)?)?;
    let header_len = 5 + k_len + v_len;

    Some((
        Header {
            crc,
            record_type,
            key_size: key_size as usize,
            value_size: value_size as usize,
        },
        header_len,
    ))
}

/// Prefixes `user_key` with an unsigned varint sequence number. `seq == 0`
/// marks a non-transactional write.
pub(crate) fn encode_key(user_key: &[u8], seq: u64) -> Bytes {
    let mut buf = Vec::with_capacity(10 + user_key.len());
    encode_uvarint(seq, &mut buf);
    buf.extend_from_slice(user_key);
    Bytes::from(buf)
}

/// Splits an encoded key back into its user-visible key and sequence number.
pub(crate) fn parse_key(encoded: &[u8]) -> (Vec<u8>, u64) {
    match decode_uvarint(encoded) {
        Some((seq, len)) => (encoded[len..].to_vec(), seq),
        None => (encoded.to_vec(), NON_TRANSACTION_SEQ_NO),
    }
}

/// Encodes a `LogRecordPosition` the way hint-file values and the persistent
/// index's on-disk log store it: `file_id: u32 (LE) || offset: varint_i64`.
pub(crate) fn encode_position(pos: &LogRecordPosition) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + 10);
    buf.extend_from_slice(&pos.file_id.to_le_bytes());
    encode_svarint(pos.offset, &mut buf);
    buf
}

pub(crate) fn decode_position(buf: &[u8]) -> Result<LogRecordPosition, StorageError> {
    if buf.len() < 5 {
        return Err(StorageError::DirCorrupted);
    }
    let file_id = u32::from_le_bytes(buf[0..4].try_into().expect("checked length above"));
    let (offset, _) = decode_svarint(&buf[4..]).ok_or(StorageError::DirCorrupted)?;
    Ok(LogRecordPosition { file_id, offset })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let record = LogRecord {
            record_type: RecordType::Normal,
            key: Bytes::from_static(b"hello"),
            value: Bytes::from_static(b"world"),
        };
        let (bytes, len) = record.encode();
        assert_eq!(bytes.len(), len);

        let (header, header_len) = decode_header(&bytes).expect("valid header");
        assert_eq!(header.key_size, 5);
        assert_eq!(header.value_size, 5);
        assert_eq!(header.record_type, RecordType::Normal);
        assert_eq!(&bytes[header_len..header_len + 5], b"hello");
        assert_eq!(&bytes[header_len + 5..], b"world");

        let crc_input = &bytes[4..];
        assert_eq!(crc32fast::hash(crc_input), header.crc);
    }

    #[test]
    fn zero_prefix_is_treated_as_end_of_stream() {
        let zeros = [0u8; 7];
        assert!(decode_header(&zeros).is_none());
    }

    #[test]
    fn empty_value_roundtrips() {
        let record = LogRecord {
            record_type: RecordType::Deleted,
            key: Bytes::from_static(b"k"),
            value: Bytes::new(),
        };
        let (bytes, _) = record.encode();
        let (header, header_len) = decode_header(&bytes).expect("valid header");
        assert_eq!(header.value_size, 0);
        assert_eq!(&bytes[header_len..], b"k");
    }

    #[test]
    fn key_with_sequence_roundtrips() {
        let encoded = encode_key(b"foo", 42);
        let (key, seq) = parse_key(&encoded);
        assert_eq!(key, b"foo");
        assert_eq!(seq, 42);
    }

    #[test]
    fn key_without_sequence_is_non_transactional() {
        let encoded = encode_key(b"bar", NON_TRANSACTION_SEQ_NO);
        let (key, seq) = parse_key(&encoded);
        assert_eq!(key, b"bar");
        assert_eq!(seq, NON_TRANSACTION_SEQ_NO);
    }

    #[test]
    fn position_roundtrips() {
        let pos = LogRecordPosition { file_id: 7, offset: 12345 };
        let encoded = encode_position(&pos);
        let decoded = decode_position(&encoded).expect("valid position");
        assert_eq!(decoded, pos);
    }
}
