//! Engine error type: one variant per distinct failure kind, plus a
//! transparent `Io` variant for anything that bubbles up from the
//! filesystem.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("the key is empty")]
    EmptyKey,

    #[error("key not found")]
    KeyNotFound,

    #[error("failed to update the index")]
    IndexUpdateFailed,

    #[error("data file not found: {0}")]
    DataFileNotFound(u32),

    #[error("corrupt record: crc mismatch")]
    CorruptRecord,

    #[error("data directory is corrupted")]
    DirCorrupted,

    #[error("data directory path must not be empty")]
    EmptyDirPath,

    #[error("data file size must be greater than zero")]
    InvalidFileSize,

    #[error("merge ratio must be within [0, 1]")]
    InvalidMergeRatio,

    #[error("batch exceeds the configured maximum number of entries")]
    BatchTooLarge,

    #[error("a merge is already in progress")]
    MergeInProgress,

    #[error("reclaimable ratio does not meet the configured threshold")]
    MergeRatioUnreached,

    #[error("not enough free disk space to run a merge")]
    NotEnoughSpaceForMerge,

    #[error("the data directory is already in use by another instance")]
    InUse,

    #[error("this io backend does not support the requested operation")]
    ReadOnlyBackend,

    #[error("reached the end of the segment")]
    EndOfSegment,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;
