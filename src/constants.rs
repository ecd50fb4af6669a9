//! Fixed on-disk file names and suffixes.

pub(crate) const DATA_FILE_SUFFIX: &str = ".data";
pub(crate) const HINT_FILE_NAME: &str = "hint-index";
pub(crate) const MERGE_FINISHED_FILE_NAME: &str = "merge-finished";
pub(crate) const SEQ_NO_FILE_NAME: &str = "seq-no";
pub(crate) const LOCK_FILE_NAME: &str = "flock";
pub(crate) const MERGE_DIR_SUFFIX: &str = "-merge";
pub(crate) const BPTREE_INDEX_FILE_NAME: &str = "bptree-index";

/// Sentinel sequence number marking a non-transactional write.
pub(crate) const NON_TRANSACTION_SEQ_NO: u64 = 0;

/// Key used for the `TxnFinish` marker record of a committed batch.
pub(crate) const TXN_FINISHED_KEY: &[u8] = b"txn-fin";
