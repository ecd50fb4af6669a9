//! IO backend abstraction: a standard file-based backend for the active,
//! writable segment, and a read-only memory-mapped backend for older
//! segments. Writes against the mmap backend fail with
//! `StorageError::ReadOnlyBackend` rather than panicking.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Mutex;

use memmap2::Mmap;

use crate::error::{Result, StorageError};

pub trait IoBackend: Send + Sync + std::fmt::Debug {
    /// Reads exactly `buf.len()` bytes starting at `offset`.
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<()>;
    fn write(&self, buf: &[u8]) -> Result<usize>;
    fn sync(&self) -> Result<()>;
    fn close(&self) -> Result<()>;
    fn size(&self) -> Result<u64>;
}

/// Standard create+read-write+append backend, used for the active segment
/// and for any segment before it has been promoted to a read-only mapping.
#[derive(Debug)]
pub struct FileIoBackend {
    file: Mutex<File>,
}

impl FileIoBackend {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .append(true)
            .open(path)?;
        Ok(Self { file: Mutex::new(file) })
    }
}

impl IoBackend for FileIoBackend {
    #[cfg(unix)]
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        use std::os::unix::fs::FileExt;
        let file = self.file.lock().expect("io mutex poisoned");
        file.read_exact_at(buf, offset)?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        use std::io::{Read, Seek, SeekFrom};
        let mut file = self.file.lock().expect("io mutex poisoned");
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        use std::io::Write;
        let mut file = self.file.lock().expect("io mutex poisoned");
        file.write_all(buf)?;
        Ok(buf.len())
    }

    fn sync(&self) -> Result<()> {
        self.file.lock().expect("io mutex poisoned").sync_all()?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.file.lock().expect("io mutex poisoned").metadata()?.len())
    }
}

#[derive(Debug)]
enum MmapSource {
    Mapped(Mmap),
    Empty,
}

/// Read-only memory-mapped backend for completed, immutable segments.
#[derive(Debug)]
pub struct MmapIoBackend {
    source: MmapSource,
    len: u64,
}

impl MmapIoBackend {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).read(true).open(path)?;
        let len = file.metadata()?.len();
        let source = if len == 0 {
            MmapSource::Empty
        } else {
            #[allow(unsafe_code)]
            // SAFETY: this maps a rotated, read-only data segment. The engine
            // never reopens a segment for writes through a standard backend
            // while one of its mmap'd read-only views is alive; segments are
            // promoted back to `FileIoBackend` (`Segment::promote_to_standard`)
            // only at startup, before any mapping of that file is created.
            let mmap = unsafe { Mmap::map(&file)? };
            MmapSource::Mapped(mmap)
        };
        Ok(Self { source, len })
    }
}

impl IoBackend for MmapIoBackend {
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let data: &[u8] = match &self.source {
            MmapSource::Mapped(mmap) => mmap,
            MmapSource::Empty => &[],
        };
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "mmap read past end of segment",
            )));
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write(&self, _buf: &[u8]) -> Result<usize> {
        Err(StorageError::ReadOnlyBackend)
    }

    fn sync(&self) -> Result<()> {
        Err(StorageError::ReadOnlyBackend)
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn file_backend_read_write_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("seg.data");
        let backend = FileIoBackend::open(&path).expect("open");
        backend.write(b"hello world").expect("write");
        backend.sync().expect("sync");

        let mut buf = [0u8; 5];
        backend.read(&mut buf, 6).expect("read");
        assert_eq!(&buf, b"world");
        assert_eq!(backend.size().expect("size"), 11);
    }

    #[test]
    fn mmap_backend_is_read_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("seg.data");
        {
            let mut file = File::create(&path).expect("create");
            file.write_all(b"immutable").expect("write");
        }
        let backend = MmapIoBackend::open(&path).expect("open");
        let mut buf = [0u8; 9];
        backend.read(&mut buf, 0).expect("read");
        assert_eq!(&buf, b"immutable");
        assert!(matches!(backend.write(b"x"), Err(StorageError::ReadOnlyBackend)));
        assert!(matches!(backend.sync(), Err(StorageError::ReadOnlyBackend)));
    }

    #[test]
    fn mmap_backend_handles_empty_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("empty.data");
        File::create(&path).expect("create");
        let backend = MmapIoBackend::open(&path).expect("open");
        assert_eq!(backend.size().expect("size"), 0);
    }
}
