use parking_lot::{Mutex, MutexGuard};
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(not(unix))]
use std::io::{Read, Seek, SeekFrom, Write};

/// Random-access file shared by every segment of a splitfile. Reads and
/// writes are positional; `open_lock` hands out an exclusive guard that
/// callers hold across multi-step I/O sequences which must appear atomic
/// to other users of the file.
#[derive(Debug)]
pub struct LockableRandomAccessFile {
    path: PathBuf,
    file: std::fs::File,
    lock: Mutex<()>,
    #[cfg(not(unix))]
    cursor: Mutex<()>,
}

/// Scoped exclusive lock on the file handle. Dropping it releases the lock
/// on every exit path.
#[derive(Debug)]
pub struct RafLock<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl LockableRandomAccessFile {
    /// Open (or create) the backing file, growing it to at least `min_len`
    /// bytes so that every declared region reads as zeroes before its first
    /// write.
    pub fn open(path: impl Into<PathBuf>, min_len: u64) -> Result<Self, RafError> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(RafError::Open)?;
        let len = file.metadata().map_err(RafError::Open)?.len();
        if len < min_len {
            file.set_len(min_len).map_err(RafError::Open)?;
        }
        Ok(Self {
            path,
            file,
            lock: Mutex::new(()),
            #[cfg(not(unix))]
            cursor: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn open_lock(&self) -> RafLock<'_> {
        RafLock {
            _guard: self.lock.lock(),
        }
    }

    pub fn pread(&self, offset: u64, buf: &mut [u8]) -> Result<(), RafError> {
        #[cfg(unix)]
        {
            self.file.read_exact_at(buf, offset).map_err(RafError::Read)
        }
        #[cfg(not(unix))]
        {
            let _cursor = self.cursor.lock();
            let mut file = &self.file;
            file.seek(SeekFrom::Start(offset)).map_err(RafError::Read)?;
            file.read_exact(buf).map_err(RafError::Read)
        }
    }

    pub fn pwrite(&self, offset: u64, buf: &[u8]) -> Result<(), RafError> {
        #[cfg(unix)]
        {
            self.file.write_all_at(buf, offset).map_err(RafError::Write)
        }
        #[cfg(not(unix))]
        {
            let _cursor = self.cursor.lock();
            let mut file = &self.file;
            file.seek(SeekFrom::Start(offset)).map_err(RafError::Write)?;
            file.write_all(buf).map_err(RafError::Write)
        }
    }

    pub fn sync_data(&self) -> Result<(), RafError> {
        self.file.sync_data().map_err(RafError::Write)
    }
}

#[derive(Debug, Error)]
pub enum RafError {
    #[error("failed to open backing file: {0}")]
    Open(#[source] io::Error),
    #[error("disk read error: {0}")]
    Read(#[source] io::Error),
    #[error("disk write error: {0}")]
    Write(#[source] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn positional_write_then_read() {
        let dir = tempdir().unwrap();
        let raf = LockableRandomAccessFile::open(dir.path().join("blocks.bin"), 1024).unwrap();
        raf.pwrite(100, b"hello").unwrap();
        let mut buf = [0u8; 5];
        raf.pread(100, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn unwritten_region_reads_as_zeroes() {
        let dir = tempdir().unwrap();
        let raf = LockableRandomAccessFile::open(dir.path().join("blocks.bin"), 256).unwrap();
        let mut buf = [0xffu8; 16];
        raf.pread(200, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);
    }

    #[test]
    fn read_past_end_fails() {
        let dir = tempdir().unwrap();
        let raf = LockableRandomAccessFile::open(dir.path().join("blocks.bin"), 64).unwrap();
        let mut buf = [0u8; 16];
        let err = raf.pread(60, &mut buf).unwrap_err();
        assert!(matches!(err, RafError::Read(_)));
    }

    #[test]
    fn lock_is_scoped() {
        let dir = tempdir().unwrap();
        let raf = LockableRandomAccessFile::open(dir.path().join("blocks.bin"), 64).unwrap();
        {
            let _lock = raf.open_lock();
            raf.pwrite(0, b"a").unwrap();
        }
        let _relock = raf.open_lock();
    }
}
