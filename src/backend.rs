use std::fs::{File, OpenOptions, TryLockError};
use std::io;
use std::path::Path;

#[cfg(unix)]
use std::os::unix::fs::FileExt;

#[cfg(windows)]
use std::os::windows::fs::FileExt;

/// Positional byte storage underneath the primary file and the write-ahead log.
pub trait StorageBackend: Send + Sync {
    /// Current length of the storage in bytes.
    fn len(&self) -> io::Result<u64>;

    /// Reads exactly `out.len()` bytes starting at `offset`.
    fn read(&self, offset: u64, out: &mut [u8]) -> io::Result<()>;

    /// Writes all of `data` starting at `offset`, extending the storage if needed.
    fn write(&self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Truncates or extends the storage to `len` bytes.
    fn set_len(&self, len: u64) -> io::Result<()>;

    /// Flushes written data to stable storage.
    fn sync_data(&self) -> io::Result<()>;

    /// Releases any locks held by this backend.
    fn close(&self) -> io::Result<()>;
}

/// A [`StorageBackend`] over a regular file.
///
/// The primary store file is opened with an exclusive lock so that a second
/// process cannot open the same store. The write-ahead log is opened unlocked:
/// its only writer is the process that holds the primary lock.
#[derive(Debug)]
pub struct FileBackend {
    file: File,
    locked: bool,
}

impl FileBackend {
    /// Opens (creating if absent) `path` and takes an exclusive lock on it.
    ///
    /// Fails with `WouldBlock` if another process already holds the lock.
    pub fn open_locked(path: &Path) -> io::Result<Self> {
        let file = open_rw(path)?;
        match file.try_lock() {
            Ok(()) => Ok(Self { file, locked: true }),
            Err(TryLockError::WouldBlock) => Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "store file is locked by another process",
            )),
            Err(TryLockError::Error(e)) => Err(e),
        }
    }

    /// Opens (creating if absent) `path` without taking a lock.
    pub fn open_unlocked(path: &Path) -> io::Result<Self> {
        Ok(Self {
            file: open_rw(path)?,
            locked: false,
        })
    }
}

fn open_rw(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

impl StorageBackend for FileBackend {
    fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    #[cfg(unix)]
    fn read(&self, offset: u64, out: &mut [u8]) -> io::Result<()> {
        self.file.read_exact_at(out, offset)
    }

    #[cfg(windows)]
    fn read(&self, mut offset: u64, out: &mut [u8]) -> io::Result<()> {
        let mut data_offset = 0;
        while data_offset < out.len() {
            let read = self.file.seek_read(&mut out[data_offset..], offset)?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ));
            }
            offset += read as u64;
            data_offset += read;
        }
        Ok(())
    }

    #[cfg(unix)]
    fn write(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.file.write_all_at(data, offset)
    }

    #[cfg(windows)]
    fn write(&self, mut offset: u64, data: &[u8]) -> io::Result<()> {
        let mut data_offset = 0;
        while data_offset < data.len() {
            let written = self.file.seek_write(&data[data_offset..], offset)?;
            offset += written as u64;
            data_offset += written;
        }
        Ok(())
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    fn sync_data(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    fn close(&self) -> io::Result<()> {
        if self.locked {
            self.file.unlock()?;
        }
        Ok(())
    }
}
