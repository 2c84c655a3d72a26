//! On-disk log backend.

use crate::backend::StorageBackend;
use crate::error::{StoreError, StoreResult};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Open handle plus the length we have written through it.
#[derive(Debug)]
struct LogFile {
    handle: File,
    len: u64,
}

/// One append-only log file.
///
/// Every operation goes through a single lock, so a read never observes
/// a half-finished append. `sync` is the only call that waits for the disk.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    inner: Mutex<LogFile>,
}

impl FileBackend {
    /// Opens the log at `path`, creating an empty one when it is absent.
    ///
    /// Existing contents are kept; replay decides what survives.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be opened for reading and writing.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let handle = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        let len = handle.metadata()?.len();

        Ok(Self {
            path: path.to_owned(),
            inner: Mutex::new(LogFile { handle, len }),
        })
    }

    /// Location of the log on disk.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StoreResult<Vec<u8>> {
        let mut log = self.inner.lock();
        let within = offset
            .checked_add(len as u64)
            .is_some_and(|end| end <= log.len);
        if !within {
            return Err(StoreError::ReadPastEnd {
                offset,
                len,
                size: log.len,
            });
        }

        let mut out = vec![0u8; len];
        if len > 0 {
            log.handle.seek(SeekFrom::Start(offset))?;
            log.handle.read_exact(&mut out)?;
        }
        Ok(out)
    }

    fn append(&mut self, data: &[u8]) -> StoreResult<u64> {
        let log = self.inner.get_mut();
        let start = log.len;
        if !data.is_empty() {
            log.handle.seek(SeekFrom::Start(start))?;
            log.handle.write_all(data)?;
            log.len = start + data.len() as u64;
        }
        Ok(start)
    }

    fn flush(&mut self) -> StoreResult<()> {
        self.inner.get_mut().handle.flush().map_err(StoreError::from)
    }

    fn sync(&mut self) -> StoreResult<()> {
        self.inner.get_mut().handle.sync_all().map_err(StoreError::from)
    }

    fn size(&self) -> StoreResult<u64> {
        Ok(self.inner.lock().len)
    }

    fn truncate(&mut self, new_size: u64) -> StoreResult<()> {
        let log = self.inner.get_mut();
        if new_size > log.len {
            let msg = format!("log is {} bytes, cannot grow it to {new_size}", log.len);
            return Err(io::Error::new(io::ErrorKind::InvalidInput, msg).into());
        }
        log.handle.set_len(new_size)?;
        log.handle.sync_all()?;
        log.len = new_size;
        Ok(())
    }
}
