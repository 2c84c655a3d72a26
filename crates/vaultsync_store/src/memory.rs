//! Volatile log backend.

use crate::backend::StorageBackend;
use crate::error::{StoreError, StoreResult};
use parking_lot::RwLock;
use std::io;
use std::sync::Arc;

/// A log held in a shared byte buffer.
///
/// Backs `ChangeStore::in_memory` and most store tests. Cloning hands out
/// another view of the same buffer, so a test can drop a store mid-write
/// and replay a fresh one over the bytes it left behind.
///
/// # Example
///
/// ```rust
/// use vaultsync_store::{InMemoryBackend, StorageBackend};
///
/// let mut log = InMemoryBackend::new();
/// assert_eq!(log.append(b"frame").unwrap(), 0);
/// assert_eq!(log.bytes(), b"frame");
/// ```
#[derive(Debug, Default, Clone)]
pub struct InMemoryBackend {
    buf: Arc<RwLock<Vec<u8>>>,
}

impl InMemoryBackend {
    /// An empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything appended so far.
    #[must_use]
    pub fn bytes(&self) -> Vec<u8> {
        self.buf.read().clone()
    }

    /// Flips every bit of the byte at `offset`. Out-of-range offsets are ignored.
    pub fn corrupt_byte(&self, offset: usize) {
        if let Some(b) = self.buf.write().get_mut(offset) {
            *b = !*b;
        }
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StoreResult<Vec<u8>> {
        let buf = self.buf.read();
        let range = usize::try_from(offset)
            .ok()
            .and_then(|start| Some(start..start.checked_add(len)?))
            .filter(|r| r.end <= buf.len());
        match range {
            Some(r) => Ok(buf[r].to_vec()),
            None => Err(StoreError::ReadPastEnd {
                offset,
                len,
                size: buf.len() as u64,
            }),
        }
    }

    fn append(&mut self, data: &[u8]) -> StoreResult<u64> {
        let mut buf = self.buf.write();
        let start = buf.len() as u64;
        buf.extend_from_slice(data);
        Ok(start)
    }

    fn flush(&mut self) -> StoreResult<()> {
        Ok(())
    }

    fn sync(&mut self) -> StoreResult<()> {
        Ok(())
    }

    fn size(&self) -> StoreResult<u64> {
        Ok(self.buf.read().len() as u64)
    }

    fn truncate(&mut self, new_size: u64) -> StoreResult<()> {
        let mut buf = self.buf.write();
        match usize::try_from(new_size) {
            Ok(n) if n <= buf.len() => {
                buf.truncate(n);
                Ok(())
            }
            _ => {
                let msg = format!("log is {} bytes, cannot grow it to {new_size}", buf.len());
                Err(io::Error::new(io::ErrorKind::InvalidInput, msg).into())
            }
        }
    }
}
