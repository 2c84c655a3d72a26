//! Byte-level abstraction under the change and metadata logs.

use crate::error::StoreResult;

/// Raw append-only bytes for one log.
///
/// Framing, checksums and record decoding all live above this trait; a
/// backend only hands back what it was given. An offset returned by
/// `append` stays readable with the same bytes until `truncate` cuts
/// below it, and nothing appended is guaranteed to outlive a crash
/// until `sync` has returned.
pub trait StorageBackend: Send + Sync {
    /// Copies out `len` bytes beginning at `offset`.
    ///
    /// # Errors
    ///
    /// `ReadPastEnd` when the range is not fully inside the log, or any
    /// I/O failure.
    fn read_at(&self, offset: u64, len: usize) -> StoreResult<Vec<u8>>;

    /// Adds `data` at the tail and returns the offset it starts at.
    ///
    /// # Errors
    ///
    /// Propagates write failures.
    fn append(&mut self, data: &[u8]) -> StoreResult<u64>;

    /// Hands buffered bytes to the OS without waiting for the disk.
    ///
    /// # Errors
    ///
    /// Propagates flush failures.
    fn flush(&mut self) -> StoreResult<()>;

    /// Blocks until appended bytes are durable.
    ///
    /// # Errors
    ///
    /// Propagates fsync failures.
    fn sync(&mut self) -> StoreResult<()>;

    /// Current length of the log in bytes.
    ///
    /// # Errors
    ///
    /// Backends that must ask the OS may fail here.
    fn size(&self) -> StoreResult<u64>;

    /// Drops everything from `new_size` onward. Replay uses this to remove
    /// a torn final frame.
    ///
    /// # Errors
    ///
    /// Rejects a `new_size` past the current end, and propagates I/O
    /// failures.
    fn truncate(&mut self, new_size: u64) -> StoreResult<()>;
}
