//! Storage backend trait definition.

use crate::error::StorageResult;

/// An append-only byte store.
///
/// Log segments and checkpoint files are written through this trait. The
/// engine only ever appends; reads happen during recovery.
///
/// # Invariants
///
/// - `append` returns the offset the data landed at
/// - `read_at` returns exactly the bytes appended at that offset
/// - after `sync` returns, everything appended so far survives power loss
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ReadPastEnd`](crate::StorageError::ReadPastEnd)
    /// if the range is not fully inside the store, or an I/O error.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends `data` and returns the offset where it was written.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes buffered writes to the operating system.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Forces data and metadata to stable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Returns the current size in bytes, which is the next append offset.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;
}
