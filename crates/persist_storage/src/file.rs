//! File-based storage backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A backend over a single OS file.
///
/// Appends go straight to the file with no user-space buffering, so a
/// process crash loses nothing that `append` returned for; only `sync`
/// protects against power loss.
///
/// ```no_run
/// use persist_storage::{FileBackend, StorageBackend};
/// use std::path::Path;
///
/// let mut segment = FileBackend::open(Path::new("log-0000000001.wal")).unwrap();
/// segment.append(b"record").unwrap();
/// segment.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    inner: Mutex<OpenFile>,
}

#[derive(Debug)]
struct OpenFile {
    file: File,
    len: u64,
}

impl OpenFile {
    fn write_at_end(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(data)
    }

    /// Takes the length from the file itself, after a write of unknown
    /// extent.
    fn resync_len(&mut self) {
        if let Ok(metadata) = self.file.metadata() {
            self.len = metadata.len();
        }
    }
}

impl FileBackend {
    /// Opens the file at `path`, creating it if missing.
    ///
    /// Existing contents are kept and new data is appended after them.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(OpenFile { file, len }),
        })
    }

    /// Returns the path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let mut inner = self.inner.lock();
        let size = inner.len;
        if offset.saturating_add(len as u64) > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        if len == 0 {
            return Ok(Vec::new());
        }

        inner.file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; len];
        inner.file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let mut inner = self.inner.lock();
        let offset = inner.len;
        if data.is_empty() {
            return Ok(offset);
        }

        if let Err(e) = inner.write_at_end(data) {
            // Part of `data` may have landed.
            inner.resync_len();
            return Err(e.into());
        }
        inner.len += data.len() as u64;
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.inner.lock().file.flush()?;
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.inner.lock().file.sync_all()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.inner.lock().len)
    }
}
