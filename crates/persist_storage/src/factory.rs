//! Opening backends by path.

use crate::backend::StorageBackend;
use crate::error::StorageResult;
use crate::file::FileBackend;
use std::path::Path;

/// Opens a storage backend for a file path.
///
/// The engine never constructs backends directly; every log segment and
/// checkpoint file goes through a factory. Wrapping the default factory is
/// how tests inject write failures.
pub trait StorageFactory: Send + Sync {
    /// Opens (creating if needed) the backend stored at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be opened.
    fn open(&self, path: &Path) -> StorageResult<Box<dyn StorageBackend>>;
}

/// The default factory, producing [`FileBackend`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileFactory;

impl StorageFactory for FileFactory {
    fn open(&self, path: &Path) -> StorageResult<Box<dyn StorageBackend>> {
        Ok(Box::new(FileBackend::open(path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_factory_opens_persistent_backends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ckp-0000000001.dat");

        let mut backend = FileFactory.open(&path).unwrap();
        backend.append(b"checkpoint").unwrap();
        backend.sync().unwrap();
        drop(backend);

        let reopened = FileFactory.open(&path).unwrap();
        assert_eq!(reopened.size().unwrap(), 10);
    }
}
