//! Instance directory layout and locking.
//!
//! ```text
//! <instance>/
//! ├─ LOCK                  # advisory lock, one engine per directory
//! ├─ LIBRARY               # consolidated snapshot, present after clean shutdown
//! ├─ log-0000000001.wal    # log segments, ascending
//! └─ ckp-0000000001.dat    # checkpoint files, ascending
//! ```

use crate::error::{CoreError, CoreResult};
use crate::types::SequenceNumber;
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const SNAPSHOT_FILE: &str = "LIBRARY";
const SNAPSHOT_TEMP: &str = "LIBRARY.tmp";
const LOG_PREFIX: &str = "log-";
const LOG_SUFFIX: &str = ".wal";
const CHECKPOINT_PREFIX: &str = "ckp-";
const CHECKPOINT_SUFFIX: &str = ".dat";

/// An instance directory, held under an exclusive advisory lock.
///
/// Only one `InstanceDir` can exist per directory at a time, across
/// processes as well as within one. The lock is released on drop or by
/// [`release`](Self::release).
#[derive(Debug)]
pub struct InstanceDir {
    path: PathBuf,
    lock_file: Mutex<Option<File>>,
}

impl InstanceDir {
    /// Opens (and optionally creates) an instance directory and locks it.
    ///
    /// # Errors
    ///
    /// - [`CoreError::AlreadyRunning`] if another engine holds the lock
    /// - [`CoreError::StorageIoFailure`] if the directory is missing and
    ///   `create_if_missing` is false, or the path is not a directory
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::storage_failure(format!(
                    "instance directory does not exist: {}",
                    path.display()
                )));
            }
        }
        if !path.is_dir() {
            return Err(CoreError::storage_failure(format!(
                "not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::AlreadyRunning);
        }

        Ok(Self {
            path: path.to_path_buf(),
            lock_file: Mutex::new(Some(lock_file)),
        })
    }

    /// Releases the advisory lock. Components still holding this directory
    /// must no longer write to it.
    pub fn release(&self) {
        if let Some(file) = self.lock_file.lock().take() {
            // Closing the descriptor drops the lock even if unlock fails.
            let _ = file.unlock();
        }
    }

    /// Whether the lock is still held.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.lock_file.lock().is_some()
    }

    /// Returns the directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the snapshot file path.
    #[must_use]
    pub fn snapshot_path(&self) -> PathBuf {
        self.path.join(SNAPSHOT_FILE)
    }

    /// Returns the path of log segment `seq`.
    #[must_use]
    pub fn log_path(&self, seq: SequenceNumber) -> PathBuf {
        self.path
            .join(format!("{LOG_PREFIX}{:010}{LOG_SUFFIX}", seq.as_u64()))
    }

    /// Returns the path of checkpoint file `seq`.
    #[must_use]
    pub fn checkpoint_path(&self, seq: SequenceNumber) -> PathBuf {
        self.path
            .join(format!("{CHECKPOINT_PREFIX}{:010}{CHECKPOINT_SUFFIX}", seq.as_u64()))
    }

    /// Lists log segment sequences, ascending.
    pub fn log_sequences(&self) -> CoreResult<Vec<SequenceNumber>> {
        self.numbered_files(LOG_PREFIX, LOG_SUFFIX)
    }

    /// Lists checkpoint file sequences, ascending.
    pub fn checkpoint_sequences(&self) -> CoreResult<Vec<SequenceNumber>> {
        self.numbered_files(CHECKPOINT_PREFIX, CHECKPOINT_SUFFIX)
    }

    /// Deletes log segment `seq`. Returns whether a file was removed.
    pub fn delete_log_segment(&self, seq: SequenceNumber) -> CoreResult<bool> {
        let removed = remove_if_present(&self.log_path(seq))?;
        if removed {
            self.sync_directory()?;
        }
        Ok(removed)
    }

    /// Deletes every log segment. Returns how many were removed.
    pub fn delete_all_logs(&self) -> CoreResult<usize> {
        let seqs = self.log_sequences()?;
        self.delete_all(seqs.into_iter().map(|s| self.log_path(s)))
    }

    /// Deletes every checkpoint file. Returns how many were removed.
    pub fn delete_all_checkpoints(&self) -> CoreResult<usize> {
        let seqs = self.checkpoint_sequences()?;
        self.delete_all(seqs.into_iter().map(|s| self.checkpoint_path(s)))
    }

    /// Deletes the snapshot. Returns whether one existed.
    pub fn delete_snapshot(&self) -> CoreResult<bool> {
        let removed = remove_if_present(&self.snapshot_path())?;
        if removed {
            self.sync_directory()?;
        }
        Ok(removed)
    }

    /// Reads the snapshot, or `None` if there is none.
    pub fn load_snapshot(&self) -> CoreResult<Option<Vec<u8>>> {
        let mut file = match File::open(self.snapshot_path()) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Ok(Some(data))
    }

    /// Replaces the snapshot atomically.
    ///
    /// The bytes go to a temporary file which is synced, renamed over the
    /// snapshot, and then the directory is synced. A crash at any point
    /// leaves either the old snapshot or the new one.
    pub fn save_snapshot(&self, data: &[u8]) -> CoreResult<()> {
        let temp_path = self.path.join(SNAPSHOT_TEMP);
        let mut file = File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, self.snapshot_path())?;
        self.sync_directory()
    }

    fn numbered_files(&self, prefix: &str, suffix: &str) -> CoreResult<Vec<SequenceNumber>> {
        let mut seqs = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            let number = name
                .strip_prefix(prefix)
                .and_then(|rest| rest.strip_suffix(suffix))
                .and_then(|digits| digits.parse::<u64>().ok());
            if let Some(n) = number {
                seqs.push(SequenceNumber::new(n));
            }
        }
        seqs.sort_unstable();
        Ok(seqs)
    }

    fn delete_all(&self, paths: impl Iterator<Item = PathBuf>) -> CoreResult<usize> {
        let mut removed = 0;
        for path in paths {
            if remove_if_present(&path)? {
                removed += 1;
            }
        }
        if removed > 0 {
            self.sync_directory()?;
        }
        Ok(removed)
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> CoreResult<()> {
        File::open(&self.path)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> CoreResult<()> {
        // NTFS journals metadata; directory handles cannot be fsynced
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> CoreResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
