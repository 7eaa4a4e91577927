//! Crash and I/O fault helpers.
//!
//! [`FaultyFactory`] wraps the file factory with a switch that makes every
//! append and sync fail while it is on, the way a full or failing disk
//! would. [`append_torn_transaction`] writes the log of a transaction that
//! crashed before its end record.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use persist_testkit::crash::FaultyFactory;
//!
//! let factory = FaultyFactory::new();
//! let switch = factory.switch();
//! let engine = TestEngine::with_storage(fast_config(), Arc::new(factory));
//!
//! switch.fail();
//! assert!(engine.try_put("x", Some(Value::Integer(1))).is_err());
//! switch.heal();
//! ```

use persist_core::dir::InstanceDir;
use persist_core::wal::LogRecord;
use persist_core::{CoreResult, EntityKey, SequenceNumber, TransactionId};
use persist_storage::{
    FileFactory, StorageBackend, StorageError, StorageFactory, StorageResult,
};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared on/off switch for injected faults.
#[derive(Debug, Clone, Default)]
pub struct FaultSwitch {
    failing: Arc<AtomicBool>,
    injected: Arc<AtomicUsize>,
}

impl FaultSwitch {
    /// Starts failing writes.
    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    /// Stops failing writes.
    pub fn heal(&self) {
        self.failing.store(false, Ordering::SeqCst);
    }

    /// Whether writes currently fail.
    pub fn is_failing(&self) -> bool {
        self.failing.load(Ordering::SeqCst)
    }

    /// How many operations have been failed so far.
    pub fn injected(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }

    fn check(&self, op: &str) -> StorageResult<()> {
        if self.is_failing() {
            self.injected.fetch_add(1, Ordering::SeqCst);
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("injected {op} failure"),
            )));
        }
        Ok(())
    }
}

/// A backend whose appends and syncs fail while its switch is on.
pub struct FaultyBackend {
    inner: Box<dyn StorageBackend>,
    switch: FaultSwitch,
}

impl StorageBackend for FaultyBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        self.switch.check("append")?;
        self.inner.append(data)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.switch.check("flush")?;
        self.inner.flush()
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.switch.check("sync")?;
        self.inner.sync()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }
}

/// Opens files as [`FaultyBackend`]s sharing one switch.
///
/// Opening always succeeds, so a roll onto a fresh segment works even
/// while writes fail.
#[derive(Debug, Clone, Default)]
pub struct FaultyFactory {
    switch: FaultSwitch,
}

impl FaultyFactory {
    /// Creates a factory with faults off.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the switch controlling every backend this factory opens.
    pub fn switch(&self) -> FaultSwitch {
        self.switch.clone()
    }
}

impl StorageFactory for FaultyFactory {
    fn open(&self, path: &Path) -> StorageResult<Box<dyn StorageBackend>> {
        Ok(Box::new(FaultyBackend {
            inner: FileFactory.open(path)?,
            switch: self.switch.clone(),
        }))
    }
}

/// Appends, as a new log segment, the updates of a transaction that never
/// reached its end record.
///
/// The engine over `path` must be down. Returns the segment's sequence.
pub fn append_torn_transaction(
    path: &Path,
    txid: TransactionId,
    updates: &[(EntityKey, Option<Vec<u8>>)],
) -> CoreResult<u64> {
    let dir = InstanceDir::open(path, false)?;
    let seq = dir
        .log_sequences()?
        .last()
        .map_or(SequenceNumber::new(1), |s| s.next());

    let mut backend = FileFactory.open(&dir.log_path(seq))?;
    for (key, value) in updates {
        let record = LogRecord::Update {
            txid,
            key: key.clone(),
            value: value.clone(),
        };
        backend.append(&record.encode()?)?;
    }
    backend.sync()?;
    Ok(seq.as_u64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn switch_fails_appends_and_syncs() {
        let dir = tempdir().unwrap();
        let factory = FaultyFactory::new();
        let switch = factory.switch();
        let mut backend = factory.open(&dir.path().join("f")).unwrap();

        backend.append(b"ok").unwrap();
        switch.fail();
        assert!(backend.append(b"no").is_err());
        assert!(backend.sync().is_err());
        assert_eq!(switch.injected(), 2);
        assert_eq!(backend.size().unwrap(), 2);

        switch.heal();
        backend.append(b"ok").unwrap();
        backend.sync().unwrap();
        assert_eq!(backend.read_at(0, 4).unwrap(), b"okok");
    }

    #[test]
    fn open_succeeds_while_failing() {
        let dir = tempdir().unwrap();
        let factory = FaultyFactory::new();
        factory.switch().fail();
        assert!(factory.open(&dir.path().join("f")).is_ok());
    }
}
