//! The engine facade.

use crate::checkpoint::{replay_checkpoints, Batch, CheckpointWriter, Compactor};
use crate::config::Config;
use crate::dir::InstanceDir;
use crate::entity::{Strategies, Strategy};
use crate::error::{CoreError, CoreResult};
use crate::session::Session;
use crate::store::Library;
use crate::transaction::TransactionManager;
use crate::types::{SequenceNumber, TypeName};
use crate::wal::{recover, TransactionLog};
use parking_lot::{Mutex, RwLock};
use persist_storage::{FileFactory, StorageFactory};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

struct EngineInner {
    path: PathBuf,
    config: Config,
    factory: Arc<dyn StorageFactory>,
    strategies: Strategies,
    sync_frequency: Arc<AtomicUsize>,
    next_txid: Arc<AtomicU64>,
    manager: RwLock<Option<Arc<TransactionManager>>>,
    /// Serializes starts and stops.
    lifecycle: Mutex<()>,
}

/// An embedded transactional object store over one instance directory.
///
/// The engine starts down. [`cold_start`](Self::cold_start) begins from
/// an empty store, [`warm_start`](Self::warm_start) recovers the previous
/// state. Clones share the same engine.
///
/// # Example
///
/// ```rust,ignore
/// use persist_core::{Config, Engine, Value};
///
/// let engine = Engine::new("data", Config::default());
/// engine.warm_start()?;
///
/// let mut session = engine.open_session()?;
/// session.write("x", Value::INTEGER, Some(Value::Integer(1)))?;
/// session.commit()?;
///
/// engine.shut_down()?;
/// ```
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Creates an engine over `path` using files on disk.
    pub fn new(path: impl AsRef<Path>, config: Config) -> Self {
        Self::with_storage(path, config, Arc::new(FileFactory))
    }

    /// Creates an engine that opens log segments and checkpoint files
    /// through `factory`.
    pub fn with_storage(
        path: impl AsRef<Path>,
        config: Config,
        factory: Arc<dyn StorageFactory>,
    ) -> Self {
        let sync_frequency = Arc::new(AtomicUsize::new(config.sync_frequency.max(1)));
        Self {
            inner: Arc::new(EngineInner {
                path: path.as_ref().to_path_buf(),
                config,
                factory,
                strategies: Strategies::default(),
                sync_frequency,
                next_txid: Arc::new(AtomicU64::new(1)),
                manager: RwLock::new(None),
                lifecycle: Mutex::new(()),
            }),
        }
    }

    /// Returns the instance directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Whether transactions are accepted.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner
            .manager
            .read()
            .as_ref()
            .map_or(false, |m| m.is_running())
    }

    /// The running transaction manager.
    ///
    /// # Errors
    ///
    /// [`CoreError::EngineDown`] if the engine is not running.
    pub fn manager(&self) -> CoreResult<Arc<TransactionManager>> {
        self.inner
            .manager
            .read()
            .as_ref()
            .filter(|m| m.is_running())
            .cloned()
            .ok_or(CoreError::EngineDown)
    }

    /// Starts from an empty store, discarding the snapshot, checkpoints
    /// and log. Does nothing if already running.
    ///
    /// # Errors
    ///
    /// [`CoreError::AlreadyRunning`] if another engine holds the
    /// directory, or an I/O error.
    pub fn cold_start(&self) -> CoreResult<()> {
        let _lifecycle = self.inner.lifecycle.lock();
        if self.is_running() {
            return Ok(());
        }

        let dir = Arc::new(InstanceDir::open(&self.inner.path, self.inner.config.create_if_missing)?);
        dir.delete_snapshot()?;
        dir.delete_all_checkpoints()?;
        dir.delete_all_logs()?;

        let library = Arc::new(Library::new(self.inner.strategies.clone()));
        self.inner.launch(
            dir,
            library,
            Vec::new(),
            SequenceNumber::new(1),
            SequenceNumber::new(1),
        )?;
        info!(path = %self.inner.path.display(), "engine cold started");
        Ok(())
    }

    /// Recovers the previous state: snapshot, then checkpoint files, then
    /// the log. Does nothing if already running.
    ///
    /// # Errors
    ///
    /// [`CoreError::AlreadyRunning`] if another engine holds the
    /// directory; a corruption error if any persisted file is damaged, in
    /// which case nothing is started.
    pub fn warm_start(&self) -> CoreResult<()> {
        let _lifecycle = self.inner.lifecycle.lock();
        if self.is_running() {
            return Ok(());
        }

        let inner = &self.inner;
        let dir = Arc::new(InstanceDir::open(&inner.path, inner.config.create_if_missing)?);
        let library = match dir.load_snapshot()? {
            Some(data) => Library::from_snapshot(&data, inner.strategies.clone())?,
            None => Library::new(inner.strategies.clone()),
        };
        let restored = library.len();

        let next_checkpoint = replay_checkpoints(&dir, inner.factory.as_ref(), |record| {
            library.apply_recovered(&record.key, record.value.as_deref());
            Ok(())
        })?;
        let summary = recover(&dir, inner.factory.as_ref(), |key, value| {
            library.apply_recovered(key, value);
            Ok(())
        })?;

        if let Some(max) = summary.max_txid {
            inner.next_txid.fetch_max(max.as_u64() + 1, Ordering::SeqCst);
        }
        let next_log = summary.high.map_or(SequenceNumber::new(1), SequenceNumber::next);

        let library = Arc::new(library);
        let entities = library.len();
        inner.launch(dir, library, summary.batches, next_log, next_checkpoint)?;
        info!(
            path = %inner.path.display(),
            restored,
            entities,
            applied = summary.applied,
            discarded = summary.discarded,
            "engine warm started"
        );
        Ok(())
    }

    /// Stops the engine and consolidates its state into the snapshot.
    ///
    /// Log segments and checkpoint files are deleted only once the
    /// snapshot is on disk. The engine is down afterwards even if this
    /// fails.
    ///
    /// # Errors
    ///
    /// Returns the error that prevented writing the snapshot or cleaning
    /// up; the log is left in place for the next warm start.
    pub fn shut_down(&self) -> CoreResult<()> {
        self.inner.shut_down()
    }

    /// Stops without a snapshot and without syncing, leaving the disk as a
    /// crash would.
    pub fn halt(&self) {
        let _lifecycle = self.inner.lifecycle.lock();
        if let Some(manager) = self.inner.manager.write().take() {
            manager.halt();
            manager.dir().release();
            info!(path = %self.inner.path.display(), "engine halted");
        }
    }

    /// Sets the durability barrier: the log is synced every `commits`
    /// commits. Zero is treated as one.
    pub fn set_durability_barrier_frequency(&self, commits: usize) {
        self.inner
            .sync_frequency
            .store(commits.max(1), Ordering::Release);
    }

    /// The current durability barrier frequency.
    #[must_use]
    pub fn durability_barrier_frequency(&self) -> usize {
        self.inner.sync_frequency.load(Ordering::Acquire)
    }

    /// Declares how entities of `type_name` keep their values. Applies to
    /// entities created afterwards, including those restored at the next
    /// start.
    pub fn declare_strategy(&self, type_name: impl Into<TypeName>, strategy: Strategy) {
        self.inner.strategies.declare(type_name, strategy);
    }

    /// Every committed key, by type.
    ///
    /// # Errors
    ///
    /// [`CoreError::EngineDown`] if the engine is not running.
    pub fn keys(&self) -> CoreResult<BTreeMap<TypeName, Vec<String>>> {
        Ok(self.manager()?.library().all_keys())
    }

    /// Quiesces and rolls the log now instead of waiting for it to fill.
    /// Returns whether a roll happened.
    ///
    /// # Errors
    ///
    /// [`CoreError::EngineDown`] if not running, or the roll's I/O error.
    pub fn checkpoint_now(&self) -> CoreResult<bool> {
        self.manager()?.checkpoint()
    }

    /// Opens a session.
    ///
    /// # Errors
    ///
    /// [`CoreError::EngineDown`] if the engine is not running.
    pub fn open_session(&self) -> CoreResult<Session> {
        Session::open(self)
    }
}

impl EngineInner {
    fn launch(
        &self,
        dir: Arc<InstanceDir>,
        library: Arc<Library>,
        recovered: Vec<Batch>,
        next_log: SequenceNumber,
        next_checkpoint: SequenceNumber,
    ) -> CoreResult<()> {
        let writer = CheckpointWriter::new(
            Arc::clone(&dir),
            Arc::clone(&self.factory),
            self.config.max_checkpoint_file_size,
            next_checkpoint,
        );
        let compactor = Arc::new(Compactor::start(
            Arc::clone(&dir),
            writer,
            recovered,
            self.config.compactor_retry_interval,
        )?);
        let log = TransactionLog::open(
            Arc::clone(&dir),
            Arc::clone(&self.factory),
            Arc::clone(&compactor),
            next_log,
            self.config.max_log_segment_size,
            Arc::clone(&self.sync_frequency),
        )?;
        let manager = TransactionManager::start(
            dir,
            self.config.clone(),
            library,
            log,
            compactor,
            Arc::clone(&self.next_txid),
        )?;
        *self.manager.write() = Some(manager);
        Ok(())
    }

    fn shut_down(&self) -> CoreResult<()> {
        let _lifecycle = self.lifecycle.lock();
        let Some(manager) = self.manager.write().take() else {
            return Ok(());
        };

        if let Err(e) = manager.shut_down() {
            // The snapshot below still holds every committed value.
            warn!(error = %e, "log close failed");
        }
        let dir = Arc::clone(manager.dir());
        let result = manager
            .library()
            .to_snapshot()
            .and_then(|data| dir.save_snapshot(&data))
            .and_then(|()| {
                // Oldest first: an interrupted cleanup leaves only history
                // newer than what it removed.
                dir.delete_all_checkpoints()?;
                dir.delete_all_logs()?;
                Ok(())
            });
        dir.release();

        match &result {
            Ok(()) => info!(
                path = %self.path.display(),
                entities = manager.library().len(),
                "snapshot written, engine stopped"
            ),
            Err(e) => warn!(error = %e, "shutdown could not consolidate the log"),
        }
        result
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        let _ = self.shut_down();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntityKey;
    use persist_codec::Value;
    use tempfile::tempdir;

    fn int(name: &str) -> (String, TypeName) {
        (name.to_string(), TypeName::from(Value::INTEGER))
    }

    #[test]
    fn starts_down() {
        let tmp = tempdir().unwrap();
        let engine = Engine::new(tmp.path(), Config::default());
        assert!(!engine.is_running());
        assert!(matches!(engine.keys(), Err(CoreError::EngineDown)));
        assert!(matches!(engine.open_session(), Err(CoreError::EngineDown)));
        engine.shut_down().unwrap();
    }

    #[test]
    fn start_is_idempotent() {
        let tmp = tempdir().unwrap();
        let engine = Engine::new(tmp.path(), Config::default());
        engine.cold_start().unwrap();
        engine.cold_start().unwrap();
        engine.warm_start().unwrap();
        assert!(engine.is_running());
        engine.shut_down().unwrap();
        assert!(!engine.is_running());
    }

    #[test]
    fn second_engine_on_same_directory_is_rejected() {
        let tmp = tempdir().unwrap();
        let first = Engine::new(tmp.path(), Config::default());
        first.cold_start().unwrap();

        let second = Engine::new(tmp.path(), Config::default());
        assert!(matches!(second.warm_start(), Err(CoreError::AlreadyRunning)));
        assert!(matches!(second.cold_start(), Err(CoreError::AlreadyRunning)));

        first.shut_down().unwrap();
        second.warm_start().unwrap();
        second.shut_down().unwrap();
    }

    #[test]
    fn committed_write_survives_clean_restart() {
        let tmp = tempdir().unwrap();
        let engine = Engine::new(tmp.path(), Config::default());
        engine.cold_start().unwrap();
        let (name, ty) = int("x");

        let mut session = engine.open_session().unwrap();
        session.write(&name, ty.clone(), Some(Value::Integer(1))).unwrap();
        session.commit().unwrap();
        drop(session);
        engine.shut_down().unwrap();

        let dir_entries: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert!(dir_entries.contains(&"LIBRARY".to_string()));
        assert!(!dir_entries.iter().any(|n| n.ends_with(".wal") || n.ends_with(".dat")));

        engine.warm_start().unwrap();
        let mut session = engine.open_session().unwrap();
        assert_eq!(*session.read_existing(&name, ty).unwrap(), Value::Integer(1));
        session.commit().unwrap();
        drop(session);
        engine.shut_down().unwrap();
    }

    #[test]
    fn cold_start_discards_previous_state() {
        let tmp = tempdir().unwrap();
        let engine = Engine::new(tmp.path(), Config::default());
        engine.cold_start().unwrap();
        let mut session = engine.open_session().unwrap();
        session.write("x", Value::INTEGER, Some(Value::Integer(1))).unwrap();
        session.commit().unwrap();
        drop(session);
        engine.shut_down().unwrap();

        engine.cold_start().unwrap();
        assert!(engine.keys().unwrap().is_empty());
        engine.shut_down().unwrap();
    }

    #[test]
    fn barrier_frequency_floor_is_one() {
        let tmp = tempdir().unwrap();
        let engine = Engine::new(tmp.path(), Config::default().sync_frequency(4));
        assert_eq!(engine.durability_barrier_frequency(), 4);
        engine.set_durability_barrier_frequency(0);
        assert_eq!(engine.durability_barrier_frequency(), 1);
    }

    #[test]
    fn halt_leaves_the_log_for_recovery() {
        let tmp = tempdir().unwrap();
        let engine = Engine::new(tmp.path(), Config::default());
        engine.cold_start().unwrap();
        let mut session = engine.open_session().unwrap();
        session.write("x", Value::INTEGER, Some(Value::Integer(9))).unwrap();
        session.commit().unwrap();
        drop(session);
        engine.halt();
        assert!(!engine.is_running());

        engine.warm_start().unwrap();
        let mut session = engine.open_session().unwrap();
        assert_eq!(*session.read_existing("x", Value::INTEGER).unwrap(), Value::Integer(9));
        session.rollback();
        drop(session);
        engine.shut_down().unwrap();
    }

    #[test]
    fn transaction_ids_keep_increasing_across_restarts() {
        let tmp = tempdir().unwrap();
        let engine = Engine::new(tmp.path(), Config::default());
        engine.cold_start().unwrap();
        let first = engine.manager().unwrap().new_transaction().unwrap();
        let first_id = first.id();
        first
            .write(&EntityKey::new(Value::INTEGER, "x"), Some(Value::Integer(1)))
            .unwrap();
        first.commit().unwrap();
        engine.halt();

        let restarted = Engine::new(tmp.path(), Config::default());
        restarted.warm_start().unwrap();
        let second = restarted.manager().unwrap().new_transaction().unwrap();
        assert!(second.id() > first_id);
        second.rollback();
        restarted.shut_down().unwrap();
    }
}
