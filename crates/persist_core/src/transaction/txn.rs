//! A unit of work over a set of entities.

use crate::checkpoint::CheckpointRecord;
use crate::entity::{Entity, PrepareOutcome};
use crate::error::{CoreError, CoreResult};
use crate::transaction::manager::{HeldEntities, TransactionManager};
use crate::transaction::state::TransactionState;
use crate::types::{EntityKey, TransactionId};
use parking_lot::{Condvar, Mutex};
use persist_codec::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// A transaction.
///
/// Entities are acquired on first access and held until commit or
/// rollback. An entity owned by another live transaction blocks the
/// acquire; blocking may close a deadlock, in which case one side is
/// killed and sees [`CoreError::TransactionKilled`] (or
/// [`CoreError::TransactionAborted`] from `commit`). Every error that
/// ends the transaction rolls it back first.
pub struct Transaction {
    id: TransactionId,
    created: Instant,
    state: Mutex<TransactionState>,
    killed: AtomicBool,
    held: Mutex<HeldEntities>,
    held_count: AtomicUsize,
    woken: Mutex<bool>,
    wake_signal: Condvar,
    manager: Arc<TransactionManager>,
}

impl Transaction {
    pub(crate) fn new(id: TransactionId, held: HeldEntities, manager: Arc<TransactionManager>) -> Self {
        Self {
            id,
            created: Instant::now(),
            state: Mutex::new(TransactionState::Active),
            killed: AtomicBool::new(false),
            held: Mutex::new(held),
            held_count: AtomicUsize::new(0),
            woken: Mutex::new(false),
            wake_signal: Condvar::new(),
            manager,
        }
    }

    /// Returns the transaction ID.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// When the transaction started.
    #[must_use]
    pub fn created(&self) -> Instant {
        self.created
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    /// Whether the transaction was chosen as a deadlock victim.
    #[must_use]
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// Active and not killed.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.is_killed() && self.state() == TransactionState::Active
    }

    /// Number of entities held.
    #[must_use]
    pub fn held_count(&self) -> usize {
        self.held_count.load(Ordering::Acquire)
    }

    /// Marks the transaction killed. It rolls itself back at its next
    /// operation; waking it is up to the caller.
    pub(crate) fn kill(&self) {
        self.killed.store(true, Ordering::Release);
    }

    /// Wakes the transaction if it is waiting for an entity. A wake that
    /// arrives before the wait is kept.
    pub(crate) fn wake(&self) {
        let mut woken = self.woken.lock();
        *woken = true;
        self.wake_signal.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn has_pending_wake(&self) -> bool {
        *self.woken.lock()
    }

    fn wait(&self, timeout: Duration) {
        let mut woken = self.woken.lock();
        if !*woken {
            self.wake_signal.wait_for(&mut woken, timeout);
        }
        *woken = false;
    }

    pub(crate) fn take_held(&self) -> HeldEntities {
        self.held_count.store(0, Ordering::Release);
        std::mem::take(&mut *self.held.lock())
    }

    fn ensure_usable(&self, key: &EntityKey) -> CoreResult<()> {
        if self.is_killed() {
            self.rollback();
            return Err(CoreError::TransactionKilled { txid: self.id });
        }
        if self.state().is_terminal() {
            return Err(CoreError::AccessViolation { key: key.clone() });
        }
        Ok(())
    }

    /// Takes ownership of the entity under `key`, waiting while another
    /// transaction owns it.
    ///
    /// With `must_exist`, a key with no entity fails
    /// [`CoreError::NotFound`] instead of creating one.
    fn acquire_entity(self: &Arc<Self>, key: &EntityKey, must_exist: bool) -> CoreResult<Arc<Entity>> {
        self.ensure_usable(key)?;
        if let Some(entity) = self.held.lock().get(key) {
            return Ok(Arc::clone(entity));
        }

        let manager = &self.manager;
        let fetch = || -> CoreResult<Arc<Entity>> {
            if must_exist {
                manager
                    .lookup_entity(key)
                    .ok_or_else(|| CoreError::NotFound { key: key.clone() })
            } else {
                Ok(manager.get_entity(key))
            }
        };

        let mut entity = fetch()?;
        loop {
            let owner = entity.acquire(self.id);
            if owner == self.id {
                if manager.library().is_current(&entity) {
                    manager.clear_block(self.id);
                    self.held.lock().insert(key.clone(), Arc::clone(&entity));
                    self.held_count.fetch_add(1, Ordering::AcqRel);
                    trace!(txid = %self.id, %key, "acquired entity");
                    return Ok(entity);
                }
                // Purged and recreated while we were acquiring it.
                entity.abort(self.id);
            } else {
                trace!(txid = %self.id, %key, %owner, "entity busy, waiting");
                let timeout = if manager.add_block(self, owner) {
                    manager.config().block_timeout
                } else {
                    manager.config().retry_interval
                };
                if !self.is_killed() {
                    self.wait(timeout);
                }
            }

            if self.is_killed() {
                manager.clear_block(self.id);
                self.rollback();
                return Err(CoreError::TransactionKilled { txid: self.id });
            }
            entity = match fetch() {
                Ok(entity) => entity,
                Err(e) => {
                    manager.clear_block(self.id);
                    return Err(e);
                }
            };
        }
    }

    /// Reads `key`. `None` means absent or deleted.
    pub fn read(self: &Arc<Self>, key: &EntityKey) -> CoreResult<Option<Arc<Value>>> {
        self.acquire_entity(key, false)?.read(self.id)
    }

    /// Reads `key`, failing [`CoreError::NotFound`] if it is absent or
    /// deleted.
    pub fn read_existing(self: &Arc<Self>, key: &EntityKey) -> CoreResult<Arc<Value>> {
        self.acquire_entity(key, true)?
            .read(self.id)?
            .ok_or_else(|| CoreError::NotFound { key: key.clone() })
    }

    /// Stages a write of `key`; `None` deletes it.
    pub fn write(self: &Arc<Self>, key: &EntityKey, value: Option<Value>) -> CoreResult<()> {
        self.acquire_entity(key, false)?.write(self.id, value)
    }

    /// Commits every staged write.
    ///
    /// # Errors
    ///
    /// - [`CoreError::TransactionAborted`] if the transaction was killed
    ///   or already finished
    /// - [`CoreError::CommitFailed`] if a value cannot be frozen or the
    ///   log cannot be written
    ///
    /// The transaction is rolled back before any error is returned.
    pub fn commit(&self) -> CoreResult<()> {
        if !self.is_alive() {
            self.rollback();
            return Err(CoreError::TransactionAborted { txid: self.id });
        }

        let held: Vec<Arc<Entity>> = self.held.lock().values().cloned().collect();
        self.manager.start_commit();
        if let Err(e) = self.prepare_and_finalize(&held) {
            self.manager.end_commit();
            warn!(txid = %self.id, error = %e, "commit failed, rolling back");
            self.rollback();
            self.reopen_log();
            return Err(e);
        }

        *self.state.lock() = TransactionState::Committed;
        self.manager
            .library()
            .process_deletions(held.iter().map(|e| e.key()));
        self.manager.end_commit();
        self.manager.remove_transaction(self);
        debug!(txid = %self.id, entities = held.len(), "committed");
        Ok(())
    }

    fn prepare_and_finalize(&self, held: &[Arc<Entity>]) -> CoreResult<()> {
        let mut batch = Vec::new();
        for entity in held {
            match entity.prepare(self.id) {
                PrepareOutcome::Unchanged => {}
                PrepareOutcome::Changed(value) => batch.push(CheckpointRecord {
                    key: entity.key().clone(),
                    value,
                }),
                PrepareOutcome::Failed => {
                    return Err(CoreError::commit_failed(
                        self.id,
                        format!("{} could not be prepared", entity.key()),
                    ))
                }
            }
        }

        let killed = || CoreError::commit_failed(self.id, "killed during commit");
        if batch.is_empty() {
            if self.is_killed() {
                return Err(killed());
            }
            for entity in held {
                entity.finalize_commit(self.id);
            }
            return Ok(());
        }

        let failed = |e: CoreError| CoreError::commit_failed(self.id, e.to_string());
        let scope = self.manager.log().begin_commit().map_err(failed)?;
        for record in &batch {
            scope
                .log_update(self.id, &record.key, record.value.as_deref())
                .map_err(failed)?;
        }
        if self.is_killed() {
            return Err(killed());
        }
        scope.log_end(self.id).map_err(failed)?;

        for entity in held {
            entity.finalize_commit(self.id);
        }
        scope.record_committed(batch).map_err(failed)
    }

    /// A failed append leaves the segment unusable; move to a fresh one
    /// so later commits can succeed.
    fn reopen_log(&self) {
        let log = self.manager.log();
        if self.manager.is_running() && log.is_poisoned() {
            if let Err(e) = log.roll() {
                warn!(error = %e, "could not replace the failed log segment");
            }
        }
    }

    /// Discards every staged write and releases all entities. Does nothing
    /// once the transaction has finished.
    pub fn rollback(&self) {
        {
            let mut state = self.state.lock();
            if state.is_terminal() {
                return;
            }
            *state = TransactionState::RolledBack;
        }

        let held: Vec<Arc<Entity>> = self.held.lock().values().cloned().collect();
        for entity in &held {
            entity.abort(self.id);
        }
        self.wake();
        self.manager
            .library()
            .process_deletions(held.iter().map(|e| e.key()));
        self.manager.remove_transaction(self);
        debug!(txid = %self.id, entities = held.len(), "rolled back");
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("killed", &self.is_killed())
            .field("held", &self.held_count())
            .finish()
    }
}
