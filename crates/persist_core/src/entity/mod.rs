//! Persistent entities.
//!
//! An entity is one named, typed value in the object store together with
//! the state of the transaction currently owning it. Ownership is
//! exclusive: only the owning transaction can read, stage or commit it.
//!
//! ## Two-Phase Commit
//!
//! - [`Entity::prepare`] freezes the staged value; the returned bytes are
//!   what the log records
//! - [`Entity::finalize_commit`] promotes the prepared value and releases
//!   ownership
//! - [`Entity::abort`] releases ownership, keeping the previous value

mod strategy;

pub use strategy::{Committed, Strategies, Strategy};

use crate::error::{CoreError, CoreResult};
use crate::types::{EntityKey, TransactionId};
use parking_lot::Mutex;
use persist_codec::{freeze, Value};
use std::sync::Arc;
use tracing::warn;

/// Result of phase one for one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepareOutcome {
    /// Not written by the transaction; nothing to log.
    Unchanged,
    /// Written: the frozen value, or `None` for a deletion.
    Changed(Option<Vec<u8>>),
    /// The staged value could not be frozen, or the caller does not own
    /// the entity. The transaction must roll back.
    Failed,
}

#[derive(Debug, Default)]
struct EntityState {
    committed: Option<Committed>,
    staged: Option<Arc<Value>>,
    /// Set by `prepare`: the committed value to promote, `None` deletes.
    prepared: Option<Option<Committed>>,
    owner: Option<TransactionId>,
    changed: bool,
    in_commit: bool,
}

/// A named, typed value and its ownership state.
#[derive(Debug)]
pub struct Entity {
    key: EntityKey,
    strategy: Strategy,
    state: Mutex<EntityState>,
}

impl Entity {
    /// Creates an entity with no committed value.
    #[must_use]
    pub fn new(key: EntityKey, strategy: Strategy) -> Self {
        Self {
            key,
            strategy,
            state: Mutex::new(EntityState::default()),
        }
    }

    /// Creates an entity restored from disk.
    #[must_use]
    pub fn restored(key: EntityKey, strategy: Strategy, frozen: Vec<u8>) -> Self {
        let entity = Self::new(key, strategy);
        entity.state.lock().committed = Some(Committed::Frozen(frozen));
        entity
    }

    /// The entity's key.
    #[must_use]
    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    /// The strategy the entity was created with.
    #[must_use]
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// The owning transaction, if any.
    #[must_use]
    pub fn owner(&self) -> Option<TransactionId> {
        self.state.lock().owner
    }

    /// No committed value and not being written.
    #[must_use]
    pub fn is_absent(&self) -> bool {
        let state = self.state.lock();
        state.committed.is_none() && !(state.changed && state.staged.is_some())
    }

    /// Whether a committed value exists.
    #[must_use]
    pub fn has_committed(&self) -> bool {
        self.state.lock().committed.is_some()
    }

    /// No committed value and not owned: safe to purge from the store.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        let state = self.state.lock();
        state.committed.is_none() && state.owner.is_none()
    }

    /// Becomes owned by `tx` if unowned. Returns the owner after the call;
    /// the caller succeeded iff it is `tx`.
    pub fn acquire(&self, tx: TransactionId) -> TransactionId {
        let mut state = self.state.lock();
        *state.owner.get_or_insert(tx)
    }

    fn check_owner(&self, state: &EntityState, tx: TransactionId) -> CoreResult<()> {
        if state.owner == Some(tx) {
            Ok(())
        } else {
            Err(CoreError::AccessViolation {
                key: self.key.clone(),
            })
        }
    }

    /// Returns the value as `tx` sees it: its own staged write, or the
    /// committed value. `None` means absent or deleted.
    ///
    /// # Errors
    ///
    /// [`CoreError::AccessViolation`] unless `tx` owns the entity.
    pub fn read(&self, tx: TransactionId) -> CoreResult<Option<Arc<Value>>> {
        let state = self.state.lock();
        self.check_owner(&state, tx)?;
        if state.changed {
            return Ok(state.staged.clone());
        }
        state
            .committed
            .as_ref()
            .map(|c| self.strategy.behavior().read(c))
            .transpose()
    }

    /// Stages `value` for `tx`; `None` stages a deletion.
    ///
    /// # Errors
    ///
    /// [`CoreError::AccessViolation`] unless `tx` owns the entity, or
    /// [`CoreError::TypeMismatch`] if the value's type is not the entity's.
    pub fn write(&self, tx: TransactionId, value: Option<Value>) -> CoreResult<()> {
        let mut state = self.state.lock();
        self.check_owner(&state, tx)?;
        if let Some(v) = &value {
            if v.type_name() != self.key.type_name.as_str() {
                return Err(CoreError::TypeMismatch {
                    key: self.key.clone(),
                    expected: self.key.type_name.clone(),
                    actual: v.type_name().to_string(),
                });
            }
        }
        state.staged = value.map(Arc::new);
        state.changed = true;
        Ok(())
    }

    /// Phase one: freezes the staged value of `tx`.
    pub fn prepare(&self, tx: TransactionId) -> PrepareOutcome {
        let mut state = self.state.lock();
        if state.owner != Some(tx) {
            return PrepareOutcome::Failed;
        }
        state.in_commit = true;
        if !state.changed {
            return PrepareOutcome::Unchanged;
        }

        match state.staged.clone() {
            None => {
                state.prepared = Some(None);
                PrepareOutcome::Changed(None)
            }
            Some(staged) => match freeze(&staged) {
                Ok(frozen) => {
                    let committed = self.strategy.behavior().keep(staged, &frozen);
                    state.prepared = Some(Some(committed));
                    PrepareOutcome::Changed(Some(frozen))
                }
                Err(e) => {
                    warn!(key = %self.key, error = %e, "staged value could not be frozen");
                    PrepareOutcome::Failed
                }
            },
        }
    }

    /// Phase two: promotes the prepared value and releases ownership.
    pub fn finalize_commit(&self, tx: TransactionId) {
        let mut state = self.state.lock();
        if state.owner != Some(tx) {
            return;
        }
        if let Some(prepared) = state.prepared.take() {
            state.committed = prepared;
        }
        Self::release(&mut state);
    }

    /// Releases ownership held by `tx`, discarding staged changes.
    pub fn abort(&self, tx: TransactionId) {
        let mut state = self.state.lock();
        if state.owner == Some(tx) {
            Self::release(&mut state);
        }
    }

    fn release(state: &mut EntityState) {
        state.staged = None;
        state.prepared = None;
        state.owner = None;
        state.changed = false;
        state.in_commit = false;
    }

    /// Installs a recovered committed value, or clears it.
    pub(crate) fn restore(&self, frozen: Option<Vec<u8>>) {
        self.state.lock().committed = frozen.map(Committed::Frozen);
    }

    /// The committed value in frozen form, for snapshots.
    pub(crate) fn frozen_committed(&self) -> CoreResult<Option<Vec<u8>>> {
        let state = self.state.lock();
        match &state.committed {
            None => Ok(None),
            Some(Committed::Frozen(bytes)) => Ok(Some(bytes.clone())),
            Some(Committed::Live(value)) => Ok(Some(freeze(value)?)),
        }
    }

    #[cfg(test)]
    pub(crate) fn in_commit(&self) -> bool {
        self.state.lock().in_commit
    }
}
