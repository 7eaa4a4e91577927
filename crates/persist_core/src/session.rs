//! Client sessions.
//!
//! A session runs one transaction at a time. The first access after a
//! commit, a rollback or a transaction-ending error begins a new one, so
//! callers retry simply by repeating their operations on the same
//! session.

use crate::engine::Engine;
use crate::error::{CoreError, CoreResult};
use crate::transaction::Transaction;
use crate::types::{EntityKey, TypeName};
use persist_codec::{from_value, to_value, Value};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// A client's handle on the engine.
///
/// Dropping a session rolls back its open transaction.
pub struct Session {
    id: u64,
    engine: Engine,
    tx: Option<Arc<Transaction>>,
}

impl Session {
    /// Opens a session on a running engine.
    ///
    /// # Errors
    ///
    /// [`CoreError::EngineDown`] if the engine is not running.
    pub fn open(engine: &Engine) -> CoreResult<Self> {
        if !engine.is_running() {
            return Err(CoreError::EngineDown);
        }
        Ok(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            engine: engine.clone(),
            tx: None,
        })
    }

    /// Process-unique session id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The open transaction, if any.
    #[must_use]
    pub fn current_transaction(&self) -> Option<&Arc<Transaction>> {
        self.tx.as_ref()
    }

    fn transaction(&mut self) -> CoreResult<Arc<Transaction>> {
        if let Some(tx) = &self.tx {
            if tx.state().is_terminal() {
                self.tx = None;
            } else {
                return Ok(Arc::clone(tx));
            }
        }
        let tx = self
            .engine
            .manager()?
            .new_transaction()
            .ok_or(CoreError::EngineDown)?;
        self.tx = Some(Arc::clone(&tx));
        Ok(tx)
    }

    fn run<T>(
        &mut self,
        op: impl FnOnce(&Arc<Transaction>) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let tx = self.transaction()?;
        let result = op(&tx);
        if let Err(e) = &result {
            if e.ends_transaction() {
                self.tx = None;
            }
        }
        result
    }

    /// Reads `name` of `type_name`. `None` means absent or deleted.
    ///
    /// # Errors
    ///
    /// [`CoreError::TransactionKilled`] if the transaction was chosen as a
    /// deadlock victim; it has been rolled back.
    pub fn read(
        &mut self,
        name: &str,
        type_name: impl Into<TypeName>,
    ) -> CoreResult<Option<Arc<Value>>> {
        let key = EntityKey::new(type_name, name);
        self.run(|tx| tx.read(&key))
    }

    /// Reads `name` of `type_name`, failing [`CoreError::NotFound`] if it
    /// is absent or deleted.
    pub fn read_existing(
        &mut self,
        name: &str,
        type_name: impl Into<TypeName>,
    ) -> CoreResult<Arc<Value>> {
        let key = EntityKey::new(type_name, name);
        self.run(|tx| tx.read_existing(&key))
    }

    /// Stages a write; `None` deletes the entity at commit.
    ///
    /// # Errors
    ///
    /// [`CoreError::TypeMismatch`] if the value's type is not `type_name`.
    pub fn write(
        &mut self,
        name: &str,
        type_name: impl Into<TypeName>,
        value: Option<Value>,
    ) -> CoreResult<()> {
        let key = EntityKey::new(type_name, name);
        self.run(|tx| tx.write(&key, value))
    }

    /// Reads a record of `type_name` and deserializes its body.
    pub fn read_as<T: DeserializeOwned>(
        &mut self,
        name: &str,
        type_name: impl Into<TypeName>,
    ) -> CoreResult<Option<T>> {
        let Some(value) = self.read(name, type_name)? else {
            return Ok(None);
        };
        let body = value.as_record_body().unwrap_or(&*value);
        Ok(Some(from_value(body)?))
    }

    /// Serializes `value` into a record of `type_name` and stages it.
    pub fn write_as<T: Serialize>(
        &mut self,
        name: &str,
        type_name: impl Into<TypeName>,
        value: &T,
    ) -> CoreResult<()> {
        let type_name = type_name.into();
        let record = Value::record(type_name.as_str(), to_value(value)?);
        self.write(name, type_name, Some(record))
    }

    /// Commits the open transaction. Does nothing if none is open.
    ///
    /// # Errors
    ///
    /// [`CoreError::TransactionAborted`] or [`CoreError::CommitFailed`];
    /// either way the transaction has been rolled back.
    pub fn commit(&mut self) -> CoreResult<()> {
        match self.tx.take() {
            Some(tx) => tx.commit(),
            None => Ok(()),
        }
    }

    /// Rolls back the open transaction. Does nothing if none is open.
    pub fn rollback(&mut self) {
        if let Some(tx) = self.tx.take() {
            tx.rollback();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.rollback();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("transaction", &self.tx.as_ref().map(|tx| tx.id()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use serde::Deserialize;
    use tempfile::{tempdir, TempDir};

    fn running() -> (TempDir, Engine) {
        let tmp = tempdir().unwrap();
        let engine = Engine::new(tmp.path(), Config::default());
        engine.cold_start().unwrap();
        (tmp, engine)
    }

    #[test]
    fn open_requires_running_engine() {
        let tmp = tempdir().unwrap();
        let engine = Engine::new(tmp.path(), Config::default());
        assert!(matches!(Session::open(&engine), Err(CoreError::EngineDown)));
    }

    #[test]
    fn session_ids_are_unique() {
        let (_tmp, engine) = running();
        let a = engine.open_session().unwrap();
        let b = engine.open_session().unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn read_of_missing_entity_is_none() {
        let (_tmp, engine) = running();
        let mut session = engine.open_session().unwrap();
        assert!(session.read("nobody", Value::TEXT).unwrap().is_none());
        assert!(matches!(
            session.read_existing("nobody", Value::TEXT),
            Err(CoreError::NotFound { .. })
        ));
        session.rollback();
        assert!(engine.keys().unwrap().is_empty());
    }

    #[test]
    fn own_writes_are_visible_before_commit() {
        let (_tmp, engine) = running();
        let mut session = engine.open_session().unwrap();
        session.write("greeting", Value::TEXT, Some(Value::text("hi"))).unwrap();
        assert_eq!(
            *session.read_existing("greeting", Value::TEXT).unwrap(),
            Value::text("hi")
        );
        session.commit().unwrap();
        assert!(session.current_transaction().is_none());
    }

    #[test]
    fn rollback_discards_writes() {
        let (_tmp, engine) = running();
        let mut session = engine.open_session().unwrap();
        session.write("x", Value::INTEGER, Some(Value::Integer(1))).unwrap();
        session.rollback();
        assert!(session.read("x", Value::INTEGER).unwrap().is_none());
        session.commit().unwrap();
    }

    #[test]
    fn delete_removes_entity_at_commit() {
        let (_tmp, engine) = running();
        let mut session = engine.open_session().unwrap();
        session.write("x", Value::INTEGER, Some(Value::Integer(1))).unwrap();
        session.commit().unwrap();

        session.write("x", Value::INTEGER, None).unwrap();
        session.commit().unwrap();
        assert!(session.read("x", Value::INTEGER).unwrap().is_none());
        session.commit().unwrap();
        assert!(engine.keys().unwrap().is_empty());
    }

    #[test]
    fn type_mismatch_keeps_transaction_open() {
        let (_tmp, engine) = running();
        let mut session = engine.open_session().unwrap();
        session.write("x", Value::INTEGER, Some(Value::Integer(1))).unwrap();
        let err = session
            .write("x", Value::INTEGER, Some(Value::text("one")))
            .unwrap_err();
        assert!(matches!(err, CoreError::TypeMismatch { .. }));
        assert!(session.current_transaction().is_some());
        session.commit().unwrap();

        assert_eq!(
            *session.read_existing("x", Value::INTEGER).unwrap(),
            Value::Integer(1)
        );
    }

    #[test]
    fn drop_rolls_back() {
        let (_tmp, engine) = running();
        {
            let mut session = engine.open_session().unwrap();
            session.write("x", Value::INTEGER, Some(Value::Integer(1))).unwrap();
        }
        let mut session = engine.open_session().unwrap();
        assert!(session.read("x", Value::INTEGER).unwrap().is_none());
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Account {
        owner: String,
        balance: i64,
    }

    #[test]
    fn typed_records_round_trip() {
        let (_tmp, engine) = running();
        let mut session = engine.open_session().unwrap();
        let account = Account {
            owner: "ada".into(),
            balance: 100,
        };
        session.write_as("acct-1", "Account", &account).unwrap();
        session.commit().unwrap();

        let loaded: Option<Account> = session.read_as("acct-1", "Account").unwrap();
        assert_eq!(loaded, Some(account));
        let missing: Option<Account> = session.read_as("acct-2", "Account").unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn stale_session_fails_after_shutdown() {
        let (_tmp, engine) = running();
        let mut session = engine.open_session().unwrap();
        session.write("x", Value::INTEGER, Some(Value::Integer(1))).unwrap();
        engine.shut_down().unwrap();

        assert!(session.commit().is_err());
        assert!(matches!(
            session.read("x", Value::INTEGER),
            Err(CoreError::EngineDown)
        ));
    }
}
