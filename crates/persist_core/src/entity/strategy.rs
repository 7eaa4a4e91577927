//! How an entity keeps its committed value and hands it to readers.

use crate::error::CoreResult;
use crate::types::TypeName;
use parking_lot::RwLock;
use persist_codec::{thaw, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// The committed value of an entity.
#[derive(Debug, Clone)]
pub enum Committed {
    /// Frozen bytes, thawed on every read.
    Frozen(Vec<u8>),
    /// A live value.
    Live(Arc<Value>),
}

/// Declared per type; decides whether committed values are kept frozen or
/// live, and what readers receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Strategy {
    /// Kept as frozen bytes; every read thaws a fresh copy.
    #[default]
    Frozen,
    /// Kept live; every read gets a deep copy.
    Cloned,
    /// Kept live and handed out shared, with no copy.
    Unchecked,
}

impl Strategy {
    pub(crate) fn behavior(self) -> &'static dyn ValueStrategy {
        match self {
            Self::Frozen => &FrozenCopy,
            Self::Cloned => &ClonedCopy,
            Self::Unchecked => &SharedReference,
        }
    }
}

/// Strategies declared per type, shared by every run of an engine.
#[derive(Debug, Clone, Default)]
pub struct Strategies(Arc<RwLock<HashMap<TypeName, Strategy>>>);

impl Strategies {
    /// Declares the strategy for entities of `type_name` created from now on.
    pub fn declare(&self, type_name: impl Into<TypeName>, strategy: Strategy) {
        self.0.write().insert(type_name.into(), strategy);
    }

    /// The declared strategy, [`Strategy::Frozen`] if none.
    #[must_use]
    pub fn strategy_for(&self, type_name: &TypeName) -> Strategy {
        self.0.read().get(type_name).copied().unwrap_or_default()
    }
}

pub(crate) trait ValueStrategy: Send + Sync {
    /// What to keep once `staged` commits; `frozen` is its frozen form.
    fn keep(&self, staged: Arc<Value>, frozen: &[u8]) -> Committed;

    /// What a reader of a live committed value receives.
    fn share(&self, live: &Arc<Value>) -> Arc<Value>;

    fn read(&self, committed: &Committed) -> CoreResult<Arc<Value>> {
        match committed {
            // Restored entities are frozen whatever their strategy.
            Committed::Frozen(bytes) => Ok(Arc::new(thaw(bytes)?)),
            Committed::Live(value) => Ok(self.share(value)),
        }
    }
}

struct FrozenCopy;

impl ValueStrategy for FrozenCopy {
    fn keep(&self, _staged: Arc<Value>, frozen: &[u8]) -> Committed {
        Committed::Frozen(frozen.to_vec())
    }

    fn share(&self, live: &Arc<Value>) -> Arc<Value> {
        Arc::new(Value::clone(live))
    }
}

struct ClonedCopy;

impl ValueStrategy for ClonedCopy {
    fn keep(&self, staged: Arc<Value>, _frozen: &[u8]) -> Committed {
        Committed::Live(staged)
    }

    fn share(&self, live: &Arc<Value>) -> Arc<Value> {
        Arc::new(Value::clone(live))
    }
}

struct SharedReference;

impl ValueStrategy for SharedReference {
    fn keep(&self, staged: Arc<Value>, _frozen: &[u8]) -> Committed {
        Committed::Live(staged)
    }

    fn share(&self, live: &Arc<Value>) -> Arc<Value> {
        Arc::clone(live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use persist_codec::freeze;

    fn staged() -> (Arc<Value>, Vec<u8>) {
        let value = Value::text("hello");
        let frozen = freeze(&value).unwrap();
        (Arc::new(value), frozen)
    }

    #[test]
    fn undeclared_types_default_to_frozen() {
        let strategies = Strategies::default();
        strategies.declare("Account", Strategy::Unchecked);
        let shared = strategies.clone();
        assert_eq!(shared.strategy_for(&TypeName::from("Account")), Strategy::Unchecked);
        assert_eq!(shared.strategy_for(&TypeName::from("Integer")), Strategy::Frozen);
    }

    #[test]
    fn frozen_keeps_bytes_and_thaws_fresh() {
        let (value, frozen) = staged();
        let committed = Strategy::Frozen.behavior().keep(Arc::clone(&value), &frozen);
        assert!(matches!(&committed, Committed::Frozen(b) if *b == frozen));

        let a = Strategy::Frozen.behavior().read(&committed).unwrap();
        let b = Strategy::Frozen.behavior().read(&committed).unwrap();
        assert_eq!(*a, *value);
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn cloned_copies_on_read() {
        let (value, frozen) = staged();
        let committed = Strategy::Cloned.behavior().keep(Arc::clone(&value), &frozen);
        let read = Strategy::Cloned.behavior().read(&committed).unwrap();
        assert_eq!(*read, *value);
        assert!(!Arc::ptr_eq(&read, &value));
    }

    #[test]
    fn unchecked_shares_the_committed_value() {
        let (value, frozen) = staged();
        let committed = Strategy::Unchecked.behavior().keep(Arc::clone(&value), &frozen);
        let read = Strategy::Unchecked.behavior().read(&committed).unwrap();
        assert!(Arc::ptr_eq(&read, &value));
    }

    #[test]
    fn restored_bytes_read_under_any_strategy() {
        let (value, frozen) = staged();
        let committed = Committed::Frozen(frozen);
        for strategy in [Strategy::Frozen, Strategy::Cloned, Strategy::Unchecked] {
            assert_eq!(*strategy.behavior().read(&committed).unwrap(), *value);
        }
    }
}
