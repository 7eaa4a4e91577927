//! The in-memory map of every entity.

use crate::entity::{Entity, Strategies};
use crate::error::CoreResult;
use crate::store::snapshot;
use crate::types::{EntityKey, TypeName};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

type TypeMap = HashMap<String, Arc<Entity>>;

/// Type → (name → entity).
///
/// Creation of missing entities goes through [`get_or_create`] under the
/// write lock, so two transactions can never create the same key twice.
///
/// [`get_or_create`]: Library::get_or_create
#[derive(Debug)]
pub struct Library {
    types: RwLock<HashMap<TypeName, TypeMap>>,
    strategies: Strategies,
}

impl Library {
    /// Creates an empty library.
    #[must_use]
    pub fn new(strategies: Strategies) -> Self {
        Self {
            types: RwLock::new(HashMap::new()),
            strategies,
        }
    }

    /// Restores a library from a snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot is damaged.
    pub fn from_snapshot(data: &[u8], strategies: Strategies) -> CoreResult<Self> {
        let library = Self::new(strategies);
        {
            let mut types = library.types.write();
            for (key, frozen) in snapshot::decode(data)? {
                let strategy = library.strategies.strategy_for(&key.type_name);
                types
                    .entry(key.type_name.clone())
                    .or_default()
                    .insert(key.name.clone(), Arc::new(Entity::restored(key, strategy, frozen)));
            }
        }
        Ok(library)
    }

    /// Freezes every committed value into a snapshot.
    pub fn to_snapshot(&self) -> CoreResult<Vec<u8>> {
        let entities: Vec<Arc<Entity>> = self
            .types
            .read()
            .values()
            .flat_map(|names| names.values().cloned())
            .collect();

        let mut entries = Vec::with_capacity(entities.len());
        for entity in entities {
            if let Some(frozen) = entity.frozen_committed()? {
                entries.push((entity.key().clone(), frozen));
            }
        }
        snapshot::encode(entries)
    }

    /// Looks up an entity.
    #[must_use]
    pub fn read(&self, key: &EntityKey) -> Option<Arc<Entity>> {
        self.types
            .read()
            .get(&key.type_name)
            .and_then(|names| names.get(&key.name))
            .cloned()
    }

    /// Looks up an entity, creating an absent one if needed.
    pub fn get_or_create(&self, key: &EntityKey) -> Arc<Entity> {
        if let Some(entity) = self.read(key) {
            return entity;
        }
        let mut types = self.types.write();
        let names = types.entry(key.type_name.clone()).or_default();
        let entity = names.entry(key.name.clone()).or_insert_with(|| {
            let strategy = self.strategies.strategy_for(&key.type_name);
            Arc::new(Entity::new(key.clone(), strategy))
        });
        Arc::clone(entity)
    }

    /// Inserts or replaces an entity by key. Returns the replaced one.
    pub fn add_to(&self, entity: Arc<Entity>) -> Option<Arc<Entity>> {
        let key = entity.key().clone();
        self.types
            .write()
            .entry(key.type_name)
            .or_default()
            .insert(key.name, entity)
    }

    /// Whether `entity` is still the one stored under its key.
    #[must_use]
    pub fn is_current(&self, entity: &Arc<Entity>) -> bool {
        self.read(entity.key())
            .map_or(false, |current| Arc::ptr_eq(&current, entity))
    }

    /// Removes the listed entities that are unowned and have no committed
    /// value, then prunes empty types. Returns how many were removed.
    pub fn process_deletions<'a>(&self, keys: impl IntoIterator<Item = &'a EntityKey>) -> usize {
        let mut types = self.types.write();
        let mut removed = 0;
        for key in keys {
            let Some(names) = types.get_mut(&key.type_name) else {
                continue;
            };
            if names.get(&key.name).map_or(false, |e| e.is_deleted()) {
                names.remove(&key.name);
                removed += 1;
            }
            if names.is_empty() {
                types.remove(&key.type_name);
            }
        }
        if removed > 0 {
            debug!(removed, "purged deleted entities");
        }
        removed
    }

    /// Applies one recovered update: installs the value, or removes the
    /// entity for a deletion.
    pub fn apply_recovered(&self, key: &EntityKey, frozen: Option<&[u8]>) {
        match frozen {
            Some(bytes) => match self.read(key) {
                Some(entity) => entity.restore(Some(bytes.to_vec())),
                None => {
                    let strategy = self.strategies.strategy_for(&key.type_name);
                    self.add_to(Arc::new(Entity::restored(
                        key.clone(),
                        strategy,
                        bytes.to_vec(),
                    )));
                }
            },
            None => {
                let mut types = self.types.write();
                if let Some(names) = types.get_mut(&key.type_name) {
                    names.remove(&key.name);
                    if names.is_empty() {
                        types.remove(&key.type_name);
                    }
                }
            }
        }
    }

    /// Every key with a committed value, sorted by type then name.
    ///
    /// Entities only created by a read, or written but not yet committed,
    /// are left out.
    #[must_use]
    pub fn all_keys(&self) -> BTreeMap<TypeName, Vec<String>> {
        let mut keys = BTreeMap::new();
        for (type_name, names) in self.types.read().iter() {
            let mut committed: Vec<String> = names
                .iter()
                .filter(|(_, entity)| entity.has_committed())
                .map(|(name, _)| name.clone())
                .collect();
            if committed.is_empty() {
                continue;
            }
            committed.sort();
            keys.insert(type_name.clone(), committed);
        }
        keys
    }

    /// Number of stored entities, committed or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.read().values().map(HashMap::len).sum()
    }

    /// Whether no entity is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Strategy;
    use crate::types::TransactionId;
    use persist_codec::{freeze, Value};

    const T1: TransactionId = TransactionId::new(1);

    fn key(name: &str) -> EntityKey {
        EntityKey::new(Value::INTEGER, name)
    }

    fn commit(entity: &Entity, value: Option<Value>) {
        entity.acquire(T1);
        entity.write(T1, value).unwrap();
        entity.prepare(T1);
        entity.finalize_commit(T1);
    }

    #[test]
    fn creation_is_idempotent() {
        let library = Library::new(Strategies::default());
        let a = library.get_or_create(&key("x"));
        let b = library.get_or_create(&key("x"));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(library.is_current(&a));
        assert_eq!(library.len(), 1);
    }

    #[test]
    fn declared_strategy_applies_on_creation() {
        let strategies = Strategies::default();
        strategies.declare(Value::TEXT, Strategy::Cloned);
        let library = Library::new(strategies);
        let entity = library.get_or_create(&EntityKey::new(Value::TEXT, "t"));
        assert_eq!(entity.strategy(), Strategy::Cloned);
        assert_eq!(library.get_or_create(&key("i")).strategy(), Strategy::Frozen);
    }

    #[test]
    fn replaced_entity_is_no_longer_current() {
        let library = Library::new(Strategies::default());
        let old = library.get_or_create(&key("x"));
        let replaced = library.add_to(Arc::new(Entity::new(key("x"), Strategy::Frozen)));
        assert!(Arc::ptr_eq(&replaced.unwrap(), &old));
        assert!(!library.is_current(&old));
    }

    #[test]
    fn deletions_purge_only_unowned_empty_entities() {
        let library = Library::new(Strategies::default());
        let kept = library.get_or_create(&key("kept"));
        commit(&kept, Some(Value::Integer(1)));
        let owned = library.get_or_create(&key("owned"));
        owned.acquire(TransactionId::new(9));
        let gone = library.get_or_create(&key("gone"));
        commit(&gone, None);

        let removed = library.process_deletions([&key("kept"), &key("owned"), &key("gone")]);
        assert_eq!(removed, 1);
        assert_eq!(library.len(), 2);
        assert_eq!(library.all_keys()[&TypeName::from(Value::INTEGER)], vec!["kept"]);

        owned.abort(TransactionId::new(9));
        assert_eq!(library.process_deletions([&key("owned")]), 1);
        commit(&kept, None);
        library.process_deletions([&key("kept")]);
        assert!(library.all_keys().is_empty());
        assert!(library.is_empty());
    }

    #[test]
    fn recovered_updates_apply_in_order() {
        let library = Library::new(Strategies::default());
        let one = freeze(&Value::Integer(1)).unwrap();
        let two = freeze(&Value::Integer(2)).unwrap();
        library.apply_recovered(&key("x"), Some(&one));
        library.apply_recovered(&key("x"), Some(&two));
        library.apply_recovered(&key("y"), Some(&one));
        library.apply_recovered(&key("y"), None);
        library.apply_recovered(&key("never"), None);

        assert_eq!(library.len(), 1);
        let x = library.read(&key("x")).unwrap();
        x.acquire(T1);
        assert_eq!(*x.read(T1).unwrap().unwrap(), Value::Integer(2));
    }

    #[test]
    fn snapshot_restores_committed_values() {
        let library = Library::new(Strategies::default());
        commit(&library.get_or_create(&key("x")), Some(Value::Integer(7)));
        let text = EntityKey::new(Value::TEXT, "t");
        commit(&library.get_or_create(&text), Some(Value::text("seven")));
        // Created by a read, never written: not part of the snapshot.
        library.get_or_create(&key("placeholder"));

        let restored = Library::from_snapshot(&library.to_snapshot().unwrap(), Strategies::default()).unwrap();
        assert_eq!(restored.len(), 2);
        let t = restored.read(&text).unwrap();
        t.acquire(T1);
        assert_eq!(*t.read(T1).unwrap().unwrap(), Value::text("seven"));
    }
}
