//! Cross-module scenario helpers.
//!
//! [`ModelHarness`] applies committed writes to both an engine and a plain
//! map, so tests can check the engine against the model after restarts
//! and crashes.

use crate::fixtures::TestEngine;
use persist_core::Value;
use std::collections::BTreeMap;

/// An engine paired with the map of Integer values it should hold.
pub struct ModelHarness {
    /// The engine under test.
    pub engine: TestEngine,
    model: BTreeMap<String, i64>,
}

impl ModelHarness {
    /// Creates a harness over a cold-started engine.
    pub fn new() -> Self {
        Self {
            engine: TestEngine::cold(),
            model: BTreeMap::new(),
        }
    }

    /// Commits `name` = `value` and records it.
    pub fn put(&mut self, name: &str, value: i64) {
        self.engine.put_integer(name, value);
        self.model.insert(name.to_string(), value);
    }

    /// Commits a deletion of `name` and records it.
    pub fn delete(&mut self, name: &str) {
        self.engine.delete_integer(name);
        self.model.remove(name);
    }

    /// Stages `name` = `value` and rolls it back; the model is unchanged.
    pub fn put_and_roll_back(&mut self, name: &str, value: i64) {
        let mut session = self.engine.open_session().expect("Failed to open session");
        session
            .write(name, Value::INTEGER, Some(Value::Integer(value)))
            .expect("Failed to write");
        session.rollback();
    }

    /// Asserts that the engine holds exactly the model's keys and values.
    pub fn verify(&self) {
        let names = self.engine.integer_names();
        let expected: Vec<String> = self.model.keys().cloned().collect();
        assert_eq!(names, expected, "key set mismatch");
        for (name, value) in &self.model {
            assert_eq!(
                self.engine.get_integer(name),
                Some(*value),
                "value mismatch for {name}"
            );
        }
    }

    /// Returns the count of tracked entities.
    pub fn tracked_count(&self) -> usize {
        self.model.len()
    }
}

impl Default for ModelHarness {
    fn default() -> Self {
        Self::new()
    }
}
