//! Test fixtures and engine helpers.
//!
//! Provides temporary engines and shortcuts for single-key transactions.

use persist_core::{Config, CoreResult, Engine, TypeName, Value};
use persist_storage::StorageFactory;
use std::path::Path;
use std::sync::{Arc, Once};
use std::time::Duration;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Installs a test-friendly tracing subscriber, filtered by `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Configuration with short waits, so blocking tests finish quickly.
pub fn fast_config() -> Config {
    Config::default()
        .retry_interval(Duration::from_millis(2))
        .block_timeout(Duration::from_millis(20))
        .quiesce_timeout(Duration::from_millis(20))
        .compactor_retry_interval(Duration::from_millis(20))
}

/// An engine over a temporary directory, removed on drop.
pub struct TestEngine {
    /// The engine instance.
    pub engine: Engine,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: TempDir,
}

impl TestEngine {
    /// Creates a cold-started engine with [`fast_config`].
    pub fn cold() -> Self {
        Self::with_config(fast_config())
    }

    /// Creates a cold-started engine.
    pub fn with_config(config: Config) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let engine = Engine::new(temp_dir.path(), config);
        engine.cold_start().expect("Failed to cold start");
        Self {
            engine,
            _temp_dir: temp_dir,
        }
    }

    /// Creates a cold-started engine that opens its files through
    /// `factory`.
    pub fn with_storage(config: Config, factory: Arc<dyn StorageFactory>) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let engine = Engine::with_storage(temp_dir.path(), config, factory);
        engine.cold_start().expect("Failed to cold start");
        Self {
            engine,
            _temp_dir: temp_dir,
        }
    }

    /// Returns the instance directory.
    pub fn path(&self) -> &Path {
        self._temp_dir.path()
    }

    /// Shuts down cleanly and warm starts again.
    pub fn restart(&self) {
        self.engine.shut_down().expect("Failed to shut down");
        self.engine.warm_start().expect("Failed to warm start");
    }

    /// Halts as a crash would and warm starts again.
    pub fn crash_restart(&self) {
        self.engine.halt();
        self.engine.warm_start().expect("Failed to warm start");
    }

    /// Commits `name` = `value` as an Integer in its own transaction.
    pub fn put_integer(&self, name: &str, value: i64) {
        self.try_put(name, Some(Value::Integer(value)))
            .expect("Failed to put");
    }

    /// Commits a deletion of the Integer `name`.
    pub fn delete_integer(&self, name: &str) {
        self.try_put(name, None).expect("Failed to delete");
    }

    /// Commits a single Integer write, returning the engine's error.
    pub fn try_put(&self, name: &str, value: Option<Value>) -> CoreResult<()> {
        let mut session = self.engine.open_session()?;
        session.write(name, Value::INTEGER, value)?;
        session.commit()
    }

    /// Reads the Integer `name` in its own transaction.
    pub fn get_integer(&self, name: &str) -> Option<i64> {
        let mut session = self.engine.open_session().expect("Failed to open session");
        let value = session
            .read(name, Value::INTEGER)
            .expect("Failed to read")
            .and_then(|v| v.as_integer());
        session.commit().expect("Failed to commit read");
        value
    }

    /// Committed Integer names, sorted.
    pub fn integer_names(&self) -> Vec<String> {
        self.engine
            .keys()
            .expect("Failed to list keys")
            .remove(&TypeName::from(Value::INTEGER))
            .unwrap_or_default()
    }
}

impl std::ops::Deref for TestEngine {
    type Target = Engine;

    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_round_trip() {
        let engine = TestEngine::cold();
        engine.put_integer("a", 1);
        assert_eq!(engine.get_integer("a"), Some(1));
        assert_eq!(engine.integer_names(), vec!["a".to_string()]);
    }

    #[test]
    fn test_engine_restart_keeps_data() {
        let engine = TestEngine::cold();
        engine.put_integer("a", 1);
        engine.restart();
        assert_eq!(engine.get_integer("a"), Some(1));
        engine.crash_restart();
        assert_eq!(engine.get_integer("a"), Some(1));
    }

    #[test]
    fn tracing_init_is_repeatable() {
        init_tracing();
        init_tracing();
    }
}
