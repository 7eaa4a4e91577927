//! Transactions, ownership arbitration and deadlock resolution.
//!
//! Isolation comes from exclusive ownership: a transaction owns every
//! entity it has touched until it commits or rolls back, and others wait.
//!
//! - **Atomicity**: a commit is durable only once its end marker is logged
//! - **Isolation**: whole-entity ownership, no lost updates
//! - **Deadlocks**: a wait that closes a cycle kills one transaction of
//!   the blocked pair; the rest proceed
//! - **Durability**: the log is synced every `sync_frequency` commits

mod graph;
mod killer;
mod manager;
mod state;
mod txn;

pub use graph::WaitForGraph;
pub use manager::TransactionManager;
pub use state::TransactionState;
pub use txn::Transaction;

#[cfg(test)]
pub(crate) mod testing {
    use crate::checkpoint::{CheckpointWriter, Compactor};
    use crate::config::Config;
    use crate::dir::InstanceDir;
    use crate::entity::Strategies;
    use crate::store::Library;
    use crate::transaction::TransactionManager;
    use crate::types::{EntityKey, SequenceNumber};
    use crate::wal::TransactionLog;
    use persist_codec::Value;
    use persist_storage::FileFactory;
    use std::path::Path;
    use std::sync::atomic::{AtomicU64, AtomicUsize};
    use std::sync::Arc;
    use std::time::Duration;

    pub(crate) fn key(name: &str) -> EntityKey {
        EntityKey::new(Value::INTEGER, name)
    }

    /// A manager over an empty directory, with short waits.
    pub(crate) fn running_manager(path: &Path) -> Arc<TransactionManager> {
        let config = Config::default()
            .retry_interval(Duration::from_millis(2))
            .block_timeout(Duration::from_millis(20))
            .quiesce_timeout(Duration::from_millis(20));
        let dir = Arc::new(InstanceDir::open(path, true).unwrap());
        let factory = Arc::new(FileFactory);
        let writer = CheckpointWriter::new(
            Arc::clone(&dir),
            factory.clone(),
            1 << 20,
            SequenceNumber::new(1),
        );
        let compactor = Arc::new(
            Compactor::start(Arc::clone(&dir), writer, Vec::new(), Duration::from_millis(10))
                .unwrap(),
        );
        let log = TransactionLog::open(
            Arc::clone(&dir),
            factory,
            Arc::clone(&compactor),
            SequenceNumber::new(1),
            1 << 20,
            Arc::new(AtomicUsize::new(1)),
        )
        .unwrap();
        TransactionManager::start(
            dir,
            config,
            Arc::new(Library::new(Strategies::default())),
            log,
            compactor,
            Arc::new(AtomicU64::new(1)),
        )
        .unwrap()
    }
}
