//! # Persist Core
//!
//! Embedded transactional object store.
//!
//! This crate provides:
//! - Entities owned by one transaction at a time, with deadlock detection
//! - Two-phase commit through a write-ahead transaction log
//! - Background compaction of the log into checkpoint files
//! - Recovery from snapshot, checkpoints and log on warm start
//! - Sessions as the client-facing API
//!
//! ## Invariants
//!
//! - A transaction's writes become visible to others all at once, at commit
//! - An entity is owned by at most one live transaction
//! - A transaction without its end record in the log never survives recovery
//! - Only one engine at a time runs over an instance directory

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod checkpoint;
mod checksum;
mod config;
pub mod dir;
mod engine;
pub mod entity;
mod error;
mod session;
pub mod store;
pub mod transaction;
mod types;
pub mod wal;

pub use config::Config;
pub use engine::Engine;
pub use entity::{Entity, PrepareOutcome, Strategies, Strategy};
pub use error::{CoreError, CoreResult};
pub use session::Session;
pub use store::Library;
pub use transaction::{Transaction, TransactionManager, TransactionState};
pub use types::{EntityKey, SequenceNumber, TransactionId, TypeName};

pub use persist_codec::Value;
