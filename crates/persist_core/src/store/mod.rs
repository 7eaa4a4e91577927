//! The object store.
//!
//! Holds every entity in memory, keyed by type and name. A consolidated
//! snapshot is written at shutdown and read back at warm start.

mod library;
pub mod snapshot;

pub use library::Library;
