//! # Persist Storage
//!
//! Byte-store backends underneath the Persist engine.
//!
//! Backends are opaque: they append, read back, flush and sync bytes. They
//! know nothing about log records or checkpoint layouts; `persist_core`
//! owns every file format.
//!
//! - [`FileBackend`] - an OS file, used for log segments and checkpoints
//! - [`InMemoryBackend`] - a growable buffer for tests
//! - [`StorageFactory`] - how the engine opens a backend for a path
//!
//! ```rust
//! use persist_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"update").unwrap();
//! assert_eq!(backend.read_at(offset, 6).unwrap(), b"update");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod factory;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use factory::{FileFactory, StorageFactory};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
