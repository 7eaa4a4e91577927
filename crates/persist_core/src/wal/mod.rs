//! Write-ahead log.
//!
//! Every commit is written here before it is acknowledged. The log is a
//! series of segment files `log-N.wal`; the compactor folds sealed
//! segments into checkpoint files and deletes them.
//!
//! ## Record Format
//!
//! ```text
//! | magic "PWAL" (4) | version (2) | type (1) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! ## Recovery Policy
//!
//! A truncated header or payload at the end of a segment is a write cut
//! short by a crash and ends that segment cleanly. A CRC mismatch, bad
//! magic, unknown type or future version is corruption and fails the
//! start without applying anything.
//!
//! ## Invariants
//!
//! - Segments are **append-only**
//! - Updates take effect only once their `EndOfTransaction` is logged
//! - A transaction's records all live in one segment
//! - Replay is **idempotent**

mod iterator;
mod record;
mod recovery;
mod writer;

pub use iterator::LogRecordIterator;
pub use record::{LogRecord, LogRecordType, LOG_MAGIC, LOG_VERSION};
pub use recovery::{recover, RecoverySummary};
pub use writer::{CommitScope, TransactionLog};
