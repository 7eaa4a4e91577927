//! Checkpoint files.
//!
//! Sealed log segments are folded, newest value per entity, into
//! append-only checkpoint files so the log does not grow without bound.
//!
//! ## Record Format
//!
//! ```text
//! | record_len (4) | flags (1) | type_len (2) | type | name_len (4) | name | payload | crc32 (4) |
//! ```
//!
//! A tombstone carries no payload.
//!
//! ## Recovery Order
//!
//! Checkpoint files replay oldest first, before any remaining log segment.

mod compaction;
mod compactor;
mod record;
mod writer;

pub use compaction::{compact, CompactionStats};
pub use compactor::{Batch, Compactor};
pub use record::{read_records, CheckpointRecord, RecordFlags};
pub use writer::{replay_checkpoints, CheckpointWriter};
