//! # Persist Testkit
//!
//! Test utilities for Persist.
//!
//! This crate provides:
//! - Temporary engines that clean up after themselves
//! - Storage factories that fail on demand, for crash and I/O fault tests
//! - Concurrent workload drivers
//! - The cross-module scenario suites
//!
//! ## Usage
//!
//! ```rust,ignore
//! use persist_testkit::prelude::*;
//!
//! #[test]
//! fn survives_restart() {
//!     let engine = TestEngine::cold();
//!     engine.put_integer("x", 1);
//!     engine.restart();
//!     assert_eq!(engine.get_integer("x"), Some(1));
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod integration;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::stress::*;
}

pub use crash::*;
pub use fixtures::*;
pub use stress::*;
