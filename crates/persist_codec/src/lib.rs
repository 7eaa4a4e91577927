//! # Persist Codec
//!
//! Freezes entity values into bytes for the log, checkpoints and snapshot,
//! and thaws them back.
//!
//! The byte form is canonical CBOR:
//! - integers and lengths use the shortest head
//! - map keys are sorted by their encoding, no duplicates
//! - no floats, no indefinite lengths
//! - caller-defined types are tag 27 over `[type_name, body]`
//!
//! ```
//! use persist_codec::{freeze, thaw, Value};
//!
//! let value = Value::record("Counter", Value::Integer(42));
//! let bytes = freeze(&value).unwrap();
//! assert_eq!(thaw(&bytes).unwrap(), value);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod bridge;
mod error;
mod freeze;
mod thaw;
mod value;

pub use bridge::{from_value, to_value};
pub use error::{CodecError, CodecResult};
pub use freeze::{freeze, Freezer, RECORD_TAG};
pub use thaw::{thaw, Thawer};
pub use value::Value;
