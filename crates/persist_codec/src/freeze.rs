//! Freezing values into canonical CBOR.

use crate::error::{CodecError, CodecResult};
use crate::value::Value;

/// CBOR tag wrapping `[type_name, body]` for [`Value::Record`].
pub const RECORD_TAG: u64 = 27;

/// Freezes a value into its canonical byte form.
///
/// The output is deterministic: integers and lengths use the shortest head,
/// every length is definite and map entries are ordered by their encoded
/// keys (shorter first, then bytewise). Equal values always freeze to equal
/// bytes.
///
/// # Errors
///
/// Returns [`CodecError::EncodingFailed`] for a record with an empty type
/// name, which could never be matched against a declared entity type.
pub fn freeze(value: &Value) -> CodecResult<Vec<u8>> {
    check_records(value)?;
    let mut freezer = Freezer::default();
    freezer.write(value);
    Ok(freezer.into_bytes())
}

/// Encodes a map key for ordering purposes. Never fails.
pub(crate) fn encoded_key(value: &Value) -> Vec<u8> {
    let mut freezer = Freezer::default();
    freezer.write(value);
    freezer.into_bytes()
}

fn check_records(value: &Value) -> CodecResult<()> {
    match value {
        Value::Record { type_name, body } => {
            if type_name.is_empty() {
                return Err(CodecError::encoding_failed("record type name is empty"));
            }
            check_records(body)
        }
        Value::Array(items) => items.iter().try_for_each(check_records),
        Value::Map(pairs) => pairs.iter().try_for_each(|(k, v)| {
            check_records(k)?;
            check_records(v)
        }),
        _ => Ok(()),
    }
}

/// Incremental canonical encoder.
#[derive(Debug, Default)]
pub struct Freezer {
    out: Vec<u8>,
}

impl Freezer {
    /// Creates an encoder with room for `capacity` bytes.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            out: Vec::with_capacity(capacity),
        }
    }

    /// Appends the encoding of `value`.
    pub fn write(&mut self, value: &Value) {
        match value {
            Value::Null => self.out.push(0xf6),
            Value::Bool(false) => self.out.push(0xf4),
            Value::Bool(true) => self.out.push(0xf5),
            Value::Integer(n) if *n >= 0 => self.head(0, n.unsigned_abs()),
            // -1 - n fits in u64 for every negative i64
            Value::Integer(n) => self.head(1, (-1 - *n).unsigned_abs()),
            Value::Bytes(b) => {
                self.head(2, b.len() as u64);
                self.out.extend_from_slice(b);
            }
            Value::Text(s) => {
                self.head(3, s.len() as u64);
                self.out.extend_from_slice(s.as_bytes());
            }
            Value::Array(items) => {
                self.head(4, items.len() as u64);
                for item in items {
                    self.write(item);
                }
            }
            Value::Map(pairs) => self.write_map(pairs),
            Value::Record { type_name, body } => {
                self.head(6, RECORD_TAG);
                self.head(4, 2);
                self.head(3, type_name.len() as u64);
                self.out.extend_from_slice(type_name.as_bytes());
                self.write(body);
            }
        }
    }

    /// Returns the bytes written so far.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.out
    }

    /// Consumes the encoder, returning its output.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.out
    }

    fn write_map(&mut self, pairs: &[(Value, Value)]) {
        let mut entries: Vec<(Vec<u8>, &Value)> = pairs
            .iter()
            .map(|(k, v)| (encoded_key(k), v))
            .collect();
        entries.sort_by(|a, b| a.0.len().cmp(&b.0.len()).then_with(|| a.0.cmp(&b.0)));

        self.head(5, entries.len() as u64);
        for (key, value) in entries {
            self.out.extend_from_slice(&key);
            self.write(value);
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn head(&mut self, major: u8, arg: u64) {
        let mt = major << 5;
        if arg < 24 {
            self.out.push(mt | arg as u8);
        } else if arg <= u64::from(u8::MAX) {
            self.out.push(mt | 24);
            self.out.push(arg as u8);
        } else if arg <= u64::from(u16::MAX) {
            self.out.push(mt | 25);
            self.out.extend_from_slice(&(arg as u16).to_be_bytes());
        } else if arg <= u64::from(u32::MAX) {
            self.out.push(mt | 26);
            self.out.extend_from_slice(&(arg as u32).to_be_bytes());
        } else {
            self.out.push(mt | 27);
            self.out.extend_from_slice(&arg.to_be_bytes());
        }
    }
}
