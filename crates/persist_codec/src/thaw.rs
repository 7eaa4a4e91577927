//! Thawing canonical CBOR back into values.

use crate::error::{CodecError, CodecResult};
use crate::freeze::RECORD_TAG;
use crate::value::Value;
use std::cmp::Ordering;

/// Largest element count accepted for arrays and maps.
const MAX_CONTAINER_ELEMENTS: u64 = 16 * 1024 * 1024;

/// Largest byte or text length accepted.
const MAX_BYTES_LENGTH: u64 = 256 * 1024 * 1024;

/// Deepest container nesting accepted.
const MAX_DEPTH: usize = 512;

/// Thaws a frozen value.
///
/// Only canonical input is accepted, so `freeze(thaw(b)) == b` holds for
/// anything this returns `Ok` for.
///
/// # Errors
///
/// Fails on truncated input, trailing bytes, floats, indefinite lengths,
/// non-shortest heads, unsorted or duplicate map keys and invalid UTF-8.
pub fn thaw(bytes: &[u8]) -> CodecResult<Value> {
    let mut thawer = Thawer::new(bytes);
    let value = thawer.next_value()?;
    if !thawer.is_empty() {
        return Err(CodecError::TrailingBytes {
            count: thawer.remaining().len(),
        });
    }
    Ok(value)
}

/// Incremental canonical decoder over a byte slice.
#[derive(Debug)]
pub struct Thawer<'a> {
    data: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Thawer<'a> {
    /// Creates a decoder positioned at the start of `data`.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            depth: 0,
        }
    }

    /// Checks if every byte has been consumed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Returns the unconsumed bytes.
    #[must_use]
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    /// Decodes the next value.
    ///
    /// # Errors
    ///
    /// See [`thaw`].
    pub fn next_value(&mut self) -> CodecResult<Value> {
        let initial = self.byte()?;
        let major = initial >> 5;
        let info = initial & 0x1f;

        match major {
            0 => {
                let n = self.argument(info)?;
                i64::try_from(n)
                    .map(Value::Integer)
                    .map_err(|_| CodecError::IntegerOverflow)
            }
            1 => {
                let n = self.argument(info)?;
                let n = i64::try_from(n).map_err(|_| CodecError::IntegerOverflow)?;
                Ok(Value::Integer(-1 - n))
            }
            2 => Ok(Value::Bytes(self.string_body(info)?.to_vec())),
            3 => {
                let raw = self.string_body(info)?;
                let text = std::str::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8)?;
                Ok(Value::Text(text.to_string()))
            }
            4 => {
                let len = self.container_len(info)?;
                self.nested(|t| {
                    let mut items = Vec::with_capacity(len.min(1024));
                    for _ in 0..len {
                        items.push(t.next_value()?);
                    }
                    Ok(Value::Array(items))
                })
            }
            5 => {
                let len = self.container_len(info)?;
                self.nested(|t| t.map_body(len))
            }
            6 => {
                let tag = self.argument(info)?;
                if tag == RECORD_TAG {
                    self.nested(Self::record_body)
                } else {
                    self.nested(Self::next_value)
                }
            }
            _ => self.simple(info),
        }
    }

    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> CodecResult<T>) -> CodecResult<T> {
        if self.depth >= MAX_DEPTH {
            return Err(CodecError::NestingTooDeep {
                max_depth: MAX_DEPTH,
            });
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn map_body(&mut self, len: usize) -> CodecResult<Value> {
        let mut pairs = Vec::with_capacity(len.min(1024));
        let mut previous: Option<&'a [u8]> = None;

        for _ in 0..len {
            let data = self.data;
            let start = self.pos;
            let key = self.next_value()?;
            let key_bytes = &data[start..self.pos];

            if let Some(prev) = previous {
                let order = prev.len().cmp(&key_bytes.len()).then_with(|| prev.cmp(key_bytes));
                if order != Ordering::Less {
                    return Err(CodecError::invalid_structure(
                        "map keys not in canonical order or duplicated",
                    ));
                }
            }
            previous = Some(key_bytes);

            let value = self.next_value()?;
            pairs.push((key, value));
        }
        Ok(Value::Map(pairs))
    }

    fn record_body(&mut self) -> CodecResult<Value> {
        if self.byte()? != 0x82 {
            return Err(CodecError::invalid_structure(
                "record must be a [type_name, body] pair",
            ));
        }
        let type_name = match self.next_value()? {
            Value::Text(name) if !name.is_empty() => name,
            _ => {
                return Err(CodecError::invalid_structure(
                    "record type name must be non-empty text",
                ))
            }
        };
        let body = self.next_value()?;
        Ok(Value::Record {
            type_name,
            body: Box::new(body),
        })
    }

    fn simple(&mut self, info: u8) -> CodecResult<Value> {
        match info {
            20 => Ok(Value::Bool(false)),
            21 => Ok(Value::Bool(true)),
            22 => Ok(Value::Null),
            25..=27 => Err(CodecError::FloatForbidden),
            31 => Err(CodecError::invalid_structure("break outside indefinite item")),
            other => Err(CodecError::unsupported_type(format!("simple value {other}"))),
        }
    }

    fn string_body(&mut self, info: u8) -> CodecResult<&'a [u8]> {
        let len = self.argument(info)?;
        if len > MAX_BYTES_LENGTH {
            return Err(CodecError::SizeLimitExceeded {
                claimed: len,
                max_allowed: MAX_BYTES_LENGTH,
            });
        }
        self.take(len as usize)
    }

    fn container_len(&mut self, info: u8) -> CodecResult<usize> {
        let len = self.argument(info)?;
        if len > MAX_CONTAINER_ELEMENTS {
            return Err(CodecError::SizeLimitExceeded {
                claimed: len,
                max_allowed: MAX_CONTAINER_ELEMENTS,
            });
        }
        Ok(len as usize)
    }

    fn argument(&mut self, info: u8) -> CodecResult<u64> {
        let (value, floor) = match info {
            0..=23 => return Ok(u64::from(info)),
            24 => (u64::from(self.byte()?), 24),
            25 => {
                let b = self.take(2)?;
                (u64::from(u16::from_be_bytes([b[0], b[1]])), 1 << 8)
            }
            26 => {
                let b = self.take(4)?;
                (u64::from(u32::from_be_bytes([b[0], b[1], b[2], b[3]])), 1 << 16)
            }
            27 => {
                let b = self.take(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                (u64::from_be_bytes(raw), 1 << 32)
            }
            31 => return Err(CodecError::IndefiniteLengthForbidden),
            _ => return Err(CodecError::invalid_structure("reserved additional info")),
        };
        if value < floor {
            return Err(CodecError::invalid_structure(
                "head could be encoded in fewer bytes",
            ));
        }
        Ok(value)
    }

    fn byte(&mut self) -> CodecResult<u8> {
        let b = *self.data.get(self.pos).ok_or(CodecError::UnexpectedEof)?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(CodecError::UnexpectedEof)?;
        let slice = self.data.get(self.pos..end).ok_or(CodecError::UnexpectedEof)?;
        self.pos = end;
        Ok(slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers() {
        assert_eq!(thaw(&[0x17]).unwrap(), Value::Integer(23));
        assert_eq!(thaw(&[0x18, 200]).unwrap(), Value::Integer(200));
        assert_eq!(thaw(&[0x38, 99]).unwrap(), Value::Integer(-100));
    }

    #[test]
    fn integer_outside_i64_overflows() {
        let mut bytes = vec![0x1b];
        bytes.extend_from_slice(&u64::MAX.to_be_bytes());
        assert_eq!(thaw(&bytes), Err(CodecError::IntegerOverflow));
    }

    #[test]
    fn record_round_trips_from_bytes() {
        let v = thaw(&[0xd8, 27, 0x82, 0x61, b'T', 0x01]).unwrap();
        assert_eq!(v, Value::record("T", Value::Integer(1)));
    }

    #[test]
    fn foreign_tags_are_skipped() {
        // tag 1 (epoch time) around an integer
        assert_eq!(thaw(&[0xc1, 0x05]).unwrap(), Value::Integer(5));
    }

    #[test]
    fn rejects_floats_and_indefinite_lengths() {
        assert_eq!(thaw(&[0xf9, 0, 0]), Err(CodecError::FloatForbidden));
        assert_eq!(thaw(&[0x9f, 0x01, 0xff]), Err(CodecError::IndefiniteLengthForbidden));
    }

    #[test]
    fn rejects_non_canonical_input() {
        assert!(matches!(thaw(&[0x18, 5]), Err(CodecError::InvalidStructure { .. })));
        assert!(matches!(
            thaw(&[0xa2, 0x61, b'b', 0x01, 0x61, b'a', 0x02]),
            Err(CodecError::InvalidStructure { .. })
        ));
        assert!(matches!(
            thaw(&[0xa2, 0x61, b'a', 0x01, 0x61, b'a', 0x02]),
            Err(CodecError::InvalidStructure { .. })
        ));
    }

    #[test]
    fn rejects_truncation_and_trailing_bytes() {
        assert_eq!(thaw(&[]), Err(CodecError::UnexpectedEof));
        assert_eq!(thaw(&[0x43, 1, 2]), Err(CodecError::UnexpectedEof));
        assert_eq!(thaw(&[0x01, 0x02]), Err(CodecError::TrailingBytes { count: 1 }));
    }

    #[test]
    fn rejects_bad_utf8_and_empty_record_names() {
        assert_eq!(thaw(&[0x62, 0xff, 0xfe]), Err(CodecError::InvalidUtf8));
        assert!(matches!(
            thaw(&[0xd8, 27, 0x82, 0x60, 0x01]),
            Err(CodecError::InvalidStructure { .. })
        ));
    }

    #[test]
    fn deep_nesting_is_bounded() {
        let bytes = vec![0x81; MAX_DEPTH + 1];
        assert_eq!(
            thaw(&bytes),
            Err(CodecError::NestingTooDeep { max_depth: MAX_DEPTH })
        );
    }
}
