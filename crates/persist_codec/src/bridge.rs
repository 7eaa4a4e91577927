//! Serde bridge: caller types to and from [`Value`].

use crate::error::{CodecError, CodecResult};
use crate::freeze::RECORD_TAG;
use crate::value::Value;
use ciborium::value::{Integer, Value as Raw};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Converts any serde-serializable type into a [`Value`].
///
/// Structs become maps keyed by field name. Floats are refused, as they
/// are everywhere else in the codec.
///
/// # Errors
///
/// Fails if serialization fails or produces a float or an out-of-range integer.
pub fn to_value<T: Serialize + ?Sized>(value: &T) -> CodecResult<Value> {
    let raw = Raw::serialized(value).map_err(|e| CodecError::encoding_failed(e.to_string()))?;
    from_raw(raw)
}

/// Rebuilds a serde type from a [`Value`].
///
/// A [`Value::Record`] is unwrapped first, so a value written with a type
/// name reads back into the plain struct.
///
/// # Errors
///
/// Fails if the value's shape does not match `T`.
pub fn from_value<T: DeserializeOwned>(value: &Value) -> CodecResult<T> {
    let body = value.as_record_body().unwrap_or(value);
    to_raw(body)
        .deserialized()
        .map_err(|e| CodecError::decoding_failed(e.to_string()))
}

fn from_raw(raw: Raw) -> CodecResult<Value> {
    Ok(match raw {
        Raw::Null => Value::Null,
        Raw::Bool(b) => Value::Bool(b),
        Raw::Integer(n) => {
            Value::Integer(i64::try_from(i128::from(n)).map_err(|_| CodecError::IntegerOverflow)?)
        }
        Raw::Float(_) => return Err(CodecError::FloatForbidden),
        Raw::Bytes(b) => Value::Bytes(b),
        Raw::Text(s) => Value::Text(s),
        Raw::Array(items) => Value::Array(items.into_iter().map(from_raw).collect::<CodecResult<_>>()?),
        Raw::Map(pairs) => Value::map(
            pairs
                .into_iter()
                .map(|(k, v)| Ok((from_raw(k)?, from_raw(v)?)))
                .collect::<CodecResult<_>>()?,
        ),
        Raw::Tag(RECORD_TAG, inner) => match *inner {
            Raw::Array(mut pair) if pair.len() == 2 => {
                let body = from_raw(pair.pop().unwrap_or(Raw::Null))?;
                match pair.pop() {
                    Some(Raw::Text(type_name)) if !type_name.is_empty() => Value::record(type_name, body),
                    _ => return Err(CodecError::invalid_structure("record type name must be text")),
                }
            }
            _ => return Err(CodecError::invalid_structure("record must be a pair")),
        },
        Raw::Tag(_, inner) => from_raw(*inner)?,
        other => return Err(CodecError::unsupported_type(format!("{other:?}"))),
    })
}

fn to_raw(value: &Value) -> Raw {
    match value {
        Value::Null => Raw::Null,
        Value::Bool(b) => Raw::Bool(*b),
        Value::Integer(n) => Raw::Integer(Integer::from(*n)),
        Value::Bytes(b) => Raw::Bytes(b.clone()),
        Value::Text(s) => Raw::Text(s.clone()),
        Value::Array(items) => Raw::Array(items.iter().map(to_raw).collect()),
        Value::Map(pairs) => Raw::Map(pairs.iter().map(|(k, v)| (to_raw(k), to_raw(v))).collect()),
        Value::Record { type_name, body } => Raw::Tag(
            RECORD_TAG,
            Box::new(Raw::Array(vec![Raw::Text(type_name.clone()), to_raw(body)])),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Account {
        owner: String,
        balance: i64,
        tags: Vec<String>,
        frozen: Option<bool>,
    }

    fn sample() -> Account {
        Account {
            owner: "ada".into(),
            balance: -40,
            tags: vec!["savings".into()],
            frozen: None,
        }
    }

    #[test]
    fn struct_becomes_sorted_map() {
        let value = to_value(&sample()).unwrap();
        assert_eq!(value.get("balance"), Some(&Value::Integer(-40)));
        assert_eq!(value.get("frozen"), Some(&Value::Null));
        let first_key = value.as_map().unwrap()[0].0.as_text().unwrap();
        assert_eq!(first_key, "tags");
    }

    #[test]
    fn struct_survives_bridge_and_freeze() {
        let value = to_value(&sample()).unwrap();
        let thawed = crate::thaw(&crate::freeze(&value).unwrap()).unwrap();
        let back: Account = from_value(&thawed).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn record_wrapper_is_transparent_on_read() {
        let value = Value::record("Account", to_value(&sample()).unwrap());
        let back: Account = from_value(&value).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn floats_are_refused() {
        assert_eq!(to_value(&1.5f64), Err(CodecError::FloatForbidden));
    }

    #[test]
    fn shape_mismatch_is_a_decoding_error() {
        let result: CodecResult<Account> = from_value(&Value::Integer(3));
        assert!(matches!(result, Err(CodecError::DecodingFailed { .. })));
    }
}
