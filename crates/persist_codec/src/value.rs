//! The dynamic value model stored in entities.

use crate::freeze::encoded_key;
use std::cmp::Ordering;
use std::fmt;

/// A value held by a persistent entity.
///
/// Values are opaque to the engine apart from their [`type_name`](Value::type_name),
/// which is checked against the type an entity was declared with. Callers
/// model their own types with [`Value::Record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed 64-bit integer.
    Integer(i64),
    /// Byte string.
    Bytes(Vec<u8>),
    /// UTF-8 text.
    Text(String),
    /// Ordered sequence of values.
    Array(Vec<Value>),
    /// Key/value pairs, kept in canonical key order (see [`Value::map`]).
    Map(Vec<(Value, Value)>),
    /// A caller-defined type: a type name wrapping its body.
    Record {
        /// Name reported by [`Value::type_name`].
        type_name: String,
        /// The record's contents.
        body: Box<Value>,
    },
}

impl Value {
    /// Type name of [`Value::Null`].
    pub const NULL: &'static str = "Null";
    /// Type name of [`Value::Bool`].
    pub const BOOL: &'static str = "Bool";
    /// Type name of [`Value::Integer`].
    pub const INTEGER: &'static str = "Integer";
    /// Type name of [`Value::Bytes`].
    pub const BYTES: &'static str = "Bytes";
    /// Type name of [`Value::Text`].
    pub const TEXT: &'static str = "Text";
    /// Type name of [`Value::Array`].
    pub const ARRAY: &'static str = "Array";
    /// Type name of [`Value::Map`].
    pub const MAP: &'static str = "Map";

    /// Builds a map, sorting keys into canonical order.
    ///
    /// Maps that come out of [`thaw`](crate::thaw) are already in this order,
    /// so building maps through here keeps `==` stable across a round trip.
    pub fn map(mut pairs: Vec<(Value, Value)>) -> Self {
        pairs.sort_by(|a, b| a.0.cmp_canonical(&b.0));
        Value::Map(pairs)
    }

    /// Builds a record of the given type.
    pub fn record(type_name: impl Into<String>, body: Value) -> Self {
        Value::Record {
            type_name: type_name.into(),
            body: Box::new(body),
        }
    }

    /// Builds a text value.
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    /// Returns the name of this value's type.
    #[must_use]
    pub fn type_name(&self) -> &str {
        match self {
            Value::Null => Self::NULL,
            Value::Bool(_) => Self::BOOL,
            Value::Integer(_) => Self::INTEGER,
            Value::Bytes(_) => Self::BYTES,
            Value::Text(_) => Self::TEXT,
            Value::Array(_) => Self::ARRAY,
            Value::Map(_) => Self::MAP,
            Value::Record { type_name, .. } => type_name,
        }
    }

    /// Orders two values by their canonical encodings: shorter first, then bytewise.
    #[must_use]
    pub fn cmp_canonical(&self, other: &Self) -> Ordering {
        let a = encoded_key(self);
        let b = encoded_key(other);
        a.len().cmp(&b.len()).then_with(|| a.cmp(&b))
    }

    /// Checks if this value is null.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns the boolean, if this is one.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the integer, if this is one.
    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the bytes, if this is a byte string.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the text, if this is a text string.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the elements, if this is an array.
    #[must_use]
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Returns the pairs, if this is a map.
    #[must_use]
    pub fn as_map(&self) -> Option<&[(Value, Value)]> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Returns the body, if this is a record.
    #[must_use]
    pub fn as_record_body(&self) -> Option<&Value> {
        match self {
            Value::Record { body, .. } => Some(body),
            _ => None,
        }
    }

    /// Looks up a text key in a map, or in the map body of a record.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(pairs) => pairs
                .iter()
                .find(|(k, _)| k.as_text() == Some(key))
                .map(|(_, v)| v),
            Value::Record { body, .. } => body.get(key),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Integer(n) => write!(f, "{n}"),
            Value::Bytes(b) => write!(f, "h'{}'", b.iter().map(|x| format!("{x:02x}")).collect::<String>()),
            Value::Text(s) => write!(f, "{s:?}"),
            Value::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Map(pairs) => {
                f.write_str("{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
            Value::Record { type_name, body } => write!(f, "{type_name}({body})"),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_type_names() {
        assert_eq!(Value::Integer(1).type_name(), "Integer");
        assert_eq!(Value::text("a").type_name(), "Text");
        assert_eq!(Value::Null.type_name(), "Null");
        assert_eq!(Value::Array(vec![]).type_name(), "Array");
    }

    #[test]
    fn record_reports_its_own_type() {
        let account = Value::record("Account", Value::map(vec![(Value::text("balance"), 10.into())]));
        assert_eq!(account.type_name(), "Account");
        assert_eq!(account.get("balance"), Some(&Value::Integer(10)));
    }

    #[test]
    fn map_keys_sort_shortest_first() {
        let m = Value::map(vec![
            (Value::text("bb"), 2.into()),
            (Value::text("a"), 1.into()),
            (Value::text("c"), 3.into()),
        ]);
        let keys: Vec<_> = m.as_map().unwrap().iter().map(|(k, _)| k.as_text().unwrap()).collect();
        assert_eq!(keys, vec!["a", "c", "bb"]);
    }

    #[test]
    fn integers_order_by_encoding() {
        assert_eq!(Value::Integer(10).cmp_canonical(&Value::Integer(100)), Ordering::Less);
        assert_eq!(Value::Integer(1).cmp_canonical(&Value::Integer(-1)), Ordering::Less);
        assert_eq!(Value::Integer(7).cmp_canonical(&Value::Integer(7)), Ordering::Equal);
    }

    #[test]
    fn display_is_readable() {
        let v = Value::record("Pair", Value::Array(vec![1.into(), "x".into()]));
        assert_eq!(v.to_string(), "Pair([1, \"x\"])");
    }
}
