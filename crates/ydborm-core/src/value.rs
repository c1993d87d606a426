//! Dynamic column values.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A dynamically-typed column value.
///
/// Used for parameter binding, row decoding and primary-key identity. There
/// are no floating point variants, so values are `Eq + Hash` and can key the
/// identity map directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    /// Explicit absence marker for nullable columns
    Null,

    /// Boolean value
    Bool(bool),

    /// 8-bit signed integer
    Int8(i8),

    /// 16-bit signed integer
    Int16(i16),

    /// 32-bit signed integer
    Int32(i32),

    /// 64-bit signed integer
    Int64(i64),

    /// 8-bit unsigned integer
    Uint8(u8),

    /// 16-bit unsigned integer
    Uint16(u16),

    /// 32-bit unsigned integer
    Uint32(u32),

    /// 64-bit unsigned integer
    Uint64(u64),

    /// UTF-8 text
    Text(String),

    /// Fixed-point decimal (stored as its canonical string form)
    Decimal(String),

    /// Timestamp (microseconds since epoch)
    Timestamp(i64),

    /// List of values, bound as a single `List<T>` parameter
    List(Vec<Value>),
}

impl Value {
    /// Check if this value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get the type name of this value.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Bool(_) => "Bool",
            Value::Int8(_) => "Int8",
            Value::Int16(_) => "Int16",
            Value::Int32(_) => "Int32",
            Value::Int64(_) => "Int64",
            Value::Uint8(_) => "Uint8",
            Value::Uint16(_) => "Uint16",
            Value::Uint32(_) => "Uint32",
            Value::Uint64(_) => "Uint64",
            Value::Text(_) => "Utf8",
            Value::Decimal(_) => "Decimal",
            Value::Timestamp(_) => "Timestamp",
            Value::List(_) => "List",
        }
    }

    /// Whether this value is one of the integer variants.
    pub const fn is_integer(&self) -> bool {
        matches!(
            self,
            Value::Int8(_)
                | Value::Int16(_)
                | Value::Int32(_)
                | Value::Int64(_)
                | Value::Uint8(_)
                | Value::Uint16(_)
                | Value::Uint32(_)
                | Value::Uint64(_)
        )
    }

    /// Try to convert this value to a bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Widen any integer variant to `i128`.
    ///
    /// Every fixed-width integer fits, which makes cross-width comparison and
    /// range-checked narrowing straightforward.
    pub fn as_i128(&self) -> Option<i128> {
        match self {
            Value::Int8(v) => Some(i128::from(*v)),
            Value::Int16(v) => Some(i128::from(*v)),
            Value::Int32(v) => Some(i128::from(*v)),
            Value::Int64(v) => Some(i128::from(*v)),
            Value::Uint8(v) => Some(i128::from(*v)),
            Value::Uint16(v) => Some(i128::from(*v)),
            Value::Uint32(v) => Some(i128::from(*v)),
            Value::Uint64(v) => Some(i128::from(*v)),
            _ => None,
        }
    }

    /// Try to get an `i64`, narrowing any in-range integer.
    pub fn as_i64(&self) -> Option<i64> {
        self.as_i128().and_then(|v| i64::try_from(v).ok())
    }

    /// Try to get a string reference (text or decimal).
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Decimal(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get the elements of a list value.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Compare two values of compatible kinds.
    ///
    /// Integers compare across widths, decimals compare numerically.
    /// Returns `None` for NULL or for incompatible kinds.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        if let (Some(a), Some(b)) = (self.as_i128(), other.as_i128()) {
            return Some(a.cmp(&b));
        }
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (Value::Decimal(a), Value::Decimal(b)) => {
                let a: f64 = a.parse().ok()?;
                let b: f64 = b.parse().ok()?;
                a.partial_cmp(&b)
            }
            _ => None,
        }
    }

    /// Equality that treats integers of different widths as equal.
    pub fn loosely_equals(&self, other: &Value) -> bool {
        match self.compare(other) {
            Some(ordering) => ordering == Ordering::Equal,
            None => self == other,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int8(v) => write!(f, "{v}"),
            Value::Int16(v) => write!(f, "{v}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Uint8(v) => write!(f, "{v}"),
            Value::Uint16(v) => write!(f, "{v}"),
            Value::Uint32(v) => write!(f, "{v}"),
            Value::Uint64(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "{v:?}"),
            Value::Decimal(v) => write!(f, "{v}"),
            Value::Timestamp(v) => write!(f, "ts:{v}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

// Conversion implementations

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i8> for Value {
    fn from(v: i8) -> Self {
        Value::Int8(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::Int16(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::Uint8(v)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::Uint16(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Uint32(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Uint64(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integers_compare_across_widths() {
        assert_eq!(
            Value::Int32(5).compare(&Value::Int64(5)),
            Some(Ordering::Equal)
        );
        assert_eq!(
            Value::Uint8(200).compare(&Value::Int8(-1)),
            Some(Ordering::Greater)
        );
        assert!(Value::Uint64(7).loosely_equals(&Value::Int16(7)));
    }

    #[test]
    fn test_incompatible_kinds_do_not_compare() {
        assert_eq!(Value::Text("1".into()).compare(&Value::Int64(1)), None);
        assert_eq!(Value::Null.compare(&Value::Null), None);
        assert!(Value::Null.loosely_equals(&Value::Null));
    }

    #[test]
    fn test_decimal_compares_numerically() {
        let a = Value::Decimal("10.50".into());
        let b = Value::Decimal("9.99".into());
        assert_eq!(a.compare(&b), Some(Ordering::Greater));
    }

    #[test]
    fn test_as_i64_narrows_in_range_only() {
        assert_eq!(Value::Uint64(42).as_i64(), Some(42));
        assert_eq!(Value::Uint64(u64::MAX).as_i64(), None);
        assert_eq!(Value::Text("42".into()).as_i64(), None);
    }

    #[test]
    fn test_option_and_vec_conversions() {
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some("a")), Value::Text("a".into()));
        assert_eq!(
            Value::from(vec![1_i64, 2]),
            Value::List(vec![Value::Int64(1), Value::Int64(2)])
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Text("a".into()).to_string(), "\"a\"");
        assert_eq!(
            Value::List(vec![Value::Int32(1), Value::Null]).to_string(),
            "[1, NULL]"
        );
    }
}
