use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use aggspill_error::{DbError, Result};

use super::datatype::DataType;

/// A single owned value.
///
/// Equality and hashing are total so values can be used as part of a group
/// key. Floats compare by bit pattern after normalizing `-0.0` to `0.0` and
/// all NaNs to a single canonical NaN.
#[derive(Debug, Clone)]
pub enum ScalarValue {
    Null,
    Boolean(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
    Binary(Vec<u8>),
}

impl ScalarValue {
    pub fn datatype(&self) -> DataType {
        match self {
            Self::Null => DataType::Null,
            Self::Boolean(_) => DataType::Boolean,
            Self::Int64(_) => DataType::Int64,
            Self::Float64(_) => DataType::Float64,
            Self::Utf8(_) => DataType::Utf8,
            Self::Binary(_) => DataType::Binary,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Approximate number of bytes this value occupies, including heap
    /// allocations.
    pub fn size_bytes(&self) -> usize {
        let heap = match self {
            Self::Utf8(s) => s.capacity(),
            Self::Binary(b) => b.capacity(),
            _ => 0,
        };
        std::mem::size_of::<Self>() + heap
    }

    pub fn try_as_i64(&self) -> Result<i64> {
        match self {
            Self::Int64(v) => Ok(*v),
            other => Err(DbError::new("Expected Int64 value").with_field("got", other.datatype())),
        }
    }

    pub fn try_as_usize(&self) -> Result<usize> {
        let v = self.try_as_i64()?;
        usize::try_from(v)
            .map_err(|_| DbError::new("Value cannot be negative").with_field("value", v))
    }

    pub fn try_as_str(&self) -> Result<&str> {
        match self {
            Self::Utf8(v) => Ok(v),
            other => Err(DbError::new("Expected Utf8 value").with_field("got", other.datatype())),
        }
    }

    pub fn try_as_f64(&self) -> Result<f64> {
        match self {
            Self::Float64(v) => Ok(*v),
            Self::Int64(v) => Ok(*v as f64),
            other => {
                Err(DbError::new("Expected numeric value").with_field("got", other.datatype()))
            }
        }
    }

    pub fn try_as_bool(&self) -> Result<bool> {
        match self {
            Self::Boolean(v) => Ok(*v),
            other => {
                Err(DbError::new("Expected Boolean value").with_field("got", other.datatype()))
            }
        }
    }

    /// Total ordering across all values.
    ///
    /// Nulls sort first, values of different types are ordered by type.
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Null, Self::Null) => Ordering::Equal,
            (Self::Boolean(a), Self::Boolean(b)) => a.cmp(b),
            (Self::Int64(a), Self::Int64(b)) => a.cmp(b),
            (Self::Float64(a), Self::Float64(b)) => normalize_f64(*a).total_cmp(&normalize_f64(*b)),
            (Self::Utf8(a), Self::Utf8(b)) => a.cmp(b),
            (Self::Binary(a), Self::Binary(b)) => a.cmp(b),
            (a, b) => a.datatype().tag().cmp(&b.datatype().tag()),
        }
    }
}

fn normalize_f64(v: f64) -> f64 {
    if v.is_nan() {
        f64::NAN
    } else if v == 0.0 {
        0.0
    } else {
        v
    }
}

impl PartialEq for ScalarValue {
    fn eq(&self, other: &Self) -> bool {
        self.total_cmp(other) == Ordering::Equal
    }
}

impl Eq for ScalarValue {}

impl PartialOrd for ScalarValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScalarValue {
    fn cmp(&self, other: &Self) -> Ordering {
        self.total_cmp(other)
    }
}

impl Hash for ScalarValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.datatype().tag().hash(state);
        match self {
            Self::Null => (),
            Self::Boolean(v) => v.hash(state),
            Self::Int64(v) => v.hash(state),
            Self::Float64(v) => normalize_f64(*v).to_bits().hash(state),
            Self::Utf8(v) => v.hash(state),
            Self::Binary(v) => v.hash(state),
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::Utf8(v) => write!(f, "{v}"),
            Self::Binary(v) => {
                write!(f, "\\x")?;
                for b in v {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    }
}

impl From<bool> for ScalarValue {
    fn from(value: bool) -> Self {
        ScalarValue::Boolean(value)
    }
}

impl From<i64> for ScalarValue {
    fn from(value: i64) -> Self {
        ScalarValue::Int64(value)
    }
}

impl From<f64> for ScalarValue {
    fn from(value: f64) -> Self {
        ScalarValue::Float64(value)
    }
}

impl From<&str> for ScalarValue {
    fn from(value: &str) -> Self {
        ScalarValue::Utf8(value.to_string())
    }
}

impl From<String> for ScalarValue {
    fn from(value: String) -> Self {
        ScalarValue::Utf8(value)
    }
}

impl From<Vec<u8>> for ScalarValue {
    fn from(value: Vec<u8>) -> Self {
        ScalarValue::Binary(value)
    }
}

impl<T: Into<ScalarValue>> From<Option<T>> for ScalarValue {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => value.into(),
            None => ScalarValue::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arrays::hash::HASH_RANDOM_STATE;

    #[test]
    fn float_zero_and_nan_normalized() {
        assert_eq!(ScalarValue::Float64(0.0), ScalarValue::Float64(-0.0));
        assert_eq!(
            HASH_RANDOM_STATE.hash_one(ScalarValue::Float64(0.0)),
            HASH_RANDOM_STATE.hash_one(ScalarValue::Float64(-0.0)),
        );
        assert_eq!(ScalarValue::Float64(f64::NAN), ScalarValue::Float64(-f64::NAN));
    }

    #[test]
    fn null_sorts_first() {
        let mut vals = vec![
            ScalarValue::Int64(3),
            ScalarValue::Null,
            ScalarValue::Int64(-1),
        ];
        vals.sort();
        assert_eq!(
            vec![ScalarValue::Null, ScalarValue::Int64(-1), ScalarValue::Int64(3)],
            vals
        );
    }

    #[test]
    fn different_types_not_equal() {
        assert_ne!(ScalarValue::Int64(1), ScalarValue::Float64(1.0));
    }
}
