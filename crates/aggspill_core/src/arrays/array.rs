use aggspill_error::{DbError, Result};

use super::datatype::DataType;
use super::scalar::ScalarValue;

/// Typed values backing an array.
///
/// Values at invalid positions hold an arbitrary default and must not be
/// read.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    Null(usize),
    Boolean(Vec<bool>),
    Int64(Vec<i64>),
    Float64(Vec<f64>),
    Utf8(Vec<String>),
    Binary(Vec<Vec<u8>>),
}

impl ArrayData {
    pub fn len(&self) -> usize {
        match self {
            Self::Null(len) => *len,
            Self::Boolean(v) => v.len(),
            Self::Int64(v) => v.len(),
            Self::Float64(v) => v.len(),
            Self::Utf8(v) => v.len(),
            Self::Binary(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_capacity(datatype: DataType, cap: usize) -> Self {
        match datatype {
            DataType::Null => Self::Null(0),
            DataType::Boolean => Self::Boolean(Vec::with_capacity(cap)),
            DataType::Int64 => Self::Int64(Vec::with_capacity(cap)),
            DataType::Float64 => Self::Float64(Vec::with_capacity(cap)),
            DataType::Utf8 => Self::Utf8(Vec::with_capacity(cap)),
            DataType::Binary => Self::Binary(Vec::with_capacity(cap)),
        }
    }

    fn push_default(&mut self) {
        match self {
            Self::Null(len) => *len += 1,
            Self::Boolean(v) => v.push(false),
            Self::Int64(v) => v.push(0),
            Self::Float64(v) => v.push(0.0),
            Self::Utf8(v) => v.push(String::new()),
            Self::Binary(v) => v.push(Vec::new()),
        }
    }
}

/// A column of values with an optional validity mask.
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    pub(crate) datatype: DataType,
    /// Validity per row, None indicates all values are valid.
    pub(crate) validity: Option<Vec<bool>>,
    pub(crate) data: ArrayData,
}

impl Array {
    /// Create an array of `len` nulls of the given type.
    pub fn new_nulls(datatype: DataType, len: usize) -> Self {
        let mut data = ArrayData::with_capacity(datatype, len);
        for _ in 0..len {
            data.push_default();
        }
        let validity = match datatype {
            DataType::Null => None,
            _ => Some(vec![false; len]),
        };

        Array {
            datatype,
            validity,
            data,
        }
    }

    /// Try to create an array from an iterator of scalars.
    ///
    /// Every non-null scalar must match `datatype`.
    pub fn try_from_scalars<'a>(
        datatype: DataType,
        scalars: impl IntoIterator<Item = &'a ScalarValue>,
    ) -> Result<Self> {
        let scalars = scalars.into_iter();
        let mut builder = ArrayBuilder::with_capacity(datatype, scalars.size_hint().0);
        for scalar in scalars {
            builder.push(scalar)?;
        }
        Ok(builder.finish())
    }

    pub fn datatype(&self) -> DataType {
        self.datatype
    }

    pub fn logical_len(&self) -> usize {
        self.data.len()
    }

    pub fn is_valid(&self, idx: usize) -> bool {
        if matches!(self.data, ArrayData::Null(_)) {
            return false;
        }
        match &self.validity {
            Some(validity) => validity.get(idx).copied().unwrap_or(false),
            None => idx < self.logical_len(),
        }
    }

    /// Get the value at `idx`, erroring if out of bounds.
    pub fn logical_value(&self, idx: usize) -> Result<ScalarValue> {
        if idx >= self.logical_len() {
            return Err(DbError::new("Index out of bounds")
                .with_field("idx", idx)
                .with_field("len", self.logical_len()));
        }
        Ok(self.value_unchecked(idx))
    }

    /// Get the value at `idx`.
    ///
    /// Panics if `idx` is out of bounds.
    pub(crate) fn value_unchecked(&self, idx: usize) -> ScalarValue {
        if !self.is_valid(idx) {
            return ScalarValue::Null;
        }
        match &self.data {
            ArrayData::Null(_) => ScalarValue::Null,
            ArrayData::Boolean(v) => ScalarValue::Boolean(v[idx]),
            ArrayData::Int64(v) => ScalarValue::Int64(v[idx]),
            ArrayData::Float64(v) => ScalarValue::Float64(v[idx]),
            ArrayData::Utf8(v) => ScalarValue::Utf8(v[idx].clone()),
            ArrayData::Binary(v) => ScalarValue::Binary(v[idx].clone()),
        }
    }

    pub fn data(&self) -> &ArrayData {
        &self.data
    }

    pub fn slice(&self, offset: usize, count: usize) -> Self {
        let end = offset + count;
        let data = match &self.data {
            ArrayData::Null(_) => ArrayData::Null(count),
            ArrayData::Boolean(v) => ArrayData::Boolean(v[offset..end].to_vec()),
            ArrayData::Int64(v) => ArrayData::Int64(v[offset..end].to_vec()),
            ArrayData::Float64(v) => ArrayData::Float64(v[offset..end].to_vec()),
            ArrayData::Utf8(v) => ArrayData::Utf8(v[offset..end].to_vec()),
            ArrayData::Binary(v) => ArrayData::Binary(v[offset..end].to_vec()),
        };
        Array {
            datatype: self.datatype,
            validity: self.validity.as_ref().map(|v| v[offset..end].to_vec()),
            data,
        }
    }

    /// Create a new array containing the values at the given row indices.
    ///
    /// Panics if any index is out of bounds.
    pub fn select(&self, rows: &[usize]) -> Self {
        fn take<T: Clone>(v: &[T], rows: &[usize]) -> Vec<T> {
            rows.iter().map(|&idx| v[idx].clone()).collect()
        }

        let data = match &self.data {
            ArrayData::Null(_) => ArrayData::Null(rows.len()),
            ArrayData::Boolean(v) => ArrayData::Boolean(take(v, rows)),
            ArrayData::Int64(v) => ArrayData::Int64(take(v, rows)),
            ArrayData::Float64(v) => ArrayData::Float64(take(v, rows)),
            ArrayData::Utf8(v) => ArrayData::Utf8(take(v, rows)),
            ArrayData::Binary(v) => ArrayData::Binary(take(v, rows)),
        };
        Array {
            datatype: self.datatype,
            validity: self.validity.as_ref().map(|v| take(v, rows)),
            data,
        }
    }

    /// Approximate memory used by this array.
    pub fn size_bytes(&self) -> usize {
        let validity = self.validity.as_ref().map(|v| v.len()).unwrap_or(0);
        let data = match &self.data {
            ArrayData::Null(_) => 0,
            ArrayData::Boolean(v) => v.len(),
            ArrayData::Int64(v) => v.len() * 8,
            ArrayData::Float64(v) => v.len() * 8,
            ArrayData::Utf8(v) => v.iter().map(|s| 24 + s.len()).sum(),
            ArrayData::Binary(v) => v.iter().map(|b| 24 + b.len()).sum(),
        };
        validity + data
    }
}

/// Incrementally builds an array from scalars.
#[derive(Debug)]
pub struct ArrayBuilder {
    datatype: DataType,
    validity: Vec<bool>,
    all_valid: bool,
    data: ArrayData,
}

impl ArrayBuilder {
    pub fn with_capacity(datatype: DataType, cap: usize) -> Self {
        ArrayBuilder {
            datatype,
            validity: Vec::with_capacity(cap),
            all_valid: true,
            data: ArrayData::with_capacity(datatype, cap),
        }
    }

    pub fn push(&mut self, scalar: &ScalarValue) -> Result<()> {
        match (&mut self.data, scalar) {
            (data, ScalarValue::Null) => {
                data.push_default();
                self.validity.push(false);
                self.all_valid = false;
                return Ok(());
            }
            (ArrayData::Boolean(v), ScalarValue::Boolean(s)) => v.push(*s),
            (ArrayData::Int64(v), ScalarValue::Int64(s)) => v.push(*s),
            (ArrayData::Float64(v), ScalarValue::Float64(s)) => v.push(*s),
            (ArrayData::Utf8(v), ScalarValue::Utf8(s)) => v.push(s.clone()),
            (ArrayData::Binary(v), ScalarValue::Binary(s)) => v.push(s.clone()),
            (_, other) => {
                return Err(DbError::new("Unexpected value for array builder")
                    .with_field("expected", self.datatype)
                    .with_field("got", other.datatype()));
            }
        }
        self.validity.push(true);
        Ok(())
    }

    pub fn finish(self) -> Array {
        let validity = if self.all_valid || self.datatype == DataType::Null {
            None
        } else {
            Some(self.validity)
        };
        Array {
            datatype: self.datatype,
            validity,
            data: self.data,
        }
    }
}

macro_rules! impl_from_iter {
    (@impl [$($lt:lifetime)?] $native:ty, $datatype:expr, $variant:ident, $conv:expr) => {
        impl<$($lt)?> FromIterator<$native> for Array {
            fn from_iter<T: IntoIterator<Item = $native>>(iter: T) -> Self {
                let values: Vec<_> = iter.into_iter().map($conv).collect();
                Array {
                    datatype: $datatype,
                    validity: None,
                    data: ArrayData::$variant(values),
                }
            }
        }

        impl<$($lt)?> FromIterator<Option<$native>> for Array {
            fn from_iter<T: IntoIterator<Item = Option<$native>>>(iter: T) -> Self {
                let mut validity = Vec::new();
                let mut values = Vec::new();
                for v in iter {
                    match v {
                        Some(v) => {
                            validity.push(true);
                            values.push($conv(v));
                        }
                        None => {
                            validity.push(false);
                            values.push(Default::default());
                        }
                    }
                }
                let validity = if validity.iter().all(|v| *v) {
                    None
                } else {
                    Some(validity)
                };
                Array {
                    datatype: $datatype,
                    validity,
                    data: ArrayData::$variant(values),
                }
            }
        }
    };
    (<$lt:lifetime> $native:ty, $datatype:expr, $variant:ident, $conv:expr) => {
        impl_from_iter!(@impl [$lt] $native, $datatype, $variant, $conv);
    };
    ($native:ty, $datatype:expr, $variant:ident, $conv:expr) => {
        impl_from_iter!(@impl [] $native, $datatype, $variant, $conv);
    };
}

impl_from_iter!(bool, DataType::Boolean, Boolean, |v| v);
impl_from_iter!(i64, DataType::Int64, Int64, |v| v);
impl_from_iter!(f64, DataType::Float64, Float64, |v| v);
impl_from_iter!(<'a> &'a str, DataType::Utf8, Utf8, |v: &str| v.to_string());
impl_from_iter!(String, DataType::Utf8, Utf8, |v| v);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_iter_borrowed_strs() {
        let owned = vec![String::from("x"), String::from("y")];
        let arr = Array::from_iter(owned.iter().map(|s| s.as_str()));
        assert_eq!(DataType::Utf8, arr.datatype());
        assert_eq!(ScalarValue::from("y"), arr.logical_value(1).unwrap());
    }

    #[test]
    fn from_iter_with_nulls() {
        let arr = Array::from_iter([Some(1i64), None, Some(3)]);
        assert_eq!(3, arr.logical_len());
        assert_eq!(ScalarValue::Int64(1), arr.logical_value(0).unwrap());
        assert_eq!(ScalarValue::Null, arr.logical_value(1).unwrap());
        assert!(arr.logical_value(3).is_err());
    }

    #[test]
    fn from_scalars_roundtrip_values() {
        let scalars = vec![
            ScalarValue::from("a"),
            ScalarValue::Null,
            ScalarValue::from("c"),
        ];
        let arr = Array::try_from_scalars(DataType::Utf8, &scalars).unwrap();
        for (idx, expected) in scalars.iter().enumerate() {
            assert_eq!(expected, &arr.logical_value(idx).unwrap());
        }
    }

    #[test]
    fn from_scalars_wrong_type() {
        let scalars = [ScalarValue::Int64(1)];
        assert!(Array::try_from_scalars(DataType::Utf8, &scalars).is_err());
    }

    #[test]
    fn slice_keeps_validity() {
        let arr = Array::from_iter([Some("a"), None, Some("c"), Some("d")]);
        let sliced = arr.slice(1, 2);
        assert_eq!(2, sliced.logical_len());
        assert_eq!(ScalarValue::Null, sliced.logical_value(0).unwrap());
        assert_eq!(ScalarValue::from("c"), sliced.logical_value(1).unwrap());
    }

    #[test]
    fn select_rows() {
        let arr = Array::from_iter([Some(1i64), None, Some(3)]);
        let selected = arr.select(&[2, 1, 2]);
        assert_eq!(Array::from_iter([Some(3i64), None, Some(3)]), selected);
    }

    #[test]
    fn null_array() {
        let arr = Array::new_nulls(DataType::Null, 2);
        assert_eq!(2, arr.logical_len());
        assert!(!arr.is_valid(0));
        assert_eq!(ScalarValue::Null, arr.logical_value(1).unwrap());
    }
}
