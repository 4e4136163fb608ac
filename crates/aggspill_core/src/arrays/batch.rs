use aggspill_error::{DbError, Result};

use super::array::{Array, ArrayBuilder};
use super::datatype::DataType;
use super::row::ScalarRow;

/// A batch of same-length arrays.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Columns that make up this batch.
    arrays: Vec<Array>,
    /// Number of rows in this batch. Needed to allow for a batch that has no
    /// columns but a non-zero number of rows.
    num_rows: usize,
}

impl Batch {
    pub const fn empty() -> Self {
        Batch {
            arrays: Vec::new(),
            num_rows: 0,
        }
    }

    pub fn empty_with_num_rows(num_rows: usize) -> Self {
        Batch {
            arrays: Vec::new(),
            num_rows,
        }
    }

    /// Create a new batch from some number of arrays.
    ///
    /// All arrays should have the same logical length.
    pub fn try_new(arrays: impl IntoIterator<Item = Array>) -> Result<Self> {
        let arrays: Vec<_> = arrays.into_iter().collect();
        let len = match arrays.first() {
            Some(arr) => arr.logical_len(),
            None => return Ok(Self::empty()),
        };

        for (idx, arr) in arrays.iter().enumerate() {
            if arr.logical_len() != len {
                return Err(DbError::new("Array lengths differ in batch")
                    .with_field("expected", len)
                    .with_field("got", arr.logical_len())
                    .with_field("column", idx));
            }
        }

        Ok(Batch {
            arrays,
            num_rows: len,
        })
    }

    /// Build a batch from rows.
    ///
    /// Every row must have one value per datatype.
    pub fn try_from_rows(rows: &[ScalarRow], datatypes: &[DataType]) -> Result<Self> {
        let mut builders: Vec<_> = datatypes
            .iter()
            .map(|&datatype| ArrayBuilder::with_capacity(datatype, rows.len()))
            .collect();

        for row in rows {
            if row.num_columns() != datatypes.len() {
                return Err(DbError::new("Row has unexpected number of columns")
                    .with_field("expected", datatypes.len())
                    .with_field("got", row.num_columns()));
            }
            for (builder, value) in builders.iter_mut().zip(row.iter()) {
                builder.push(value)?;
            }
        }

        if datatypes.is_empty() {
            return Ok(Self::empty_with_num_rows(rows.len()));
        }

        Self::try_new(builders.into_iter().map(|b| b.finish()))
    }

    /// Create a new batch containing only the given rows.
    pub fn select(&self, rows: &[usize]) -> Self {
        let arrays = self.arrays.iter().map(|a| a.select(rows)).collect();
        Batch {
            arrays,
            num_rows: rows.len(),
        }
    }

    /// Get the row at some index.
    pub fn row(&self, idx: usize) -> Option<ScalarRow> {
        if idx >= self.num_rows {
            return None;
        }
        Some(
            self.arrays
                .iter()
                .map(|arr| arr.value_unchecked(idx))
                .collect(),
        )
    }

    /// Iterate over all rows in the batch.
    pub fn rows(&self) -> impl Iterator<Item = ScalarRow> + '_ {
        (0..self.num_rows).filter_map(|idx| self.row(idx))
    }

    pub fn column(&self, idx: usize) -> Option<&Array> {
        self.arrays.get(idx)
    }

    pub fn arrays(&self) -> &[Array] {
        &self.arrays
    }

    pub fn datatypes(&self) -> Vec<DataType> {
        self.arrays.iter().map(|a| a.datatype()).collect()
    }

    pub fn num_columns(&self) -> usize {
        self.arrays.len()
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn size_bytes(&self) -> usize {
        self.arrays.iter().map(|a| a.size_bytes()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arrays::scalar::ScalarValue;

    #[test]
    fn mismatched_lengths() {
        let res = Batch::try_new([
            Array::from_iter([1i64, 2]),
            Array::from_iter([1i64, 2, 3]),
        ]);
        assert!(res.is_err());
    }

    #[test]
    fn rows_roundtrip() {
        let rows = vec![
            ScalarRow::from_iter([ScalarValue::from("a"), ScalarValue::Int64(1)]),
            ScalarRow::from_iter([ScalarValue::Null, ScalarValue::Int64(2)]),
        ];
        let batch = Batch::try_from_rows(&rows, &[DataType::Utf8, DataType::Int64]).unwrap();

        assert_eq!(2, batch.num_rows());
        assert_eq!(rows, batch.rows().collect::<Vec<_>>());
    }

    #[test]
    fn zero_columns_keeps_row_count() {
        let rows = vec![ScalarRow::empty(), ScalarRow::empty()];
        let batch = Batch::try_from_rows(&rows, &[]).unwrap();
        assert_eq!(2, batch.num_rows());
        assert_eq!(0, batch.num_columns());
    }
}
