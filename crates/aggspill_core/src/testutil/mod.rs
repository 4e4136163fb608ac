//! Test utilities.
//!
//! Note this isn't behind a `#[cfg(test)]` flag since this should be usable
//! from integration tests and other crates.
//!
//! Should not be used outside of tests.

use aggspill_error::Result;

use crate::arrays::array::Array;
use crate::arrays::batch::Batch;
use crate::arrays::datatype::DataType;
use crate::arrays::row::ScalarRow;
use crate::execution::cancel::CancellationToken;
use crate::execution::source::BatchSource;

/// Generate a batch from some number of iterables, one per column.
///
/// ```
/// use aggspill_core::generate_batch;
///
/// let batch = generate_batch!(["a", "b"], [Some(1i64), None]);
/// assert_eq!(2, batch.num_rows());
/// ```
#[macro_export]
macro_rules! generate_batch {
    ( $( $array_values:expr ),* $(,)? ) => {{
        $crate::arrays::batch::Batch::try_new(vec![
            $( $crate::arrays::array::Array::from_iter($array_values), )*
        ])
        .unwrap()
    }};
}

/// Build a row of scalars, converting each value with `ScalarValue::from`.
#[macro_export]
macro_rules! row {
    ( $( $value:expr ),* $(,)? ) => {
        <$crate::arrays::row::ScalarRow as ::std::iter::FromIterator<_>>::from_iter([
            $( $crate::arrays::scalar::ScalarValue::from($value), )*
        ])
    };
}

/// Asserts that two arrays are logically equal.
pub fn assert_arrays_eq(a: &Array, b: &Array) {
    assert_eq!(a.datatype(), b.datatype(), "data types differ");
    assert_eq!(a.logical_len(), b.logical_len(), "logical lengths differ");

    for row_idx in 0..a.logical_len() {
        let a_val = a.logical_value(row_idx).unwrap();
        let b_val = b.logical_value(row_idx).unwrap();

        assert_eq!(a_val, b_val, "values differ at row {row_idx}");
    }
}

/// Asserts that two batches are logically equal.
pub fn assert_batches_eq(a: &Batch, b: &Batch) {
    assert_eq!(a.num_rows(), b.num_rows(), "num rows differ");
    assert_eq!(a.num_columns(), b.num_columns(), "num columns differ");

    for col_idx in 0..a.num_columns() {
        let a_col = a.column(col_idx).unwrap();
        let b_col = b.column(col_idx).unwrap();

        assert_arrays_eq(a_col, b_col);
    }
}

/// Collect all rows across batches in sorted order.
///
/// Aggregate output order is unspecified, so tests compare sorted rows.
pub fn sorted_rows(batches: &[Batch]) -> Vec<ScalarRow> {
    let mut rows: Vec<_> = batches.iter().flat_map(|b| b.rows()).collect();
    rows.sort();
    rows
}

/// Source producing batches from a vector.
#[derive(Debug, Clone)]
pub struct VecSource {
    datatypes: Vec<DataType>,
    batches: Vec<Batch>,
    /// Index of the next batch to produce.
    next: usize,
}

impl VecSource {
    pub fn new(datatypes: Vec<DataType>, batches: Vec<Batch>) -> Self {
        VecSource {
            datatypes,
            batches,
            next: 0,
        }
    }

    /// Number of batches handed out so far.
    pub fn batches_read(&self) -> usize {
        self.next
    }
}

impl BatchSource for VecSource {
    fn datatypes(&self) -> &[DataType] {
        &self.datatypes
    }

    fn read(&mut self, _token: &CancellationToken) -> Result<Option<Batch>> {
        let batch = self.batches.get(self.next).cloned();
        if batch.is_some() {
            self.next += 1;
        }
        Ok(batch)
    }
}
