use super::scalar::ScalarValue;

/// A row of owned scalar values.
///
/// Used as the group key inside the aggregate hash tables. Key identity is
/// the ordered tuple of values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ScalarRow {
    pub columns: Vec<ScalarValue>,
}

impl ScalarRow {
    pub const fn empty() -> Self {
        ScalarRow {
            columns: Vec::new(),
        }
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScalarValue> {
        self.columns.iter()
    }

    pub fn size_bytes(&self) -> usize {
        std::mem::size_of::<Self>() + self.columns.iter().map(|v| v.size_bytes()).sum::<usize>()
    }
}

impl FromIterator<ScalarValue> for ScalarRow {
    fn from_iter<T: IntoIterator<Item = ScalarValue>>(iter: T) -> Self {
        ScalarRow {
            columns: iter.into_iter().collect(),
        }
    }
}
