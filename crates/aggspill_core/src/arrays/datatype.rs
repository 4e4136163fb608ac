use std::fmt;

use aggspill_error::{DbError, Result};

/// Logical type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    /// Column containing only nulls.
    Null,
    Boolean,
    Int64,
    Float64,
    Utf8,
    Binary,
}

impl DataType {
    /// Stable single byte tag used when encoding batches.
    pub(crate) const fn tag(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Boolean => 1,
            Self::Int64 => 2,
            Self::Float64 => 3,
            Self::Utf8 => 4,
            Self::Binary => 5,
        }
    }

    pub(crate) fn try_from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => Self::Null,
            1 => Self::Boolean,
            2 => Self::Int64,
            3 => Self::Float64,
            4 => Self::Utf8,
            5 => Self::Binary,
            other => {
                return Err(DbError::new("Unknown data type tag").with_field("tag", other));
            }
        })
    }

    /// Approximate in-memory width of a single value, not counting heap
    /// allocations for variable length types.
    pub const fn fixed_width(&self) -> usize {
        match self {
            Self::Null => 0,
            Self::Boolean => 1,
            Self::Int64 | Self::Float64 => 8,
            Self::Utf8 | Self::Binary => 24,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "Null"),
            Self::Boolean => write!(f, "Boolean"),
            Self::Int64 => write!(f, "Int64"),
            Self::Float64 => write!(f, "Float64"),
            Self::Utf8 => write!(f, "Utf8"),
            Self::Binary => write!(f, "Binary"),
        }
    }
}
