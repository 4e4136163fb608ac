use std::fmt;
use std::path::PathBuf;

use aggspill_error::{DbError, Result};

use crate::arrays::batch::Batch;
use crate::arrays::datatype::DataType;
use crate::functions::aggregate::{AggregateFunction, PlannedAggregateFunction};

pub const DEFAULT_MEMORY_THRESHOLD_BYTES: usize = 512 * 1024 * 1024;
pub const DEFAULT_NUM_BUCKETS: usize = 256;
pub const DEFAULT_BATCH_SIZE: usize = 4096;
pub const DEFAULT_TWO_LEVEL_THRESHOLD_ROWS: usize = 100_000;
pub const DEFAULT_TWO_LEVEL_THRESHOLD_BYTES: usize = 50 * 1024 * 1024;

/// Largest bucket count we allow.
///
/// Spilling a flat table and switching to two-level tables both allocate per
/// bucket, so this bounds that up-front cost. The overflow row segment uses
/// the bucket id one past the last bucket.
pub const MAX_NUM_BUCKETS: usize = 1 << 16;

/// What to do once the number of groups reaches `max_groups`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowMode {
    /// Error with `ResourceExhausted`.
    #[default]
    Throw,
    /// Stop reading input and produce results for the groups seen so far.
    Break,
    /// Aggregate rows for new keys into a single overflow row.
    Any,
}

impl OverflowMode {
    pub fn from_name(name: &str) -> Result<Self> {
        Ok(match name {
            "throw" => Self::Throw,
            "break" => Self::Break,
            "any" => Self::Any,
            other => {
                return Err(DbError::invalid_input(format!(
                    "Unknown group by overflow mode: '{other}'"
                )));
            }
        })
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Throw => "throw",
            Self::Break => "break",
            Self::Any => "any",
        }
    }
}

impl fmt::Display for OverflowMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An aggregate to compute, along with the input columns it reads.
#[derive(Debug, Clone)]
pub struct AggregateSpec {
    pub function: &'static dyn AggregateFunction,
    /// Column indices in the input batches.
    pub inputs: Vec<usize>,
    /// Types the function was planned with when it produced the partial
    /// states being read. Only used when the input is partial, in which case
    /// `inputs` holds the single state column.
    pub partial_input_types: Option<Vec<DataType>>,
}

impl AggregateSpec {
    pub fn new(function: &'static dyn AggregateFunction, inputs: impl Into<Vec<usize>>) -> Self {
        AggregateSpec {
            function,
            inputs: inputs.into(),
            partial_input_types: None,
        }
    }

    /// Create a spec that merges serialized states from `state_column`.
    pub fn merging(
        function: &'static dyn AggregateFunction,
        state_column: usize,
        input_types: impl Into<Vec<DataType>>,
    ) -> Self {
        AggregateSpec {
            function,
            inputs: vec![state_column],
            partial_input_types: Some(input_types.into()),
        }
    }
}

/// Configuration for a single aggregation run.
#[derive(Debug, Clone)]
pub struct AggregateConfig {
    /// Input columns making up the group key, in order.
    pub group_columns: Vec<usize>,
    pub aggregates: Vec<AggregateSpec>,
    /// Estimated bytes held by the grouping table before spilling.
    pub memory_threshold_bytes: usize,
    /// Number of buckets groups are partitioned into.
    pub num_buckets: usize,
    pub spill_enabled: bool,
    /// If false, emit serialized states instead of final values.
    pub finalize_output: bool,
    /// Max rows per output batch on the direct path.
    pub batch_size: usize,
    /// Group count at which the table switches to per-bucket sub-tables. 0
    /// disables.
    pub two_level_threshold_rows: usize,
    /// Estimated bytes at which the table switches to per-bucket sub-tables.
    /// 0 disables.
    pub two_level_threshold_bytes: usize,
    pub max_groups: Option<usize>,
    pub overflow_mode: OverflowMode,
    /// Aggregate inputs are serialized states from an earlier stage.
    pub input_is_partial: bool,
    /// Directory for temporary files, system temp dir if None.
    pub tmp_path: Option<PathBuf>,
}

impl AggregateConfig {
    pub fn new(group_columns: impl Into<Vec<usize>>, aggregates: Vec<AggregateSpec>) -> Self {
        AggregateConfig {
            group_columns: group_columns.into(),
            aggregates,
            memory_threshold_bytes: DEFAULT_MEMORY_THRESHOLD_BYTES,
            num_buckets: DEFAULT_NUM_BUCKETS,
            spill_enabled: true,
            finalize_output: true,
            batch_size: DEFAULT_BATCH_SIZE,
            two_level_threshold_rows: DEFAULT_TWO_LEVEL_THRESHOLD_ROWS,
            two_level_threshold_bytes: DEFAULT_TWO_LEVEL_THRESHOLD_BYTES,
            max_groups: None,
            overflow_mode: OverflowMode::Throw,
            input_is_partial: false,
            tmp_path: None,
        }
    }

    /// Check values that don't depend on the input.
    pub fn validate(&self) -> Result<()> {
        if self.num_buckets == 0 {
            return Err(DbError::invalid_input("Number of buckets must be greater than zero"));
        }
        if self.num_buckets > MAX_NUM_BUCKETS {
            return Err(DbError::invalid_input("Number of buckets too large")
                .with_field("num_buckets", self.num_buckets)
                .with_field("max", MAX_NUM_BUCKETS));
        }
        if self.batch_size == 0 {
            return Err(DbError::invalid_input("Batch size must be greater than zero"));
        }
        if self.input_is_partial {
            for agg in &self.aggregates {
                if agg.inputs.len() != 1 || agg.partial_input_types.is_none() {
                    return Err(DbError::invalid_input(format!(
                        "Aggregate '{}' must read a single state column with known input types when merging partial input",
                        agg.function.name()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Validate the config against the input types and plan every aggregate.
    pub fn plan(&self, input_types: &[DataType]) -> Result<AggregateLayout> {
        self.validate()?;

        let column_type = |idx: usize| -> Result<DataType> {
            input_types.get(idx).copied().ok_or_else(|| {
                DbError::invalid_input("Column index out of range for input")
                    .with_field("column", idx)
                    .with_field("num_columns", input_types.len())
            })
        };

        let group_types = self
            .group_columns
            .iter()
            .map(|&idx| column_type(idx))
            .collect::<Result<Vec<_>>>()?;

        let mut aggregates = Vec::with_capacity(self.aggregates.len());
        for spec in &self.aggregates {
            let types = spec
                .inputs
                .iter()
                .map(|&idx| column_type(idx))
                .collect::<Result<Vec<_>>>()?;

            let function = if self.input_is_partial {
                if types[0] != DataType::Binary {
                    return Err(DbError::invalid_input("Partial state column must be Binary")
                        .with_field("aggregate", spec.function.name())
                        .with_field("got", types[0]));
                }
                // Validated above.
                let planned_types = spec.partial_input_types.as_deref().unwrap_or_default();
                spec.function.plan(planned_types)?
            } else {
                spec.function.plan(&types)?
            };

            aggregates.push(PlannedAggregate {
                function,
                inputs: spec.inputs.clone(),
            });
        }

        Ok(AggregateLayout {
            input_types: input_types.to_vec(),
            group_columns: self.group_columns.clone(),
            group_types,
            aggregates,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PlannedAggregate {
    pub function: PlannedAggregateFunction,
    pub inputs: Vec<usize>,
}

/// Resolved column layout for a run.
///
/// Output batches and temporary file segments are laid out as the group
/// columns followed by one column per aggregate.
#[derive(Debug, Clone)]
pub struct AggregateLayout {
    /// Types of the input batches the layout was planned against.
    pub input_types: Vec<DataType>,
    pub group_columns: Vec<usize>,
    pub group_types: Vec<DataType>,
    pub aggregates: Vec<PlannedAggregate>,
}

impl AggregateLayout {
    /// Check that a batch has the columns this layout was planned for.
    ///
    /// A Null array is accepted for any column.
    pub fn check_input(&self, batch: &Batch) -> Result<()> {
        if batch.num_columns() != self.input_types.len() {
            return Err(DbError::invalid_input("Unexpected number of columns in input batch")
                .with_field("expected", self.input_types.len())
                .with_field("got", batch.num_columns()));
        }
        for (idx, (arr, &expected)) in batch.arrays().iter().zip(&self.input_types).enumerate() {
            let got = arr.datatype();
            if got != expected && got != DataType::Null {
                return Err(DbError::invalid_input("Unexpected column type in input batch")
                    .with_field("column", idx)
                    .with_field("expected", expected)
                    .with_field("got", got));
            }
        }
        Ok(())
    }

    /// Types of spilled rows, aggregate states are always Binary.
    pub fn state_types(&self) -> Vec<DataType> {
        self.group_types
            .iter()
            .copied()
            .chain(self.aggregates.iter().map(|_| DataType::Binary))
            .collect()
    }

    pub fn output_types(&self, finalize: bool) -> Vec<DataType> {
        if !finalize {
            return self.state_types();
        }
        self.group_types
            .iter()
            .copied()
            .chain(self.aggregates.iter().map(|a| a.function.return_type))
            .collect()
    }
}
