pub mod builtin;
pub mod states;

use std::fmt::Debug;
use std::sync::Arc;

use aggspill_error::{DbError, Result};

use self::states::AggregateGroupStates;
use crate::arrays::datatype::DataType;

/// A generic aggregate function that can be specialized into a more specific
/// function depending on the input types.
pub trait AggregateFunction: Debug + Sync + Send {
    /// Name of the function.
    fn name(&self) -> &'static str;

    /// Plans the function for the given input types.
    ///
    /// Errors if the function doesn't accept the inputs.
    fn plan(&self, inputs: &[DataType]) -> Result<PlannedAggregateFunction>;
}

/// Specialized implementation of an aggregate for concrete input types.
pub trait AggregateFunctionImpl: Debug + Sync + Send {
    /// Create an empty set of group states.
    fn new_states(&self) -> Box<dyn AggregateGroupStates>;
}

#[derive(Debug, Clone)]
pub struct PlannedAggregateFunction {
    pub name: &'static str,
    pub return_type: DataType,
    pub input_types: Vec<DataType>,
    pub function_impl: Arc<dyn AggregateFunctionImpl>,
}

impl PlannedAggregateFunction {
    pub fn new_states(&self) -> Box<dyn AggregateGroupStates> {
        self.function_impl.new_states()
    }
}

/// Check that the number of inputs matches what the function expects.
pub(crate) fn plan_check_num_args(
    func: &dyn AggregateFunction,
    inputs: &[DataType],
    expected: usize,
) -> Result<()> {
    if inputs.len() != expected {
        return Err(DbError::invalid_input(format!(
            "Expected {expected} input(s) for '{}', got {}",
            func.name(),
            inputs.len()
        )));
    }
    Ok(())
}

pub(crate) fn invalid_input_types(func: &dyn AggregateFunction, inputs: &[DataType]) -> DbError {
    let types: Vec<_> = inputs.iter().map(|t| t.to_string()).collect();
    DbError::invalid_input(format!(
        "Unsupported input types for '{}': ({})",
        func.name(),
        types.join(", ")
    ))
}
