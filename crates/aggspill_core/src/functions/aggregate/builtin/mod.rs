pub mod avg;
pub mod count;
pub mod minmax;
pub mod sum;

use super::AggregateFunction;

pub const BUILTIN_AGGREGATE_FUNCTIONS: &[&dyn AggregateFunction] = &[
    &count::Count,
    &sum::Sum,
    &minmax::Min,
    &minmax::Max,
    &avg::Avg,
];

/// Find a builtin aggregate function by name.
pub fn find_builtin(name: &str) -> Option<&'static dyn AggregateFunction> {
    BUILTIN_AGGREGATE_FUNCTIONS
        .iter()
        .copied()
        .find(|f| f.name().eq_ignore_ascii_case(name))
}
