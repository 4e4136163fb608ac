use std::sync::Arc;

use aggspill_error::Result;

use crate::arrays::datatype::DataType;
use crate::arrays::encoding::{ByteDecoder, ByteEncoder};
use crate::arrays::scalar::ScalarValue;
use crate::functions::aggregate::states::{
    AggregateGroupStates,
    AggregateState,
    TypedAggregateGroupStates,
};
use crate::functions::aggregate::{
    AggregateFunction,
    AggregateFunctionImpl,
    PlannedAggregateFunction,
    invalid_input_types,
};

/// `COUNT(*)` when given no inputs, `COUNT(col)` counting non-null values
/// when given one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Count;

impl AggregateFunction for Count {
    fn name(&self) -> &'static str {
        "count"
    }

    fn plan(&self, inputs: &[DataType]) -> Result<PlannedAggregateFunction> {
        let function_impl: Arc<dyn AggregateFunctionImpl> = match inputs.len() {
            0 => Arc::new(CountStarImpl),
            1 => Arc::new(CountNonNullImpl),
            _ => return Err(invalid_input_types(self, inputs)),
        };

        Ok(PlannedAggregateFunction {
            name: self.name(),
            return_type: DataType::Int64,
            input_types: inputs.to_vec(),
            function_impl,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CountStarImpl;

impl AggregateFunctionImpl for CountStarImpl {
    fn new_states(&self) -> Box<dyn AggregateGroupStates> {
        Box::new(TypedAggregateGroupStates::<CountState<true>>::new(
            DataType::Int64,
        ))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CountNonNullImpl;

impl AggregateFunctionImpl for CountNonNullImpl {
    fn new_states(&self) -> Box<dyn AggregateGroupStates> {
        Box::new(TypedAggregateGroupStates::<CountState<false>>::new(
            DataType::Int64,
        ))
    }
}

/// Count state, `STAR` indicates every row is counted regardless of input.
#[derive(Debug, Default)]
pub struct CountState<const STAR: bool> {
    count: i64,
}

impl<const STAR: bool> AggregateState for CountState<STAR> {
    fn update(&mut self, inputs: &[ScalarValue]) -> Result<()> {
        if STAR || inputs.first().is_some_and(|v| !v.is_null()) {
            self.count += 1;
        }
        Ok(())
    }

    fn merge(&mut self, other: &mut Self) -> Result<()> {
        self.count += other.count;
        Ok(())
    }

    fn finalize(&self) -> Result<ScalarValue> {
        Ok(ScalarValue::Int64(self.count))
    }

    fn serialize(&self, enc: &mut ByteEncoder) -> Result<()> {
        enc.put_i64(self.count);
        Ok(())
    }

    fn deserialize(dec: &mut ByteDecoder) -> Result<Self> {
        Ok(CountState {
            count: dec.get_i64()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_non_null_skips_nulls() {
        let mut state = CountState::<false>::default();
        state.update(&[ScalarValue::Int64(1)]).unwrap();
        state.update(&[ScalarValue::Null]).unwrap();
        assert_eq!(ScalarValue::Int64(1), state.finalize().unwrap());
    }

    #[test]
    fn count_star_counts_everything() {
        let mut state = CountState::<true>::default();
        state.update(&[]).unwrap();
        state.update(&[]).unwrap();
        assert_eq!(ScalarValue::Int64(2), state.finalize().unwrap());
    }

    #[test]
    fn plan_arity() {
        assert!(Count.plan(&[]).is_ok());
        assert!(Count.plan(&[DataType::Utf8]).is_ok());
        assert!(Count.plan(&[DataType::Utf8, DataType::Int64]).is_err());
    }
}
