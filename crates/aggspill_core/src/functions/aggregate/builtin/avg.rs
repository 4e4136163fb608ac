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
    plan_check_num_args,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Avg;

impl AggregateFunction for Avg {
    fn name(&self) -> &'static str {
        "avg"
    }

    fn plan(&self, inputs: &[DataType]) -> Result<PlannedAggregateFunction> {
        plan_check_num_args(self, inputs, 1)?;
        match inputs[0] {
            DataType::Int64 | DataType::Float64 => (),
            _ => return Err(invalid_input_types(self, inputs)),
        }

        Ok(PlannedAggregateFunction {
            name: self.name(),
            return_type: DataType::Float64,
            input_types: inputs.to_vec(),
            function_impl: Arc::new(AvgImpl),
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AvgImpl;

impl AggregateFunctionImpl for AvgImpl {
    fn new_states(&self) -> Box<dyn AggregateGroupStates> {
        Box::new(TypedAggregateGroupStates::<AvgState>::new(DataType::Float64))
    }
}

#[derive(Debug, Default)]
pub struct AvgState {
    sum: f64,
    count: i64,
}

impl AggregateState for AvgState {
    fn update(&mut self, inputs: &[ScalarValue]) -> Result<()> {
        match inputs.first() {
            Some(ScalarValue::Null) | None => (),
            Some(v) => {
                self.sum += v.try_as_f64()?;
                self.count += 1;
            }
        }
        Ok(())
    }

    fn merge(&mut self, other: &mut Self) -> Result<()> {
        self.sum += other.sum;
        self.count += other.count;
        Ok(())
    }

    fn finalize(&self) -> Result<ScalarValue> {
        if self.count == 0 {
            return Ok(ScalarValue::Null);
        }
        Ok(ScalarValue::Float64(self.sum / self.count as f64))
    }

    fn serialize(&self, enc: &mut ByteEncoder) -> Result<()> {
        enc.put_f64(self.sum);
        enc.put_i64(self.count);
        Ok(())
    }

    fn deserialize(dec: &mut ByteDecoder) -> Result<Self> {
        let sum = dec.get_f64()?;
        let count = dec.get_i64()?;
        Ok(AvgState { sum, count })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn avg_merge_then_finalize() {
        let mut a = AvgState::default();
        a.update(&[ScalarValue::Int64(1)]).unwrap();
        a.update(&[ScalarValue::Int64(2)]).unwrap();
        let mut b = AvgState::default();
        b.update(&[ScalarValue::Int64(6)]).unwrap();

        a.merge(&mut b).unwrap();
        assert_eq!(ScalarValue::Float64(3.0), a.finalize().unwrap());
    }
}
