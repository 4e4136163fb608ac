use std::sync::Arc;

use aggspill_error::{DbError, Result};

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
pub struct Sum;

impl AggregateFunction for Sum {
    fn name(&self) -> &'static str {
        "sum"
    }

    fn plan(&self, inputs: &[DataType]) -> Result<PlannedAggregateFunction> {
        plan_check_num_args(self, inputs, 1)?;

        let (return_type, function_impl): (_, Arc<dyn AggregateFunctionImpl>) = match inputs[0] {
            DataType::Int64 => (DataType::Int64, Arc::new(SumInt64Impl)),
            DataType::Float64 => (DataType::Float64, Arc::new(SumFloat64Impl)),
            _ => return Err(invalid_input_types(self, inputs)),
        };

        Ok(PlannedAggregateFunction {
            name: self.name(),
            return_type,
            input_types: inputs.to_vec(),
            function_impl,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SumInt64Impl;

impl AggregateFunctionImpl for SumInt64Impl {
    fn new_states(&self) -> Box<dyn AggregateGroupStates> {
        Box::new(TypedAggregateGroupStates::<SumInt64State>::new(
            DataType::Int64,
        ))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SumFloat64Impl;

impl AggregateFunctionImpl for SumFloat64Impl {
    fn new_states(&self) -> Box<dyn AggregateGroupStates> {
        Box::new(TypedAggregateGroupStates::<SumFloat64State>::new(
            DataType::Float64,
        ))
    }
}

#[derive(Debug, Default)]
pub struct SumInt64State {
    sum: i64,
    /// If we've seen at least one non-null input.
    valid: bool,
}

impl SumInt64State {
    fn add(&mut self, v: i64) -> Result<()> {
        self.sum = self
            .sum
            .checked_add(v)
            .ok_or_else(|| DbError::invalid_input("Int64 overflow in sum"))?;
        self.valid = true;
        Ok(())
    }
}

impl AggregateState for SumInt64State {
    fn update(&mut self, inputs: &[ScalarValue]) -> Result<()> {
        match inputs.first() {
            Some(ScalarValue::Null) | None => Ok(()),
            Some(v) => self.add(v.try_as_i64()?),
        }
    }

    fn merge(&mut self, other: &mut Self) -> Result<()> {
        if other.valid {
            self.add(other.sum)?;
        }
        Ok(())
    }

    fn finalize(&self) -> Result<ScalarValue> {
        if self.valid {
            Ok(ScalarValue::Int64(self.sum))
        } else {
            Ok(ScalarValue::Null)
        }
    }

    fn serialize(&self, enc: &mut ByteEncoder) -> Result<()> {
        enc.put_u8(self.valid as u8);
        enc.put_i64(self.sum);
        Ok(())
    }

    fn deserialize(dec: &mut ByteDecoder) -> Result<Self> {
        let valid = dec.get_u8()? != 0;
        let sum = dec.get_i64()?;
        Ok(SumInt64State { sum, valid })
    }
}

#[derive(Debug, Default)]
pub struct SumFloat64State {
    sum: f64,
    valid: bool,
}

impl AggregateState for SumFloat64State {
    fn update(&mut self, inputs: &[ScalarValue]) -> Result<()> {
        match inputs.first() {
            Some(ScalarValue::Null) | None => (),
            Some(v) => {
                self.sum += v.try_as_f64()?;
                self.valid = true;
            }
        }
        Ok(())
    }

    fn merge(&mut self, other: &mut Self) -> Result<()> {
        if other.valid {
            self.sum += other.sum;
            self.valid = true;
        }
        Ok(())
    }

    fn finalize(&self) -> Result<ScalarValue> {
        if self.valid {
            Ok(ScalarValue::Float64(self.sum))
        } else {
            Ok(ScalarValue::Null)
        }
    }

    fn serialize(&self, enc: &mut ByteEncoder) -> Result<()> {
        enc.put_u8(self.valid as u8);
        enc.put_f64(self.sum);
        Ok(())
    }

    fn deserialize(dec: &mut ByteDecoder) -> Result<Self> {
        let valid = dec.get_u8()? != 0;
        let sum = dec.get_f64()?;
        Ok(SumFloat64State { sum, valid })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_all_null_is_null() {
        let mut state = SumInt64State::default();
        state.update(&[ScalarValue::Null]).unwrap();
        assert_eq!(ScalarValue::Null, state.finalize().unwrap());
    }

    #[test]
    fn sum_overflow_errors() {
        let mut state = SumInt64State::default();
        state.update(&[ScalarValue::Int64(i64::MAX)]).unwrap();
        assert!(state.update(&[ScalarValue::Int64(1)]).is_err());
    }

    #[test]
    fn plan_unsupported_type() {
        assert!(Sum.plan(&[DataType::Utf8]).is_err());
        assert_eq!(DataType::Float64, Sum.plan(&[DataType::Float64]).unwrap().return_type);
    }
}
