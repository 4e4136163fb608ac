use std::cmp::Ordering;
use std::marker::PhantomData;
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
    plan_check_num_args,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Min;

impl AggregateFunction for Min {
    fn name(&self) -> &'static str {
        "min"
    }

    fn plan(&self, inputs: &[DataType]) -> Result<PlannedAggregateFunction> {
        plan_check_num_args(self, inputs, 1)?;
        Ok(PlannedAggregateFunction {
            name: self.name(),
            return_type: inputs[0],
            input_types: inputs.to_vec(),
            function_impl: Arc::new(MinMaxImpl::<KeepMin>::new(inputs[0])),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Max;

impl AggregateFunction for Max {
    fn name(&self) -> &'static str {
        "max"
    }

    fn plan(&self, inputs: &[DataType]) -> Result<PlannedAggregateFunction> {
        plan_check_num_args(self, inputs, 1)?;
        Ok(PlannedAggregateFunction {
            name: self.name(),
            return_type: inputs[0],
            input_types: inputs.to_vec(),
            function_impl: Arc::new(MinMaxImpl::<KeepMax>::new(inputs[0])),
        })
    }
}

/// Decides which of two values a min/max state keeps.
pub trait MinMaxOp: std::fmt::Debug + Default + Send + Sync + 'static {
    /// Ordering of the new value relative to the current one that causes
    /// the new value to replace it.
    const REPLACE_ON: Ordering;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct KeepMin;

impl MinMaxOp for KeepMin {
    const REPLACE_ON: Ordering = Ordering::Less;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct KeepMax;

impl MinMaxOp for KeepMax {
    const REPLACE_ON: Ordering = Ordering::Greater;
}

#[derive(Debug, Clone, Copy)]
pub struct MinMaxImpl<O> {
    return_type: DataType,
    _op: PhantomData<O>,
}

impl<O> MinMaxImpl<O> {
    const fn new(return_type: DataType) -> Self {
        MinMaxImpl {
            return_type,
            _op: PhantomData,
        }
    }
}

impl<O: MinMaxOp> AggregateFunctionImpl for MinMaxImpl<O> {
    fn new_states(&self) -> Box<dyn AggregateGroupStates> {
        Box::new(TypedAggregateGroupStates::<MinMaxState<O>>::new(
            self.return_type,
        ))
    }
}

#[derive(Debug, Default)]
pub struct MinMaxState<O> {
    value: Option<ScalarValue>,
    _op: PhantomData<O>,
}

impl<O: MinMaxOp> MinMaxState<O> {
    fn consider(&mut self, v: ScalarValue) {
        if v.is_null() {
            return;
        }
        match &self.value {
            Some(curr) if v.total_cmp(curr) != O::REPLACE_ON => (),
            _ => self.value = Some(v),
        }
    }
}

impl<O: MinMaxOp> AggregateState for MinMaxState<O> {
    fn update(&mut self, inputs: &[ScalarValue]) -> Result<()> {
        if let Some(v) = inputs.first() {
            self.consider(v.clone());
        }
        Ok(())
    }

    fn merge(&mut self, other: &mut Self) -> Result<()> {
        if let Some(v) = other.value.take() {
            self.consider(v);
        }
        Ok(())
    }

    fn finalize(&self) -> Result<ScalarValue> {
        Ok(self.value.clone().unwrap_or(ScalarValue::Null))
    }

    fn serialize(&self, enc: &mut ByteEncoder) -> Result<()> {
        enc.put_scalar(self.value.as_ref().unwrap_or(&ScalarValue::Null))
    }

    fn deserialize(dec: &mut ByteDecoder) -> Result<Self> {
        let value = dec.get_scalar()?;
        Ok(MinMaxState {
            value: (!value.is_null()).then_some(value),
            _op: PhantomData,
        })
    }

    fn heap_size(&self) -> usize {
        match &self.value {
            Some(ScalarValue::Utf8(s)) => s.capacity(),
            Some(ScalarValue::Binary(b)) => b.capacity(),
            _ => 0,
        }
    }
}
