use std::any::Any;
use std::fmt::Debug;

use aggspill_error::{DbError, Result};

use crate::arrays::array::{Array, ArrayBuilder, ArrayData};
use crate::arrays::datatype::DataType;
use crate::arrays::encoding::{ByteDecoder, ByteEncoder};
use crate::arrays::scalar::ScalarValue;

/// State for a single group's aggregate.
///
/// An example state for SUM would be a struct that takes a running sum from
/// values provided in `update`.
///
/// States are opaque to the grouping and spill machinery. They only need to
/// be updatable, mergeable, and able to round trip through bytes.
pub trait AggregateState: Debug + Default + Send + 'static {
    /// Update this state with the input values for a single row.
    fn update(&mut self, inputs: &[ScalarValue]) -> Result<()>;

    /// Merge other state into this state.
    fn merge(&mut self, other: &mut Self) -> Result<()>;

    /// Produce the final value for this state.
    fn finalize(&self) -> Result<ScalarValue>;

    /// Serialize the state, appending to the encoder.
    fn serialize(&self, enc: &mut ByteEncoder) -> Result<()>;

    /// Deserialize a state previously written with `serialize`.
    fn deserialize(dec: &mut ByteDecoder) -> Result<Self>;

    /// Bytes allocated on the heap by this state.
    fn heap_size(&self) -> usize {
        0
    }
}

/// Mapping of a state in one set of group states to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateMapping {
    /// Index of the state we're consuming.
    pub from: usize,
    /// Index of the state we're merging into.
    pub to: usize,
}

/// States for all groups for one aggregate.
///
/// Groups are addressed by their index in the owning hash table.
pub trait AggregateGroupStates: Debug + Send {
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Number of group states.
    fn num_groups(&self) -> usize;

    /// Allocate `count` additional empty states.
    fn new_groups(&mut self, count: usize);

    /// Update states using the aggregate inputs.
    ///
    /// `mapping[row]` is the group index to update for that row.
    fn update_states(&mut self, inputs: &[&Array], mapping: &[usize]) -> Result<()>;

    /// Merge serialized states into existing states.
    ///
    /// `states` must be a binary array produced by `serialize_states`.
    /// `mapping[row]` is the group index to merge into.
    fn merge_serialized(&mut self, states: &Array, mapping: &[usize]) -> Result<()>;

    /// Combine states from `consume` into self, draining the consumed states.
    ///
    /// `consume` must have the same concrete type as self.
    fn combine(
        &mut self,
        consume: &mut dyn AggregateGroupStates,
        mapping: &[StateMapping],
    ) -> Result<()>;

    /// Serialize the states for the given groups into a binary array.
    fn serialize_states(&self, groups: &[usize]) -> Result<Array>;

    /// Finalize the states for the given groups.
    fn finalize_states(&self, groups: &[usize]) -> Result<Array>;

    /// Estimated memory used by these states.
    fn size_bytes(&self) -> usize;
}

#[derive(Debug)]
pub struct TypedAggregateGroupStates<S> {
    states: Vec<S>,
    return_type: DataType,
    /// Running total of heap bytes across all states.
    heap_bytes: usize,
    /// Reusable buffer for row inputs.
    row_inputs: Vec<ScalarValue>,
}

impl<S> TypedAggregateGroupStates<S>
where
    S: AggregateState,
{
    pub fn new(return_type: DataType) -> Self {
        TypedAggregateGroupStates {
            states: Vec::new(),
            return_type,
            heap_bytes: 0,
            row_inputs: Vec::new(),
        }
    }

    fn state_mut(&mut self, idx: usize) -> Result<&mut S> {
        let len = self.states.len();
        self.states.get_mut(idx).ok_or_else(|| {
            DbError::new("Group state index out of range")
                .with_field("idx", idx)
                .with_field("len", len)
        })
    }

    fn state(&self, idx: usize) -> Result<&S> {
        self.states.get(idx).ok_or_else(|| {
            DbError::new("Group state index out of range")
                .with_field("idx", idx)
                .with_field("len", self.states.len())
        })
    }
}

impl<S> AggregateGroupStates for TypedAggregateGroupStates<S>
where
    S: AggregateState,
{
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn num_groups(&self) -> usize {
        self.states.len()
    }

    fn new_groups(&mut self, count: usize) {
        self.states.extend(std::iter::repeat_with(S::default).take(count));
    }

    fn update_states(&mut self, inputs: &[&Array], mapping: &[usize]) -> Result<()> {
        for (row_idx, &group_idx) in mapping.iter().enumerate() {
            let mut row_inputs = std::mem::take(&mut self.row_inputs);
            row_inputs.clear();
            row_inputs.extend(inputs.iter().map(|arr| arr.value_unchecked(row_idx)));

            let state = self.state_mut(group_idx)?;
            let before = state.heap_size();
            state.update(&row_inputs)?;
            let after = state.heap_size();

            self.heap_bytes = (self.heap_bytes + after).saturating_sub(before);
            self.row_inputs = row_inputs;
        }
        Ok(())
    }

    fn merge_serialized(&mut self, states: &Array, mapping: &[usize]) -> Result<()> {
        let serialized = match states.data() {
            ArrayData::Binary(v) => v,
            _ => {
                return Err(DbError::new("Expected binary array for serialized states")
                    .with_field("datatype", states.datatype()));
            }
        };

        for (row_idx, &group_idx) in mapping.iter().enumerate() {
            if !states.is_valid(row_idx) {
                continue;
            }
            let mut dec = ByteDecoder::new(&serialized[row_idx]);
            let mut other = S::deserialize(&mut dec)?;
            if dec.remaining() != 0 {
                return Err(DbError::new("Trailing bytes after aggregate state")
                    .with_field("remaining", dec.remaining()));
            }

            let state = self.state_mut(group_idx)?;
            let before = state.heap_size();
            state.merge(&mut other)?;
            let after = state.heap_size();
            self.heap_bytes = (self.heap_bytes + after).saturating_sub(before);
        }
        Ok(())
    }

    fn combine(
        &mut self,
        consume: &mut dyn AggregateGroupStates,
        mapping: &[StateMapping],
    ) -> Result<()> {
        let other = consume
            .as_any_mut()
            .downcast_mut::<Self>()
            .ok_or_else(|| DbError::new("Attempted to combine aggregate states of different types"))?;

        for m in mapping {
            let mut consume_state = std::mem::take(other.state_mut(m.from)?);
            other.heap_bytes = other.heap_bytes.saturating_sub(consume_state.heap_size());

            let state = self.state_mut(m.to)?;
            let before = state.heap_size();
            state.merge(&mut consume_state)?;
            let after = state.heap_size();
            self.heap_bytes = (self.heap_bytes + after).saturating_sub(before);
        }
        Ok(())
    }

    fn serialize_states(&self, groups: &[usize]) -> Result<Array> {
        let mut values = Vec::with_capacity(groups.len());
        for &idx in groups {
            let mut buf = Vec::new();
            self.state(idx)?.serialize(&mut ByteEncoder::new(&mut buf))?;
            values.push(buf);
        }
        Ok(Array {
            datatype: DataType::Binary,
            validity: None,
            data: ArrayData::Binary(values),
        })
    }

    fn finalize_states(&self, groups: &[usize]) -> Result<Array> {
        let mut builder = ArrayBuilder::with_capacity(self.return_type, groups.len());
        for &idx in groups {
            let value = self.state(idx)?.finalize()?;
            builder.push(&value)?;
        }
        Ok(builder.finish())
    }

    fn size_bytes(&self) -> usize {
        self.states.len() * std::mem::size_of::<S>() + self.heap_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::aggregate::builtin::sum::SumInt64State;

    #[test]
    fn update_and_finalize() {
        let mut states = TypedAggregateGroupStates::<SumInt64State>::new(DataType::Int64);
        states.new_groups(2);

        let input = Array::from_iter([1i64, 2, 3, 4]);
        states.update_states(&[&input], &[0, 1, 0, 1]).unwrap();

        let out = states.finalize_states(&[0, 1]).unwrap();
        assert_eq!(Array::from_iter([4i64, 6]), out);
    }

    #[test]
    fn serialize_then_merge() {
        let mut states = TypedAggregateGroupStates::<SumInt64State>::new(DataType::Int64);
        states.new_groups(2);
        let input = Array::from_iter([5i64, 7]);
        states.update_states(&[&input], &[0, 1]).unwrap();

        let serialized = states.serialize_states(&[1, 0]).unwrap();

        let mut other = TypedAggregateGroupStates::<SumInt64State>::new(DataType::Int64);
        other.new_groups(1);
        other.merge_serialized(&serialized, &[0, 0]).unwrap();

        let out = other.finalize_states(&[0]).unwrap();
        assert_eq!(Array::from_iter([12i64]), out);
    }

    #[test]
    fn combine_drains_consumed() {
        let mut a = TypedAggregateGroupStates::<SumInt64State>::new(DataType::Int64);
        a.new_groups(1);
        let mut b = TypedAggregateGroupStates::<SumInt64State>::new(DataType::Int64);
        b.new_groups(2);
        b.update_states(&[&Array::from_iter([3i64, 4])], &[0, 1])
            .unwrap();

        a.combine(
            &mut b,
            &[StateMapping { from: 0, to: 0 }, StateMapping { from: 1, to: 0 }],
        )
        .unwrap();

        assert_eq!(Array::from_iter([7i64]), a.finalize_states(&[0]).unwrap());
    }

    #[test]
    fn merge_serialized_rejects_garbage() {
        let mut states = TypedAggregateGroupStates::<SumInt64State>::new(DataType::Int64);
        states.new_groups(1);
        let garbage = Array {
            datatype: DataType::Binary,
            validity: None,
            data: ArrayData::Binary(vec![vec![1, 2]]),
        };
        assert!(states.merge_serialized(&garbage, &[0]).is_err());
    }
}
