use aggspill_error::{DbError, OptionExt, Result};

use super::directory::{Directory, Entry};
use crate::arrays::array::{Array, ArrayBuilder};
use crate::arrays::batch::Batch;
use crate::arrays::datatype::DataType;
use crate::arrays::hash::bucket_for_hash;
use crate::arrays::row::ScalarRow;
use crate::config::aggregate::{AggregateLayout, PlannedAggregate};
use crate::functions::aggregate::states::{AggregateGroupStates, StateMapping};

/// Linear probing hash table for aggregates.
///
/// Groups are addressed by index. Index `i` refers to the `i`th key, hash,
/// and the `i`th state in every aggregate's group states.
#[derive(Debug)]
pub struct BaseHashTable {
    /// Hash table directory.
    pub(crate) directory: Directory,
    /// Group keys.
    keys: Vec<ScalarRow>,
    /// Hash for each key.
    hashes: Vec<u64>,
    /// States for each aggregate.
    states: Vec<Box<dyn AggregateGroupStates>>,
    group_types: Vec<DataType>,
    /// Running total of bytes used by keys and hashes.
    key_bytes: usize,
}

impl BaseHashTable {
    pub fn try_new(layout: &AggregateLayout, capacity: usize) -> Result<Self> {
        Ok(BaseHashTable {
            directory: Directory::try_with_capacity(capacity)?,
            keys: Vec::new(),
            hashes: Vec::new(),
            states: layout
                .aggregates
                .iter()
                .map(|agg| agg.function.new_states())
                .collect(),
            group_types: layout.group_types.clone(),
            key_bytes: 0,
        })
    }

    pub fn num_groups(&self) -> usize {
        debug_assert_eq!(self.keys.len(), self.directory.num_occupied);
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Find the group for a key, creating it if it doesn't exist and
    /// `allow_insert` is true.
    ///
    /// Returns None only if the group doesn't exist and inserting wasn't
    /// allowed.
    pub fn find_or_insert_group(
        &mut self,
        hash: u64,
        key: &ScalarRow,
        allow_insert: bool,
    ) -> Result<Option<usize>> {
        if self.directory.needs_resize(1) {
            let new_cap = self.directory.capacity() * 2;
            self.directory.resize(new_cap)?;
        }

        let keys = &self.keys;
        let offset = self.directory.probe(hash, |group| &keys[group] == key)?;

        if let Some(group) = self.directory.entries[offset].group {
            return Ok(Some(group));
        }
        if !allow_insert {
            return Ok(None);
        }

        let group = self.keys.len();
        self.key_bytes += key.size_bytes() + std::mem::size_of::<u64>();
        self.keys.push(key.clone());
        self.hashes.push(hash);
        for states in &mut self.states {
            states.new_groups(1);
        }

        self.directory.entries[offset] = Entry {
            hash,
            group: Some(group),
        };
        self.directory.num_occupied += 1;

        Ok(Some(group))
    }

    /// Update aggregate states using rows from `inputs`.
    ///
    /// `mapping[row]` is the group to update for each row in `inputs`.
    pub fn update(
        &mut self,
        aggregates: &[PlannedAggregate],
        inputs: &Batch,
        mapping: &[usize],
    ) -> Result<()> {
        debug_assert_eq!(inputs.num_rows(), mapping.len());

        for (agg, states) in aggregates.iter().zip(&mut self.states) {
            let arrays = agg
                .inputs
                .iter()
                .map(|&idx| inputs.column(idx).required("aggregate input column"))
                .collect::<Result<Vec<_>>>()?;
            states.update_states(&arrays, mapping)?;
        }
        Ok(())
    }

    /// Merge serialized states into this table, one state column per
    /// aggregate.
    pub fn merge_states(&mut self, state_columns: &[&Array], mapping: &[usize]) -> Result<()> {
        if state_columns.len() != self.states.len() {
            return Err(DbError::new("Unexpected number of state columns")
                .with_field("expected", self.states.len())
                .with_field("got", state_columns.len()));
        }

        for (states, column) in self.states.iter_mut().zip(state_columns) {
            states.merge_serialized(column, mapping)?;
        }
        Ok(())
    }

    /// Move every group in this table into one of `tables`, merging states
    /// with any existing groups.
    ///
    /// `select` picks the target table from a group's hash.
    pub fn drain_into(
        mut self,
        tables: &mut [BaseHashTable],
        select: impl Fn(u64) -> usize,
    ) -> Result<()> {
        let mut mappings: Vec<Vec<StateMapping>> = vec![Vec::new(); tables.len()];

        for (from, (key, &hash)) in self.keys.iter().zip(&self.hashes).enumerate() {
            let idx = select(hash);
            let to = tables[idx]
                .find_or_insert_group(hash, key, true)?
                .required("group to be inserted")?;
            mappings[idx].push(StateMapping { from, to });
        }

        for (table, mapping) in tables.iter_mut().zip(&mappings) {
            if mapping.is_empty() {
                continue;
            }
            for (dest, src) in table.states.iter_mut().zip(self.states.iter_mut()) {
                dest.combine(src.as_mut(), mapping)?;
            }
        }

        Ok(())
    }

    /// Group indices partitioned by bucket.
    ///
    /// The outer vec always has `num_buckets` entries.
    pub fn partition_groups(&self, num_buckets: usize) -> Vec<Vec<usize>> {
        let mut partitions = vec![Vec::new(); num_buckets];
        for (group, &hash) in self.hashes.iter().enumerate() {
            partitions[bucket_for_hash(hash, num_buckets)].push(group);
        }
        partitions
    }

    /// Produce a batch for the given groups.
    ///
    /// Columns are the group columns followed by one column per aggregate,
    /// either finalized values or serialized states.
    pub fn to_batch(&self, groups: &[usize], finalize: bool) -> Result<Batch> {
        let mut arrays = Vec::with_capacity(self.group_types.len() + self.states.len());

        for (col_idx, &datatype) in self.group_types.iter().enumerate() {
            let mut builder = ArrayBuilder::with_capacity(datatype, groups.len());
            for &group in groups {
                let key = self.keys.get(group).ok_or_else(|| {
                    DbError::new("Group index out of range")
                        .with_field("group", group)
                        .with_field("num_groups", self.keys.len())
                })?;
                builder.push(&key.columns[col_idx])?;
            }
            arrays.push(builder.finish());
        }

        for states in &self.states {
            let arr = if finalize {
                states.finalize_states(groups)?
            } else {
                states.serialize_states(groups)?
            };
            arrays.push(arr);
        }

        if arrays.is_empty() {
            return Ok(Batch::empty_with_num_rows(groups.len()));
        }
        Batch::try_new(arrays)
    }

    /// Estimated bytes held by this table.
    pub fn size_bytes(&self) -> usize {
        let states: usize = self.states.iter().map(|s| s.size_bytes()).sum();
        self.directory.size_bytes() + self.key_bytes + states
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arrays::hash::hash_row;
    use crate::arrays::scalar::ScalarValue;
    use crate::config::aggregate::{AggregateConfig, AggregateSpec};
    use crate::functions::aggregate::builtin::count::Count;
    use crate::functions::aggregate::builtin::sum::Sum;
    use crate::generate_batch;

    fn test_layout() -> AggregateLayout {
        AggregateConfig::new(
            [0],
            vec![AggregateSpec::new(&Sum, [1]), AggregateSpec::new(&Count, [])],
        )
        .plan(&[DataType::Utf8, DataType::Int64])
        .unwrap()
    }

    fn key(s: &str) -> ScalarRow {
        ScalarRow::from_iter([ScalarValue::from(s)])
    }

    fn insert_all(table: &mut BaseHashTable, keys: &[&str]) -> Vec<usize> {
        keys.iter()
            .map(|k| {
                let key = key(k);
                table
                    .find_or_insert_group(hash_row(&key), &key, true)
                    .unwrap()
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn insert_finds_existing() {
        let layout = test_layout();
        let mut table = BaseHashTable::try_new(&layout, 16).unwrap();

        let groups = insert_all(&mut table, &["a", "b", "a", "c", "b"]);
        assert_eq!(vec![0, 1, 0, 2, 1], groups);
        assert_eq!(3, table.num_groups());
    }

    #[test]
    fn insert_not_allowed() {
        let layout = test_layout();
        let mut table = BaseHashTable::try_new(&layout, 16).unwrap();
        insert_all(&mut table, &["a"]);

        let b = key("b");
        assert_eq!(
            None,
            table.find_or_insert_group(hash_row(&b), &b, false).unwrap()
        );
        let a = key("a");
        assert_eq!(
            Some(0),
            table.find_or_insert_group(hash_row(&a), &a, false).unwrap()
        );
    }

    #[test]
    fn grows_past_initial_capacity() {
        let layout = test_layout();
        let mut table = BaseHashTable::try_new(&layout, 2).unwrap();

        let keys: Vec<String> = (0..100).map(|i| format!("k{i}")).collect();
        let refs: Vec<&str> = keys.iter().map(|s| s.as_str()).collect();
        insert_all(&mut table, &refs);
        insert_all(&mut table, &refs);

        assert_eq!(100, table.num_groups());
        assert!(table.directory.capacity() >= 128);
    }

    #[test]
    fn update_then_batch() {
        let layout = test_layout();
        let mut table = BaseHashTable::try_new(&layout, 16).unwrap();

        let input = generate_batch!(["a", "b", "a"], [1i64, 2, 3]);
        let mapping = insert_all(&mut table, &["a", "b", "a"]);
        table.update(&layout.aggregates, &input, &mapping).unwrap();

        let out = table.to_batch(&[0, 1], true).unwrap();
        let expected = generate_batch!(["a", "b"], [4i64, 2], [2i64, 1]);
        assert_eq!(expected, out);
    }

    #[test]
    fn drain_into_merges_states() {
        let layout = test_layout();
        let mut table = BaseHashTable::try_new(&layout, 16).unwrap();
        let input = generate_batch!(["a", "b", "c"], [1i64, 2, 3]);
        let mapping = insert_all(&mut table, &["a", "b", "c"]);
        table.update(&layout.aggregates, &input, &mapping).unwrap();

        let mut targets = vec![
            BaseHashTable::try_new(&layout, 4).unwrap(),
            BaseHashTable::try_new(&layout, 4).unwrap(),
        ];
        // Pre-existing group in a target.
        let a = key("a");
        let target_idx = (hash_row(&a) % 2) as usize;
        let group = insert_all(&mut targets[target_idx], &["a"]);
        targets[target_idx]
            .update(&layout.aggregates, &generate_batch!(["a"], [10i64]), &group)
            .unwrap();

        table.drain_into(&mut targets, |hash| (hash % 2) as usize).unwrap();

        let total: usize = targets.iter().map(|t| t.num_groups()).sum();
        assert_eq!(3, total);

        let a_group = targets[target_idx]
            .find_or_insert_group(hash_row(&a), &a, false)
            .unwrap()
            .unwrap();
        let out = targets[target_idx].to_batch(&[a_group], true).unwrap();
        assert_eq!(generate_batch!(["a"], [11i64], [2i64]), out);
    }

    #[test]
    fn serialized_states_merge() {
        let layout = test_layout();
        let mut table = BaseHashTable::try_new(&layout, 16).unwrap();
        let input = generate_batch!(["a", "a"], [1i64, 2]);
        let mapping = insert_all(&mut table, &["a", "a"]);
        table.update(&layout.aggregates, &input, &mapping).unwrap();

        let partial = table.to_batch(&[0], false).unwrap();
        assert_eq!(
            vec![DataType::Utf8, DataType::Binary, DataType::Binary],
            partial.datatypes()
        );

        let mut other = BaseHashTable::try_new(&layout, 16).unwrap();
        let mapping = insert_all(&mut other, &["a"]);
        let columns: Vec<_> = partial.arrays()[1..].iter().collect();
        other.merge_states(&columns, &mapping).unwrap();
        other.merge_states(&columns, &mapping).unwrap();

        let out = other.to_batch(&[0], true).unwrap();
        assert_eq!(generate_batch!(["a"], [6i64], [4i64]), out);
    }

    #[test]
    fn partition_groups_by_bucket() {
        let layout = test_layout();
        let mut table = BaseHashTable::try_new(&layout, 16).unwrap();
        let keys: Vec<String> = (0..50).map(|i| format!("k{i}")).collect();
        let refs: Vec<&str> = keys.iter().map(|s| s.as_str()).collect();
        insert_all(&mut table, &refs);

        let partitions = table.partition_groups(8);
        assert_eq!(8, partitions.len());
        for (bucket, groups) in partitions.iter().enumerate() {
            for &group in groups {
                assert_eq!(bucket, bucket_for_hash(table.hashes[group], 8));
            }
        }
        assert_eq!(50, partitions.iter().map(|p| p.len()).sum::<usize>());
    }
}
