use std::collections::VecDeque;

use aggspill_error::{DbError, Result};
use tracing::debug;

use super::base::BaseHashTable;
use super::directory::Directory;
use crate::arrays::batch::Batch;
use crate::arrays::hash::{NO_GROUPS_HASH_VALUE, bucket_for_hash, hash_batch_columns};
use crate::arrays::row::ScalarRow;
use crate::arrays::scalar::ScalarValue;
use crate::config::aggregate::{AggregateConfig, AggregateLayout, OverflowMode};

/// Initial directory capacity for each per-bucket table.
const BUCKET_TABLE_CAPACITY: usize = 16;

/// Result of adding a batch to the grouping table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Keep reading input.
    Continue,
    /// Group limit reached with overflow mode `Break`, no more input should
    /// be read.
    LimitReached,
}

#[derive(Debug)]
enum TableRepr {
    /// Single table holding groups for every bucket.
    Flat(BaseHashTable),
    /// One table per bucket.
    TwoLevel(Vec<BaseHashTable>),
}

/// Reusable buffers for inserting a batch.
#[derive(Debug, Default)]
struct InsertBuffers {
    hashes: Vec<u64>,
    /// Row indices per target table.
    selections: Vec<Vec<usize>>,
    /// Group index per selected row, per target table.
    mappings: Vec<Vec<usize>>,
}

/// Grouping table partitioned by bucket.
///
/// Starts as a single flat table and switches to per-bucket tables once the
/// table grows past the two-level thresholds. Rows for keys that can't be
/// added once the group limit is reached are aggregated into a separate
/// overflow row when the overflow mode allows it.
#[derive(Debug)]
pub struct GroupingTable {
    layout: AggregateLayout,
    num_buckets: usize,
    repr: TableRepr,
    /// Single group table for the overflow row.
    overflow: Option<BaseHashTable>,
    /// Number of groups excluding the overflow row.
    num_groups: usize,
    two_level_threshold_rows: usize,
    two_level_threshold_bytes: usize,
    max_groups: Option<usize>,
    overflow_mode: OverflowMode,
    input_is_partial: bool,
    buffers: InsertBuffers,
}

impl GroupingTable {
    pub fn try_new(layout: AggregateLayout, config: &AggregateConfig) -> Result<Self> {
        let repr = TableRepr::Flat(BaseHashTable::try_new(&layout, Directory::DEFAULT_CAPACITY)?);

        Ok(GroupingTable {
            layout,
            num_buckets: config.num_buckets,
            repr,
            overflow: None,
            num_groups: 0,
            two_level_threshold_rows: config.two_level_threshold_rows,
            two_level_threshold_bytes: config.two_level_threshold_bytes,
            max_groups: config.max_groups,
            overflow_mode: config.overflow_mode,
            input_is_partial: config.input_is_partial,
            buffers: InsertBuffers::default(),
        })
    }

    pub fn layout(&self) -> &AggregateLayout {
        &self.layout
    }

    pub fn is_two_level(&self) -> bool {
        matches!(self.repr, TableRepr::TwoLevel(_))
    }

    /// Number of groups, not counting the overflow row.
    pub fn size_excluding_overflow(&self) -> usize {
        self.num_groups
    }

    pub fn has_overflow_row(&self) -> bool {
        self.overflow.as_ref().is_some_and(|t| !t.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.num_groups == 0 && !self.has_overflow_row()
    }

    /// Estimated bytes held by the table.
    ///
    /// Each underlying table keeps a running total, so this doesn't scan
    /// groups.
    pub fn estimated_bytes(&self) -> usize {
        let tables = match &self.repr {
            TableRepr::Flat(table) => table.size_bytes(),
            TableRepr::TwoLevel(tables) => tables.iter().map(|t| t.size_bytes()).sum(),
        };
        tables + self.overflow.as_ref().map(|t| t.size_bytes()).unwrap_or(0)
    }

    /// Add a batch of input rows to the table.
    ///
    /// Errors if the batch doesn't match the planned input types.
    pub fn add(&mut self, batch: &Batch) -> Result<AddOutcome> {
        self.layout.check_input(batch)?;

        let mut buffers = std::mem::take(&mut self.buffers);
        let result = self.add_with_buffers(batch, &mut buffers);
        self.buffers = buffers;
        let outcome = result?;

        self.maybe_convert_to_two_level()?;

        Ok(outcome)
    }

    fn add_with_buffers(&mut self, batch: &Batch, buffers: &mut InsertBuffers) -> Result<AddOutcome> {
        let num_rows = batch.num_rows();
        if num_rows == 0 {
            return Ok(AddOutcome::Continue);
        }

        hash_batch_columns(batch, &self.layout.group_columns, &mut buffers.hashes);

        // One target per table, plus the overflow row as the last target.
        let num_targets = self.num_tables() + 1;
        let overflow_target = num_targets - 1;
        buffers.selections.resize_with(num_targets, Vec::new);
        buffers.mappings.resize_with(num_targets, Vec::new);
        for (sel, mapping) in buffers.selections.iter_mut().zip(&mut buffers.mappings) {
            sel.clear();
            mapping.clear();
        }

        let mut outcome = AddOutcome::Continue;

        for row_idx in 0..num_rows {
            let hash = buffers.hashes[row_idx];
            let key: ScalarRow = self
                .layout
                .group_columns
                .iter()
                .map(|&col| batch.arrays()[col].value_unchecked(row_idx))
                .collect();

            let at_limit = self
                .max_groups
                .is_some_and(|max_groups| self.num_groups >= max_groups);

            let target = self.target_for_hash(hash);
            let table = self.table_mut(target)?;
            let before = table.num_groups();
            let group = table.find_or_insert_group(hash, &key, !at_limit)?;
            let added = table.num_groups() - before;

            match group {
                Some(group) => {
                    self.num_groups += added;
                    buffers.selections[target].push(row_idx);
                    buffers.mappings[target].push(group);
                }
                None => match self.overflow_mode {
                    OverflowMode::Throw => {
                        return Err(DbError::resource_exhausted(
                            "Limit for number of groups exceeded",
                        )
                        .with_field("max_groups", self.max_groups.unwrap_or_default()));
                    }
                    OverflowMode::Break => {
                        // Rows for existing groups in this batch are still
                        // aggregated.
                        outcome = AddOutcome::LimitReached;
                    }
                    OverflowMode::Any => {
                        let group = self.overflow_group()?;
                        buffers.selections[overflow_target].push(row_idx);
                        buffers.mappings[overflow_target].push(group);
                    }
                },
            }
        }

        for (target, (sel, mapping)) in buffers
            .selections
            .iter()
            .zip(&buffers.mappings)
            .enumerate()
        {
            if sel.is_empty() {
                continue;
            }

            // Selections are in ascending row order, a full selection is the
            // input itself.
            let selected;
            let input = if sel.len() == num_rows {
                batch
            } else {
                selected = batch.select(sel);
                &selected
            };

            let input_is_partial = self.input_is_partial;
            let layout = &self.layout;
            let table = match (&mut self.repr, target == overflow_target) {
                (_, true) => self
                    .overflow
                    .as_mut()
                    .ok_or_else(|| DbError::new("Missing overflow table"))?,
                (TableRepr::Flat(table), false) => table,
                (TableRepr::TwoLevel(tables), false) => &mut tables[target],
            };

            if input_is_partial {
                let columns: Vec<_> = layout
                    .aggregates
                    .iter()
                    .map(|agg| &input.arrays()[agg.inputs[0]])
                    .collect();
                table.merge_states(&columns, mapping)?;
            } else {
                table.update(&layout.aggregates, input, mapping)?;
            }
        }

        Ok(outcome)
    }

    /// Ensure the single group exists when aggregating without group
    /// columns.
    ///
    /// Aggregates over empty input with no group columns still produce one
    /// row.
    pub fn ensure_global_group(&mut self) -> Result<()> {
        if !self.layout.group_types.is_empty() || !self.is_empty() {
            return Ok(());
        }
        let target = self.target_for_hash(NO_GROUPS_HASH_VALUE);
        self.table_mut(target)?
            .find_or_insert_group(NO_GROUPS_HASH_VALUE, &ScalarRow::empty(), true)?;
        self.num_groups += 1;
        Ok(())
    }

    /// Produce partial state batches for every non-empty bucket in ascending
    /// bucket order, followed by the overflow row using `num_buckets` as its
    /// bucket id.
    ///
    /// Batches contain the group columns followed by one serialized state
    /// column per aggregate.
    pub fn for_each_bucket(&self, mut f: impl FnMut(usize, Batch) -> Result<()>) -> Result<()> {
        match &self.repr {
            TableRepr::Flat(table) => {
                for (bucket, groups) in table.partition_groups(self.num_buckets).iter().enumerate()
                {
                    if groups.is_empty() {
                        continue;
                    }
                    f(bucket, table.to_batch(groups, false)?)?;
                }
            }
            TableRepr::TwoLevel(tables) => {
                for (bucket, table) in tables.iter().enumerate() {
                    if table.is_empty() {
                        continue;
                    }
                    let groups: Vec<_> = (0..table.num_groups()).collect();
                    f(bucket, table.to_batch(&groups, false)?)?;
                }
            }
        }

        if let Some(overflow) = &self.overflow {
            if !overflow.is_empty() {
                f(self.num_buckets, overflow.to_batch(&[0], false)?)?;
            }
        }

        Ok(())
    }

    /// Clear all groups, keeping the current representation.
    pub fn reset(&mut self) -> Result<()> {
        self.repr = match &self.repr {
            TableRepr::Flat(_) => {
                TableRepr::Flat(BaseHashTable::try_new(&self.layout, Directory::DEFAULT_CAPACITY)?)
            }
            TableRepr::TwoLevel(_) => TableRepr::TwoLevel(self.new_bucket_tables()?),
        };
        self.overflow = None;
        self.num_groups = 0;
        Ok(())
    }

    /// Convert the table into a lazy stream of output batches.
    pub fn into_direct_output(self, finalize: bool, batch_size: usize) -> DirectOutput {
        let mut tables: VecDeque<_> = match self.repr {
            TableRepr::Flat(table) => [table].into(),
            TableRepr::TwoLevel(tables) => tables.into(),
        };
        if let Some(overflow) = self.overflow {
            tables.push_back(overflow);
        }

        DirectOutput {
            tables,
            offset: 0,
            finalize,
            batch_size,
        }
    }

    fn num_tables(&self) -> usize {
        match &self.repr {
            TableRepr::Flat(_) => 1,
            TableRepr::TwoLevel(tables) => tables.len(),
        }
    }

    fn target_for_hash(&self, hash: u64) -> usize {
        match &self.repr {
            TableRepr::Flat(_) => 0,
            TableRepr::TwoLevel(_) => bucket_for_hash(hash, self.num_buckets),
        }
    }

    fn table_mut(&mut self, target: usize) -> Result<&mut BaseHashTable> {
        match &mut self.repr {
            TableRepr::Flat(table) => Ok(table),
            TableRepr::TwoLevel(tables) => {
                let len = tables.len();
                tables.get_mut(target).ok_or_else(|| {
                    DbError::new("Bucket table index out of range")
                        .with_field("target", target)
                        .with_field("num_tables", len)
                })
            }
        }
    }

    /// Get the overflow row group, creating it if needed.
    fn overflow_group(&mut self) -> Result<usize> {
        if self.overflow.is_none() {
            self.overflow = Some(BaseHashTable::try_new(&self.layout, 1)?);
        }
        let key: ScalarRow = self
            .layout
            .group_types
            .iter()
            .map(|_| ScalarValue::Null)
            .collect();

        let overflow = self
            .overflow
            .as_mut()
            .ok_or_else(|| DbError::new("Missing overflow table"))?;
        overflow
            .find_or_insert_group(NO_GROUPS_HASH_VALUE, &key, true)?
            .ok_or_else(|| DbError::new("Failed to create overflow row"))
    }

    fn new_bucket_tables(&self) -> Result<Vec<BaseHashTable>> {
        (0..self.num_buckets)
            .map(|_| BaseHashTable::try_new(&self.layout, BUCKET_TABLE_CAPACITY))
            .collect()
    }

    fn maybe_convert_to_two_level(&mut self) -> Result<()> {
        if self.is_two_level() {
            return Ok(());
        }

        let rows_exceeded =
            self.two_level_threshold_rows != 0 && self.num_groups >= self.two_level_threshold_rows;
        let bytes_exceeded = self.two_level_threshold_bytes != 0
            && self.estimated_bytes() >= self.two_level_threshold_bytes;
        if !rows_exceeded && !bytes_exceeded {
            return Ok(());
        }

        let mut tables = self.new_bucket_tables()?;
        let flat = match std::mem::replace(&mut self.repr, TableRepr::TwoLevel(Vec::new())) {
            TableRepr::Flat(flat) => flat,
            TableRepr::TwoLevel(_) => return Err(DbError::new("Table already two level")),
        };

        let num_buckets = self.num_buckets;
        flat.drain_into(&mut tables, |hash| bucket_for_hash(hash, num_buckets))?;
        self.repr = TableRepr::TwoLevel(tables);

        debug!(
            num_groups = self.num_groups,
            num_buckets,
            estimated_bytes = self.estimated_bytes(),
            "converted grouping table to two level"
        );

        Ok(())
    }
}

/// Lazily produces output batches directly from an in-memory table.
#[derive(Debug)]
pub struct DirectOutput {
    tables: VecDeque<BaseHashTable>,
    /// Next group to emit from the front table.
    offset: usize,
    finalize: bool,
    batch_size: usize,
}

impl DirectOutput {
    pub fn next_batch(&mut self) -> Result<Option<Batch>> {
        loop {
            let table = match self.tables.front() {
                Some(table) => table,
                None => return Ok(None),
            };

            if self.offset >= table.num_groups() {
                // Table exhausted, release it.
                self.tables.pop_front();
                self.offset = 0;
                continue;
            }

            let end = usize::min(self.offset + self.batch_size, table.num_groups());
            let groups: Vec<_> = (self.offset..end).collect();
            let batch = table.to_batch(&groups, self.finalize)?;
            self.offset = end;

            return Ok(Some(batch));
        }
    }
}
