use aggspill_error::{DbError, Result};
use tracing::{debug, trace};

use super::hash_table::grouping::{AddOutcome, DirectOutput, GroupingTable};
use super::merge::MemoryEfficientMerger;
use super::spill::temporary::TemporaryFiles;
use crate::config::aggregate::{AggregateConfig, AggregateLayout};
use crate::execution::cancel::CancellationToken;
use crate::execution::source::BatchSource;

const MIB: f64 = 1024.0 * 1024.0;

/// How the grouping pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupingOutcome {
    /// Input was fully consumed, or consumption stopped at the group limit.
    Completed,
    /// Cancellation was observed between batches.
    Cancelled,
}

/// Output source selected once the grouping pass is done.
#[derive(Debug)]
pub enum AggregateOutput {
    /// Nothing was spilled, groups are read straight from the table.
    Direct(DirectOutput),
    /// One or more temporary files are merged bucket by bucket.
    Merged(MemoryEfficientMerger),
}

/// Runs the grouping pass for a single aggregation.
///
/// Input batches are added to the grouping table. After every batch the
/// table's estimated size is compared against the memory threshold, and the
/// full table is spilled to a new temporary file once it's exceeded.
#[derive(Debug)]
pub struct Aggregator {
    config: AggregateConfig,
    table: GroupingTable,
    files: TemporaryFiles,
    batches_consumed: usize,
}

impl Aggregator {
    pub fn try_new(config: AggregateConfig, layout: AggregateLayout) -> Result<Self> {
        let table = GroupingTable::try_new(layout, &config)?;
        let files = TemporaryFiles::new(config.tmp_path.clone());

        Ok(Aggregator {
            config,
            table,
            files,
            batches_consumed: 0,
        })
    }

    /// Temporary files written so far.
    pub fn files(&self) -> &TemporaryFiles {
        &self.files
    }

    /// Consume the source until it's exhausted.
    ///
    /// Cancellation is checked before pulling each batch. On cancellation
    /// the in-memory state is left as is, dropping the aggregator releases
    /// it along with any temporary files.
    pub fn consume<S>(&mut self, source: &mut S, token: &CancellationToken) -> Result<GroupingOutcome>
    where
        S: BatchSource + ?Sized,
    {
        loop {
            if token.is_cancelled() {
                debug!(batches = self.batches_consumed, "grouping cancelled");
                return Ok(GroupingOutcome::Cancelled);
            }

            let batch = match source.read(token)? {
                Some(batch) => batch,
                None => break,
            };
            self.batches_consumed += 1;

            let outcome = self.table.add(&batch)?;
            self.check_memory()?;

            if outcome == AddOutcome::LimitReached {
                debug!(
                    num_groups = self.table.size_excluding_overflow(),
                    "group limit reached, not reading remaining input"
                );
                break;
            }
        }

        Ok(GroupingOutcome::Completed)
    }

    fn check_memory(&mut self) -> Result<()> {
        let estimated = self.table.estimated_bytes();
        if self.table.is_empty() || estimated <= self.config.memory_threshold_bytes {
            return Ok(());
        }

        if !self.config.spill_enabled {
            return Err(DbError::resource_exhausted(
                "Memory limit for aggregation exceeded and spilling is disabled",
            )
            .with_field("estimated_bytes", estimated)
            .with_field("memory_threshold_bytes", self.config.memory_threshold_bytes));
        }

        trace!(
            estimated_bytes = estimated,
            threshold = self.config.memory_threshold_bytes,
            "memory threshold exceeded"
        );
        self.spill()
    }

    /// Write the table to a new temporary file and clear it.
    pub fn spill(&mut self) -> Result<()> {
        let mut writer = self.files.create_writer()?;
        self.table
            .for_each_bucket(|bucket, batch| writer.write_segment(bucket, &batch))?;
        let file = writer.finish()?;

        let stats = file.stats();
        debug!(
            path = %file.path().display(),
            two_level = self.table.is_two_level(),
            segments = stats.segments,
            rows = stats.rows,
            compressed_bytes = stats.compressed_bytes,
            uncompressed_bytes = stats.uncompressed_bytes,
            "wrote temporary file"
        );

        self.files.push(file);
        self.table.reset()
    }

    /// Select the output source.
    ///
    /// If anything was spilled, the remaining groups are written as one more
    /// temporary file so every source is merged the same way.
    pub fn finish(mut self) -> Result<AggregateOutput> {
        if self.files.is_empty() {
            self.table.ensure_global_group()?;
            debug!(
                num_groups = self.table.size_excluding_overflow(),
                overflow_row = self.table.has_overflow_row(),
                "aggregating directly from memory"
            );
            let output = self
                .table
                .into_direct_output(self.config.finalize_output, self.config.batch_size);
            return Ok(AggregateOutput::Direct(output));
        }

        if !self.table.is_empty() {
            self.spill()?;
        }

        let stats = self.files.stats();
        debug!(
            num_files = stats.num_files,
            compressed_mib = stats.compressed_bytes as f64 / MIB,
            uncompressed_mib = stats.uncompressed_bytes as f64 / MIB,
            "will merge temporary files"
        );

        let layout = self.table.layout().clone();
        let merger = MemoryEfficientMerger::try_new(
            self.files,
            layout,
            self.config.num_buckets,
            self.config.finalize_output,
        )?;
        Ok(AggregateOutput::Merged(merger))
    }
}

#[cfg(test)]
mod tests {
    use aggspill_error::ErrorKind;

    use super::*;
    use crate::arrays::batch::Batch;
    use crate::arrays::datatype::DataType;
    use crate::arrays::hash::{bucket_for_hash, hash_row};
    use crate::arrays::row::ScalarRow;
    use crate::config::aggregate::{AggregateSpec, OverflowMode};
    use crate::functions::aggregate::builtin::count::Count;
    use crate::functions::aggregate::builtin::sum::Sum;
    use crate::testutil::{VecSource, sorted_rows};
    use crate::{generate_batch, row};

    fn test_config(dir: &std::path::Path) -> AggregateConfig {
        let mut config = AggregateConfig::new(
            [0],
            vec![AggregateSpec::new(&Count, []), AggregateSpec::new(&Sum, [1])],
        );
        config.num_buckets = 8;
        config.tmp_path = Some(dir.to_path_buf());
        config
    }

    fn test_source() -> VecSource {
        VecSource::new(
            vec![DataType::Utf8, DataType::Int64],
            vec![
                generate_batch!(["a", "b", "c"], [1i64, 2, 3]),
                generate_batch!(["b", "d"], [4i64, 5]),
                generate_batch!(["a", "e", "c"], [6i64, 7, 8]),
            ],
        )
    }

    fn new_aggregator(config: AggregateConfig) -> Aggregator {
        let layout = config.plan(&[DataType::Utf8, DataType::Int64]).unwrap();
        Aggregator::try_new(config, layout).unwrap()
    }

    fn drain(output: AggregateOutput) -> Vec<Batch> {
        let token = CancellationToken::new();
        let mut batches = Vec::new();
        match output {
            AggregateOutput::Direct(mut out) => {
                while let Some(batch) = out.next_batch().unwrap() {
                    batches.push(batch);
                }
            }
            AggregateOutput::Merged(mut merger) => {
                while let Some(batch) = merger.read(&token).unwrap() {
                    batches.push(batch);
                }
            }
        }
        batches
    }

    fn expected_rows() -> Vec<ScalarRow> {
        vec![
            row!["a", 2i64, 7i64],
            row!["b", 2i64, 6i64],
            row!["c", 2i64, 11i64],
            row!["d", 1i64, 5i64],
            row!["e", 1i64, 7i64],
        ]
    }

    #[test]
    fn direct_without_spill() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = new_aggregator(test_config(dir.path()));

        let outcome = agg
            .consume(&mut test_source(), &CancellationToken::new())
            .unwrap();
        assert_eq!(GroupingOutcome::Completed, outcome);
        assert!(agg.files().is_empty());

        let output = agg.finish().unwrap();
        assert!(matches!(output, AggregateOutput::Direct(_)));
        assert_eq!(expected_rows(), sorted_rows(&drain(output)));
    }

    #[test]
    fn spill_every_batch() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.memory_threshold_bytes = 1;
        let mut agg = new_aggregator(config);

        agg.consume(&mut test_source(), &CancellationToken::new())
            .unwrap();
        assert_eq!(3, agg.files().len());
        assert!(agg.table.is_empty());

        let output = agg.finish().unwrap();
        assert!(matches!(output, AggregateOutput::Merged(_)));
        assert_eq!(expected_rows(), sorted_rows(&drain(output)));

        // Merger dropped, files removed.
        assert_eq!(0, std::fs::read_dir(dir.path()).unwrap().count());
    }

    #[test]
    fn remainder_flushed_as_final_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = new_aggregator(test_config(dir.path()));
        let mut source = test_source();
        let token = CancellationToken::new();

        // Spill after the first batch only.
        let first = source.read(&token).unwrap().unwrap();
        agg.table.add(&first).unwrap();
        agg.spill().unwrap();
        agg.consume(&mut source, &token).unwrap();
        assert_eq!(1, agg.files().len());

        let output = agg.finish().unwrap();
        match &output {
            AggregateOutput::Merged(merger) => assert_eq!(2, merger.num_files()),
            other => panic!("unexpected output: {other:?}"),
        }
        assert_eq!(expected_rows(), sorted_rows(&drain(output)));
    }

    #[test]
    fn spilled_segments_match_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.memory_threshold_bytes = 1;
        let num_buckets = config.num_buckets;
        let mut agg = new_aggregator(config);
        agg.consume(&mut test_source(), &CancellationToken::new())
            .unwrap();

        let state_types = agg.table.layout().state_types();
        for file in agg.files().files() {
            let mut reader = file.open_reader(state_types.clone()).unwrap();
            while let Some(bucket) = reader.peek_bucket().unwrap() {
                let segment = reader.read_segment().unwrap();
                for row in segment.rows() {
                    let key = ScalarRow::from_iter([row.columns[0].clone()]);
                    assert_eq!(bucket, bucket_for_hash(hash_row(&key), num_buckets));
                }
            }
        }
    }

    #[test]
    fn threshold_exceeded_without_spill() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.memory_threshold_bytes = 1;
        config.spill_enabled = false;
        let mut agg = new_aggregator(config);

        let err = agg
            .consume(&mut test_source(), &CancellationToken::new())
            .unwrap_err();
        assert_eq!(ErrorKind::ResourceExhausted, err.kind());
        assert!(agg.files().is_empty());
    }

    #[test]
    fn cancelled_before_first_batch() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = new_aggregator(test_config(dir.path()));
        let token = CancellationToken::new();
        token.cancel();

        let mut source = test_source();
        let outcome = agg.consume(&mut source, &token).unwrap();
        assert_eq!(GroupingOutcome::Cancelled, outcome);
        assert_eq!(0, source.batches_read());
    }

    #[test]
    fn break_stops_reading_input() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.max_groups = Some(2);
        config.overflow_mode = OverflowMode::Break;
        let mut agg = new_aggregator(config);

        let mut source = test_source();
        agg.consume(&mut source, &CancellationToken::new())
            .unwrap();
        assert_eq!(1, source.batches_read());

        let rows = sorted_rows(&drain(agg.finish().unwrap()));
        assert_eq!(vec![row!["a", 1i64, 1i64], row!["b", 1i64, 2i64]], rows);
    }

    #[test]
    fn unwritable_tmp_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir.path().join("missing"));
        config.memory_threshold_bytes = 1;
        let mut agg = new_aggregator(config);

        let err = agg
            .consume(&mut test_source(), &CancellationToken::new())
            .unwrap_err();
        assert_eq!(ErrorKind::SpillWriteFailed, err.kind());
    }
}
