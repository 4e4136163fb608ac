//! Hash aggregation with spilling to disk.
//!
//! The grouping pass accumulates aggregate states in a table partitioned by
//! bucket. When the table grows past the memory threshold it's written to a
//! temporary file one bucket segment at a time and cleared. At the end of
//! input, either the in-memory table is read directly, or the remainder is
//! spilled as well and all files are merged one bucket at a time.

pub mod aggregator;
pub mod hash_table;
pub mod merge;
pub mod spill;

use aggspill_error::{DbError, Result};
use tracing::{debug, error};

use self::aggregator::{AggregateOutput, Aggregator, GroupingOutcome};
use self::hash_table::grouping::DirectOutput;
use self::merge::{MemoryEfficientMerger, MergeStats};
use self::spill::temporary::SpillStats;
use crate::arrays::batch::Batch;
use crate::arrays::datatype::DataType;
use crate::config::aggregate::{AggregateConfig, AggregateLayout};
use crate::execution::cancel::CancellationToken;
use crate::execution::source::BatchSource;

/// Observable phase of an aggregation driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverPhase {
    NotStarted,
    /// Grouping pass in progress.
    Running,
    DirectOutput,
    MergedOutput,
    Finished,
    Failed,
}

#[derive(Debug)]
enum DriverState {
    NotStarted,
    Running,
    DirectOutput(DirectOutput),
    MergedOutput(MemoryEfficientMerger),
    Finished,
    Failed,
}

/// Pull-based hash aggregate over an upstream source.
///
/// The first call to `read` runs the entire grouping pass, blocking until the
/// source is exhausted. Later calls read from whichever output was selected.
///
/// Cancellation ends the stream cleanly with `None`. Any error aborts the
/// run, releases temporary files, and makes every later `read` return an
/// error.
#[derive(Debug)]
pub struct AggregatingStream<S> {
    source: S,
    config: AggregateConfig,
    layout: AggregateLayout,
    output_types: Vec<DataType>,
    state: DriverState,
    spill_stats: SpillStats,
    merge_stats: MergeStats,
}

impl<S> AggregatingStream<S>
where
    S: BatchSource,
{
    /// Create a new driver, planning the aggregates against the source's
    /// types.
    pub fn try_new(source: S, config: AggregateConfig) -> Result<Self> {
        let layout = config.plan(source.datatypes())?;
        let output_types = layout.output_types(config.finalize_output);

        Ok(AggregatingStream {
            source,
            config,
            layout,
            output_types,
            state: DriverState::NotStarted,
            spill_stats: SpillStats::default(),
            merge_stats: MergeStats::default(),
        })
    }

    pub fn phase(&self) -> DriverPhase {
        match &self.state {
            DriverState::NotStarted => DriverPhase::NotStarted,
            DriverState::Running => DriverPhase::Running,
            DriverState::DirectOutput(_) => DriverPhase::DirectOutput,
            DriverState::MergedOutput(_) => DriverPhase::MergedOutput,
            DriverState::Finished => DriverPhase::Finished,
            DriverState::Failed => DriverPhase::Failed,
        }
    }

    /// Totals for temporary files written during the grouping pass.
    pub fn spill_stats(&self) -> SpillStats {
        self.spill_stats
    }

    pub fn merge_stats(&self) -> MergeStats {
        self.merge_stats
    }

    fn poll_next(&mut self, token: &CancellationToken) -> Result<Option<Batch>> {
        loop {
            match &mut self.state {
                DriverState::NotStarted => {
                    if token.is_cancelled() {
                        debug!("aggregation cancelled before start");
                        self.state = DriverState::Finished;
                        return Ok(None);
                    }
                    self.state = DriverState::Running;
                    self.state = self.run_grouping(token)?;
                }
                DriverState::Running => {
                    return Err(DbError::new("Aggregation grouping pass did not complete"));
                }
                DriverState::DirectOutput(output) => {
                    if token.is_cancelled() {
                        debug!("aggregation cancelled during output");
                        self.state = DriverState::Finished;
                        return Ok(None);
                    }
                    match output.next_batch()? {
                        Some(batch) => return Ok(Some(batch)),
                        None => {
                            self.state = DriverState::Finished;
                            return Ok(None);
                        }
                    }
                }
                DriverState::MergedOutput(merger) => {
                    let batch = merger.read(token)?;
                    self.merge_stats = merger.stats();
                    if batch.is_none() {
                        // Drops the merger, deleting temporary files.
                        self.state = DriverState::Finished;
                    }
                    return Ok(batch);
                }
                DriverState::Finished => return Ok(None),
                DriverState::Failed => {
                    return Err(DbError::new("Aggregation run aborted"));
                }
            }
        }
    }

    /// Run the grouping pass, returning the state to continue from.
    fn run_grouping(&mut self, token: &CancellationToken) -> Result<DriverState> {
        let mut aggregator = Aggregator::try_new(self.config.clone(), self.layout.clone())?;

        match aggregator.consume(&mut self.source, token)? {
            GroupingOutcome::Completed => (),
            GroupingOutcome::Cancelled => {
                self.spill_stats = aggregator.files().stats();
                return Ok(DriverState::Finished);
            }
        }

        Ok(match aggregator.finish()? {
            AggregateOutput::Direct(output) => DriverState::DirectOutput(output),
            AggregateOutput::Merged(merger) => {
                self.spill_stats = merger.spill_stats();
                DriverState::MergedOutput(merger)
            }
        })
    }
}

impl<S> BatchSource for AggregatingStream<S>
where
    S: BatchSource,
{
    fn datatypes(&self) -> &[DataType] {
        &self.output_types
    }

    fn read(&mut self, token: &CancellationToken) -> Result<Option<Batch>> {
        match self.poll_next(token) {
            Ok(batch) => Ok(batch),
            Err(e) => {
                if !matches!(self.state, DriverState::Failed) {
                    error!(%e, phase = ?self.phase(), "aggregation failed");
                    self.state = DriverState::Failed;
                }
                Err(e)
            }
        }
    }
}
