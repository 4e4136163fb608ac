use aggspill_error::{DbError, Result};
use tracing::{debug, trace};

use super::hash_table::base::BaseHashTable;
use super::spill::reader::SpillReader;
use super::spill::temporary::{SpillStats, TemporaryFiles};
use crate::arrays::batch::Batch;
use crate::arrays::hash::{bucket_for_hash, hash_batch_columns};
use crate::arrays::row::ScalarRow;
use crate::config::aggregate::AggregateLayout;
use crate::execution::cancel::CancellationToken;

/// Initial directory capacity for the per-bucket merge table.
const MERGE_TABLE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Number of buckets fully merged and emitted.
    pub buckets_merged: usize,
    /// Largest estimated bytes held while merging a single bucket.
    pub peak_bucket_bytes: usize,
}

/// Merges temporary files one bucket at a time.
///
/// Every file holds segments in increasing bucket order. Each call to `read`
/// picks the smallest bucket across all files, merges that bucket's segment
/// from every file into a fresh table, and emits the table as a single batch.
/// Only one bucket's groups are held in memory at a time.
#[derive(Debug)]
pub struct MemoryEfficientMerger {
    /// Owns the files being read. Dropping the merger deletes them.
    files: TemporaryFiles,
    readers: Vec<SpillReader>,
    layout: AggregateLayout,
    finalize: bool,
    /// Number of real buckets, the overflow row uses this as its id.
    num_buckets: usize,
    stats: MergeStats,
    spill_stats: SpillStats,
    /// Reusable hash buffer.
    hashes: Vec<u64>,
    finished: bool,
}

impl MemoryEfficientMerger {
    pub fn try_new(
        files: TemporaryFiles,
        layout: AggregateLayout,
        num_buckets: usize,
        finalize: bool,
    ) -> Result<Self> {
        let state_types = layout.state_types();
        let readers = files
            .files()
            .iter()
            .map(|file| file.open_reader(state_types.clone()))
            .collect::<Result<Vec<_>>>()?;
        let spill_stats = files.stats();

        Ok(MemoryEfficientMerger {
            files,
            readers,
            layout,
            finalize,
            num_buckets,
            stats: MergeStats::default(),
            spill_stats,
            hashes: Vec::new(),
            finished: false,
        })
    }

    pub fn stats(&self) -> MergeStats {
        self.stats
    }

    pub fn spill_stats(&self) -> SpillStats {
        self.spill_stats
    }

    /// Number of files being merged.
    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    /// Produce the merged batch for the next bucket.
    ///
    /// Cancellation is checked before starting a bucket. A bucket is either
    /// emitted in full or not at all.
    pub fn read(&mut self, token: &CancellationToken) -> Result<Option<Batch>> {
        if self.finished {
            return Ok(None);
        }
        if token.is_cancelled() {
            debug!("merge cancelled");
            self.finished = true;
            return Ok(None);
        }

        let bucket = match self.next_bucket()? {
            Some(bucket) => bucket,
            None => {
                debug!(
                    buckets_merged = self.stats.buckets_merged,
                    peak_bucket_bytes = self.stats.peak_bucket_bytes,
                    "merge complete"
                );
                self.finished = true;
                return Ok(None);
            }
        };

        let batch = self.merge_bucket(bucket)?;
        Ok(Some(batch))
    }

    /// Smallest bucket across all readers.
    fn next_bucket(&mut self) -> Result<Option<usize>> {
        let mut min: Option<usize> = None;
        for reader in &mut self.readers {
            if let Some(bucket) = reader.peek_bucket()? {
                if bucket > self.num_buckets {
                    return Err(DbError::spill_read("Bucket id out of range")
                        .with_field("path", reader.path().display())
                        .with_field("bucket", bucket)
                        .with_field("num_buckets", self.num_buckets));
                }
                min = Some(min.map_or(bucket, |m| m.min(bucket)));
            }
        }
        Ok(min)
    }

    fn merge_bucket(&mut self, bucket: usize) -> Result<Batch> {
        let mut table = BaseHashTable::try_new(&self.layout, MERGE_TABLE_CAPACITY)?;
        let group_columns: Vec<_> = (0..self.layout.group_types.len()).collect();
        let num_groups = group_columns.len();

        let mut sources = 0;
        let mut largest_segment = 0;
        let mut mapping = Vec::new();

        for reader in &mut self.readers {
            if reader.peek_bucket()? != Some(bucket) {
                continue;
            }
            let segment = reader.read_segment()?;
            sources += 1;
            largest_segment = largest_segment.max(segment.size_bytes());

            hash_batch_columns(&segment, &group_columns, &mut self.hashes);
            mapping.clear();
            for (row_idx, &hash) in self.hashes.iter().enumerate() {
                // The overflow segment holds keys from every bucket.
                if bucket < self.num_buckets && bucket_for_hash(hash, self.num_buckets) != bucket {
                    return Err(DbError::spill_read("Segment holds a key from another bucket")
                        .with_field("path", reader.path().display())
                        .with_field("bucket", bucket)
                        .with_field("key_bucket", bucket_for_hash(hash, self.num_buckets)));
                }
                let key: ScalarRow = segment.arrays()[..num_groups]
                    .iter()
                    .map(|arr| arr.value_unchecked(row_idx))
                    .collect();
                let group = table
                    .find_or_insert_group(hash, &key, true)?
                    .ok_or_else(|| DbError::new("Failed to insert group during merge"))?;
                mapping.push(group);
            }

            let state_columns: Vec<_> = segment.arrays()[num_groups..].iter().collect();
            table.merge_states(&state_columns, &mapping)?;
        }

        let groups: Vec<_> = (0..table.num_groups()).collect();
        let batch = table.to_batch(&groups, self.finalize)?;

        let bucket_bytes = table.size_bytes() + largest_segment;
        self.stats.peak_bucket_bytes = self.stats.peak_bucket_bytes.max(bucket_bytes);
        self.stats.buckets_merged += 1;

        trace!(bucket, sources, rows = batch.num_rows(), bucket_bytes, "merged bucket");

        Ok(batch)
    }
}
