use std::io::{BufWriter, Write};
use std::path::Path;

use aggspill_error::{DbError, ErrorKind, Result};
use tempfile::NamedTempFile;

use super::codec::{SegmentHeader, encode_batch, encode_file_header};
use super::temporary::{FileStats, TemporaryFile};
use crate::arrays::batch::Batch;

/// Writes bucket segments for a single spill to a new temporary file.
///
/// The file is deleted if the writer is dropped without calling `finish`.
#[derive(Debug)]
pub struct SpillWriter {
    writer: BufWriter<NamedTempFile>,
    last_bucket: Option<u32>,
    stats: FileStats,
    /// Reusable buffer for the encoded batch.
    encode_buf: Vec<u8>,
    /// Reusable buffer for headers.
    header_buf: Vec<u8>,
}

impl SpillWriter {
    /// Create a new temporary file in `dir`.
    pub fn try_new(dir: &Path) -> Result<Self> {
        let file = tempfile::Builder::new()
            .prefix("aggspill-")
            .suffix(".tmp")
            .tempfile_in(dir)
            .map_err(|e| {
                DbError::with_source("Failed to create temporary file", Box::new(e))
                    .reclassify(ErrorKind::SpillWriteFailed)
                    .with_field("dir", dir.display())
            })?;

        let mut writer = SpillWriter {
            writer: BufWriter::new(file),
            last_bucket: None,
            stats: FileStats::default(),
            encode_buf: Vec::new(),
            header_buf: Vec::new(),
        };

        let mut header = Vec::new();
        encode_file_header(&mut header);
        writer.write_all(&header)?;

        Ok(writer)
    }

    /// Write all rows for a bucket.
    ///
    /// Buckets must be written in strictly increasing order. Empty batches
    /// are skipped.
    pub fn write_segment(&mut self, bucket: usize, batch: &Batch) -> Result<()> {
        if batch.num_rows() == 0 {
            return Ok(());
        }

        let bucket = u32::try_from(bucket)
            .map_err(|_| DbError::new("Bucket id too large").with_field("bucket", bucket))?;
        if self.last_bucket.is_some_and(|last| bucket <= last) {
            return Err(DbError::new("Buckets written out of order")
                .with_field("bucket", bucket)
                .with_field("last", self.last_bucket.unwrap_or_default()));
        }

        self.encode_buf.clear();
        encode_batch(batch, &mut self.encode_buf)
            .map_err(|e| e.reclassify(ErrorKind::SpillWriteFailed).with_field("bucket", bucket))?;
        let compressed = lz4_flex::block::compress(&self.encode_buf);

        let mut header = SegmentHeader {
            bucket,
            row_count: len_as_u32(batch.num_rows())?,
            uncompressed_len: len_as_u32(self.encode_buf.len())?,
            compressed_len: len_as_u32(compressed.len())?,
            checksum: 0,
        };
        header.checksum = header.compute_checksum(&compressed);

        let mut header_buf = std::mem::take(&mut self.header_buf);
        header_buf.clear();
        header.encode(&mut header_buf);
        let result = self
            .write_all(&header_buf)
            .and_then(|_| self.write_all(&compressed));
        self.header_buf = header_buf;
        result?;

        self.last_bucket = Some(bucket);
        self.stats.segments += 1;
        self.stats.rows += batch.num_rows();
        self.stats.uncompressed_bytes += self.encode_buf.len();

        Ok(())
    }

    /// Flush and return the handle owning the file.
    pub fn finish(self) -> Result<TemporaryFile> {
        let stats = self.stats;
        let file = self.writer.into_inner().map_err(|e| {
            DbError::with_source("Failed to flush temporary file", Box::new(e.into_error()))
                .reclassify(ErrorKind::SpillWriteFailed)
        })?;
        file.as_file().sync_data().map_err(|e| {
            DbError::with_source("Failed to sync temporary file", Box::new(e))
                .reclassify(ErrorKind::SpillWriteFailed)
        })?;

        Ok(TemporaryFile::new(file, stats))
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.writer.write_all(buf).map_err(|e| {
            DbError::with_source("Failed to write temporary file", Box::new(e))
                .reclassify(ErrorKind::SpillWriteFailed)
                .with_field("path", self.writer.get_ref().path().display())
        })?;
        self.stats.compressed_bytes += buf.len();
        Ok(())
    }
}

fn len_as_u32(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| {
        DbError::spill_write("Segment too large for temporary file").with_field("len", len)
    })
}
