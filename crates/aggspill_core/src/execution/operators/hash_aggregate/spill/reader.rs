use std::fs::File;
use std::io::{BufReader, ErrorKind as IoErrorKind, Read};
use std::path::{Path, PathBuf};

use aggspill_error::{DbError, ErrorKind, Result};

use super::codec::{
    FILE_HEADER_LEN,
    SEGMENT_HEADER_LEN,
    SegmentHeader,
    decode_batch,
    decode_file_header,
};
use crate::arrays::batch::Batch;
use crate::arrays::datatype::DataType;

/// Lazily reads bucket segments from a temporary file.
///
/// Only the header of the next segment is read ahead of time. Payloads are
/// read when requested, or skipped without being decompressed.
#[derive(Debug)]
pub struct SpillReader {
    reader: BufReader<File>,
    path: PathBuf,
    datatypes: Vec<DataType>,
    /// Header for the segment we're positioned at. Its payload hasn't been
    /// read yet.
    current: Option<SegmentHeader>,
    last_bucket: Option<u32>,
    exhausted: bool,
}

impl SpillReader {
    /// Create a reader, validating the file header.
    pub fn try_new(file: File, path: PathBuf, datatypes: Vec<DataType>) -> Result<Self> {
        let mut reader = SpillReader {
            reader: BufReader::new(file),
            path,
            datatypes,
            current: None,
            last_bucket: None,
            exhausted: false,
        };

        let mut header = [0; FILE_HEADER_LEN];
        let n = reader.read_up_to(&mut header)?;
        decode_file_header(&header[..n]).map_err(|e| reader.read_error(e))?;

        Ok(reader)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the bucket of the next unread segment, or None if the file is
    /// exhausted.
    pub fn peek_bucket(&mut self) -> Result<Option<usize>> {
        if let Some(header) = &self.current {
            return Ok(Some(header.bucket as usize));
        }
        if self.exhausted {
            return Ok(None);
        }

        let mut buf = [0; SEGMENT_HEADER_LEN];
        let n = self.read_up_to(&mut buf)?;
        if n == 0 {
            self.exhausted = true;
            return Ok(None);
        }
        if n != SEGMENT_HEADER_LEN {
            return Err(DbError::spill_read("Truncated segment header")
                .with_field("path", self.path.display())
                .with_field("read", n));
        }

        let header = SegmentHeader::decode(&buf).map_err(|e| self.read_error(e))?;
        if self.last_bucket.is_some_and(|last| header.bucket <= last) {
            return Err(DbError::spill_read("Segments out of order")
                .with_field("path", self.path.display())
                .with_field("bucket", header.bucket)
                .with_field("previous", self.last_bucket.unwrap_or_default()));
        }

        self.last_bucket = Some(header.bucket);
        self.current = Some(header);

        Ok(Some(header.bucket as usize))
    }

    /// Read and decode the current segment.
    pub fn read_segment(&mut self) -> Result<Batch> {
        self.peek_bucket()?;
        let header = self
            .current
            .take()
            .ok_or_else(|| DbError::spill_read("No segment to read").with_field("path", self.path.display()))?;

        let mut compressed = vec![0; header.compressed_len as usize];
        let n = self.read_up_to(&mut compressed)?;
        if n != compressed.len() {
            return Err(DbError::spill_read("Truncated segment payload")
                .with_field("path", self.path.display())
                .with_field("bucket", header.bucket)
                .with_field("expected", compressed.len())
                .with_field("read", n));
        }

        if !header.verify(&compressed) {
            return Err(DbError::spill_read("Segment checksum mismatch")
                .with_field("path", self.path.display())
                .with_field("bucket", header.bucket));
        }

        let decompressed =
            lz4_flex::block::decompress(&compressed, header.uncompressed_len as usize).map_err(
                |e| {
                    DbError::with_source("Failed to decompress segment", Box::new(e))
                        .reclassify(ErrorKind::SpillReadFailed)
                        .with_field("path", self.path.display())
                        .with_field("bucket", header.bucket)
                },
            )?;
        if decompressed.len() != header.uncompressed_len as usize {
            return Err(DbError::spill_read("Unexpected decompressed segment length")
                .with_field("path", self.path.display())
                .with_field("bucket", header.bucket));
        }

        let batch = decode_batch(&decompressed, &self.datatypes).map_err(|e| {
            self.read_error(e).with_field("bucket", header.bucket)
        })?;
        if batch.num_rows() != header.row_count as usize {
            return Err(DbError::spill_read("Unexpected row count in segment")
                .with_field("path", self.path.display())
                .with_field("bucket", header.bucket)
                .with_field("expected", header.row_count)
                .with_field("got", batch.num_rows()));
        }

        Ok(batch)
    }

    /// Skip the current segment without decoding it.
    pub fn skip_segment(&mut self) -> Result<()> {
        self.peek_bucket()?;
        if let Some(header) = self.current.take() {
            self.reader
                .seek_relative(header.compressed_len as i64)
                .map_err(|e| self.io_error(e))?;
        }
        Ok(())
    }

    /// Read until `buf` is full or EOF is reached, returning the number of
    /// bytes read.
    fn read_up_to(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            match self.reader.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == IoErrorKind::Interrupted => continue,
                Err(e) => return Err(self.io_error(e)),
            }
        }
        Ok(total)
    }

    fn io_error(&self, e: std::io::Error) -> DbError {
        DbError::with_source("Failed to read temporary file", Box::new(e))
            .reclassify(ErrorKind::SpillReadFailed)
            .with_field("path", self.path.display())
    }

    /// Tag an error from decoding as a read failure for this file.
    fn read_error(&self, e: DbError) -> DbError {
        DbError::with_source("Corrupt temporary file", Box::new(e))
            .reclassify(ErrorKind::SpillReadFailed)
            .with_field("path", self.path.display())
    }
}
