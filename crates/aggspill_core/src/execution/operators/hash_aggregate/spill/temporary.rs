use std::fs::File;
use std::path::{Path, PathBuf};

use aggspill_error::{DbError, ErrorKind, Result};
use tempfile::NamedTempFile;

use super::reader::SpillReader;
use super::writer::SpillWriter;
use crate::arrays::datatype::DataType;

/// Stats for a single temporary file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStats {
    pub segments: usize,
    pub rows: usize,
    /// Bytes on disk, including headers.
    pub compressed_bytes: usize,
    /// Bytes of encoded batches before compression.
    pub uncompressed_bytes: usize,
}

/// Totals across all temporary files for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpillStats {
    pub num_files: usize,
    pub rows: usize,
    pub compressed_bytes: usize,
    pub uncompressed_bytes: usize,
}

/// A fully written temporary file.
///
/// Dropping the handle deletes the file.
#[derive(Debug)]
pub struct TemporaryFile {
    file: NamedTempFile,
    stats: FileStats,
}

impl TemporaryFile {
    pub(crate) fn new(file: NamedTempFile, stats: FileStats) -> Self {
        TemporaryFile { file, stats }
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn stats(&self) -> FileStats {
        self.stats
    }

    /// Open a new reader over this file.
    pub fn open_reader(&self, datatypes: Vec<DataType>) -> Result<SpillReader> {
        let file: File = self.file.reopen().map_err(|e| {
            DbError::with_source("Failed to open temporary file", Box::new(e))
                .reclassify(ErrorKind::SpillReadFailed)
                .with_field("path", self.path().display())
        })?;
        SpillReader::try_new(file, self.path().to_path_buf(), datatypes)
    }
}

/// Owner of every temporary file created during a run.
///
/// Files are deleted when removed from the arena or when the arena is
/// dropped.
#[derive(Debug)]
pub struct TemporaryFiles {
    dir: PathBuf,
    files: Vec<TemporaryFile>,
}

impl TemporaryFiles {
    /// Create an arena placing files in `dir`, or the system temp dir if None.
    pub fn new(dir: Option<PathBuf>) -> Self {
        TemporaryFiles {
            dir: dir.unwrap_or_else(std::env::temp_dir),
            files: Vec::new(),
        }
    }

    /// Start writing a new file in this arena's directory.
    ///
    /// The file is only owned by the arena once pushed.
    pub fn create_writer(&self) -> Result<SpillWriter> {
        SpillWriter::try_new(&self.dir)
    }

    pub fn push(&mut self, file: TemporaryFile) {
        self.files.push(file);
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn files(&self) -> &[TemporaryFile] {
        &self.files
    }

    pub fn stats(&self) -> SpillStats {
        self.files.iter().fold(
            SpillStats {
                num_files: self.files.len(),
                ..Default::default()
            },
            |mut acc, file| {
                acc.rows += file.stats.rows;
                acc.compressed_bytes += file.stats.compressed_bytes;
                acc.uncompressed_bytes += file.stats.uncompressed_bytes;
                acc
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate_batch;

    #[test]
    fn files_deleted_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = TemporaryFiles::new(Some(dir.path().to_path_buf()));

        for _ in 0..2 {
            let mut writer = files.create_writer().unwrap();
            writer
                .write_segment(0, &generate_batch!(["a", "b"]))
                .unwrap();
            files.push(writer.finish().unwrap());
        }

        let stats = files.stats();
        assert_eq!(2, stats.num_files);
        assert_eq!(4, stats.rows);
        assert!(stats.compressed_bytes > 0);
        assert_eq!(2, std::fs::read_dir(dir.path()).unwrap().count());

        files = TemporaryFiles::new(Some(dir.path().to_path_buf()));
        assert_eq!(0, std::fs::read_dir(dir.path()).unwrap().count());

        let mut writer = files.create_writer().unwrap();
        writer.write_segment(1, &generate_batch!(["c"])).unwrap();
        files.push(writer.finish().unwrap());
        assert_eq!(1, std::fs::read_dir(dir.path()).unwrap().count());

        drop(files);
        assert_eq!(0, std::fs::read_dir(dir.path()).unwrap().count());
    }

    #[test]
    fn unfinished_writer_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let files = TemporaryFiles::new(Some(dir.path().to_path_buf()));

        let mut writer = files.create_writer().unwrap();
        writer.write_segment(0, &generate_batch!(["a"])).unwrap();
        drop(writer);

        assert_eq!(0, std::fs::read_dir(dir.path()).unwrap().count());
    }

    #[test]
    fn missing_dir_is_spill_write_error() {
        let dir = tempfile::tempdir().unwrap();
        let files = TemporaryFiles::new(Some(dir.path().join("does_not_exist")));

        let err = files.create_writer().unwrap_err();
        assert_eq!(ErrorKind::SpillWriteFailed, err.kind());
    }
}
