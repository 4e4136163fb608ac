use std::path::Path;

use aggspill_core::arrays::array::Array;
use aggspill_core::arrays::batch::Batch;
use aggspill_core::arrays::datatype::DataType;
use aggspill_core::arrays::row::ScalarRow;
use aggspill_core::config::aggregate::{AggregateConfig, AggregateSpec};
use aggspill_core::execution::cancel::CancellationToken;
use aggspill_core::execution::operators::hash_aggregate::{AggregatingStream, DriverPhase};
use aggspill_core::execution::source::BatchSource;
use aggspill_core::functions::aggregate::builtin::count::Count;
use aggspill_core::testutil::{VecSource, sorted_rows};
use aggspill_core::{generate_batch, row};
use aggspill_error::{ErrorKind, Result};

/// Three batches with keys `a, a, b, c, b, a`.
fn key_source() -> VecSource {
    VecSource::new(
        vec![DataType::Utf8],
        vec![
            generate_batch!(["a", "a"]),
            generate_batch!(["b", "c"]),
            generate_batch!(["b", "a"]),
        ],
    )
}

fn count_config(tmp: &Path, threshold: usize) -> AggregateConfig {
    let mut config = AggregateConfig::new([0], vec![AggregateSpec::new(&Count, [])]);
    config.memory_threshold_bytes = threshold;
    config.num_buckets = 16;
    config.tmp_path = Some(tmp.to_path_buf());
    config
}

fn read_all<S: BatchSource>(stream: &mut S, token: &CancellationToken) -> Result<Vec<Batch>> {
    let mut batches = Vec::new();
    while let Some(batch) = stream.read(token)? {
        batches.push(batch);
    }
    Ok(batches)
}

fn expected_counts() -> Vec<ScalarRow> {
    vec![row!["a", 3i64], row!["b", 2i64], row!["c", 1i64]]
}

fn num_files(dir: &Path) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}

#[test]
fn direct_path_counts() {
    logutil::init_test();
    let dir = tempfile::tempdir().unwrap();
    let mut stream = AggregatingStream::try_new(key_source(), count_config(dir.path(), usize::MAX))
        .unwrap();

    let token = CancellationToken::new();
    let batches = read_all(&mut stream, &token).unwrap();

    assert_eq!(expected_counts(), sorted_rows(&batches));
    assert_eq!(0, stream.spill_stats().num_files);
}

#[test]
fn spilled_path_matches_direct() {
    logutil::init_test();
    let dir = tempfile::tempdir().unwrap();
    let mut stream =
        AggregatingStream::try_new(key_source(), count_config(dir.path(), 1)).unwrap();

    let token = CancellationToken::new();
    let batches = read_all(&mut stream, &token).unwrap();

    assert_eq!(expected_counts(), sorted_rows(&batches));
    assert_eq!(3, stream.spill_stats().num_files);
    assert_eq!(0, num_files(dir.path()));
}

#[test]
fn end_of_stream_is_idempotent() {
    logutil::init_test();
    let dir = tempfile::tempdir().unwrap();
    for threshold in [usize::MAX, 1] {
        let mut stream =
            AggregatingStream::try_new(key_source(), count_config(dir.path(), threshold)).unwrap();
        let token = CancellationToken::new();
        read_all(&mut stream, &token).unwrap();

        for _ in 0..3 {
            assert_eq!(None, stream.read(&token).unwrap());
        }
        assert_eq!(DriverPhase::Finished, stream.phase());
    }
}

/// Source that cancels the token once a number of batches have been handed
/// out.
struct CancellingSource {
    inner: VecSource,
    token: CancellationToken,
    cancel_after: usize,
}

impl BatchSource for CancellingSource {
    fn datatypes(&self) -> &[DataType] {
        self.inner.datatypes()
    }

    fn read(&mut self, token: &CancellationToken) -> Result<Option<Batch>> {
        let batch = self.inner.read(token)?;
        if self.inner.batches_read() >= self.cancel_after {
            self.token.cancel();
        }
        Ok(batch)
    }
}

#[test]
fn cancelled_after_first_batch() {
    logutil::init_test();
    let dir = tempfile::tempdir().unwrap();

    for threshold in [usize::MAX, 1] {
        let token = CancellationToken::new();
        let source = CancellingSource {
            inner: key_source(),
            token: token.clone(),
            cancel_after: 1,
        };
        let mut stream =
            AggregatingStream::try_new(source, count_config(dir.path(), threshold)).unwrap();

        assert_eq!(None, stream.read(&token).unwrap());
        assert_eq!(DriverPhase::Finished, stream.phase());
        assert_eq!(None, stream.read(&token).unwrap());
        assert_eq!(0, num_files(dir.path()));
    }
}

#[test]
fn cancelled_at_every_point() {
    logutil::init_test();
    let dir = tempfile::tempdir().unwrap();

    for cancel_after in 1..=3 {
        let token = CancellationToken::new();
        let source = CancellingSource {
            inner: key_source(),
            token: token.clone(),
            cancel_after,
        };
        let mut stream = AggregatingStream::try_new(source, count_config(dir.path(), 1)).unwrap();

        // Cancelled during grouping, nothing is emitted.
        let batches = read_all(&mut stream, &token).unwrap();
        assert!(batches.is_empty());
        assert_eq!(0, num_files(dir.path()));
    }
}

#[test]
fn cancelled_during_direct_output() {
    logutil::init_test();
    let dir = tempfile::tempdir().unwrap();
    let mut config = count_config(dir.path(), usize::MAX);
    config.batch_size = 1;
    let mut stream = AggregatingStream::try_new(key_source(), config).unwrap();

    let token = CancellationToken::new();
    let first = stream.read(&token).unwrap().unwrap();
    assert_eq!(1, first.num_rows());
    assert_eq!(DriverPhase::DirectOutput, stream.phase());

    token.cancel();
    assert_eq!(None, stream.read(&token).unwrap());
    assert_eq!(DriverPhase::Finished, stream.phase());
    assert_eq!(None, stream.read(&CancellationToken::new()).unwrap());
}

/// Source that corrupts every temporary file in a directory once exhausted,
/// before the merge starts.
struct CorruptingSource {
    inner: VecSource,
    dir: std::path::PathBuf,
    corrupt: fn(&Path) -> std::io::Result<()>,
}

fn overwrite_file(path: &Path) -> std::io::Result<()> {
    std::fs::write(path, b"bad")
}

fn flip_last_byte(path: &Path) -> std::io::Result<()> {
    let mut bytes = std::fs::read(path)?;
    if let Some(last) = bytes.last_mut() {
        *last ^= 0xFF;
    }
    std::fs::write(path, bytes)
}

impl BatchSource for CorruptingSource {
    fn datatypes(&self) -> &[DataType] {
        self.inner.datatypes()
    }

    fn read(&mut self, token: &CancellationToken) -> Result<Option<Batch>> {
        let batch = self.inner.read(token)?;
        if batch.is_none() {
            for entry in std::fs::read_dir(&self.dir)? {
                (self.corrupt)(&entry?.path())?;
            }
        }
        Ok(batch)
    }
}

#[test]
fn corrupt_file_fails_without_output() {
    logutil::init_test();
    let dir = tempfile::tempdir().unwrap();
    let source = CorruptingSource {
        inner: key_source(),
        dir: dir.path().to_path_buf(),
        corrupt: overwrite_file,
    };
    let mut stream = AggregatingStream::try_new(source, count_config(dir.path(), 1)).unwrap();

    let token = CancellationToken::new();
    let err = stream.read(&token).unwrap_err();
    assert_eq!(ErrorKind::SpillReadFailed, err.kind());
    assert_eq!(DriverPhase::Failed, stream.phase());

    // Failed runs release their files.
    assert_eq!(0, num_files(dir.path()));
    assert!(stream.read(&token).is_err());
}

#[test]
fn corruption_found_mid_merge() {
    logutil::init_test();
    let dir = tempfile::tempdir().unwrap();
    let keys: Vec<String> = (0..40).map(|i| format!("key{i}")).collect();
    let batch = Batch::try_new([Array::from_iter(keys.iter().map(|s| s.as_str()))]).unwrap();
    let source = CorruptingSource {
        inner: VecSource::new(vec![DataType::Utf8], vec![batch]),
        dir: dir.path().to_path_buf(),
        corrupt: flip_last_byte,
    };
    let mut stream = AggregatingStream::try_new(source, count_config(dir.path(), 1)).unwrap();

    // Lower buckets are intact and emitted before the damaged one is reached.
    let token = CancellationToken::new();
    let mut emitted = 0;
    let err = loop {
        match stream.read(&token) {
            Ok(Some(_)) => emitted += 1,
            Ok(None) => panic!("stream ended without an error"),
            Err(e) => break e,
        }
    };
    assert!(emitted > 0);
    assert_eq!(ErrorKind::SpillReadFailed, err.kind());
    assert_eq!(DriverPhase::Failed, stream.phase());
    assert_eq!(0, num_files(dir.path()));

    let err = stream.read(&token).unwrap_err();
    assert_eq!("Aggregation run aborted", err.get_msg());
}

#[test]
fn mismatched_input_batch_fails() {
    logutil::init_test();
    let source = VecSource::new(
        vec![DataType::Int64, DataType::Utf8],
        vec![generate_batch!([1i64, 2, 3])],
    );
    let config = AggregateConfig::new([1], vec![AggregateSpec::new(&Count, [])]);
    let mut stream = AggregatingStream::try_new(source, config).unwrap();

    let err = stream.read(&CancellationToken::new()).unwrap_err();
    assert_eq!(ErrorKind::InvalidInput, err.kind());
    assert_eq!(DriverPhase::Failed, stream.phase());
}

#[test]
fn threshold_without_spill_is_resource_exhausted() {
    logutil::init_test();
    let dir = tempfile::tempdir().unwrap();
    let mut config = count_config(dir.path(), 1);
    config.spill_enabled = false;
    let mut stream = AggregatingStream::try_new(key_source(), config).unwrap();

    let err = stream.read(&CancellationToken::new()).unwrap_err();
    assert_eq!(ErrorKind::ResourceExhausted, err.kind());
    assert_eq!(0, num_files(dir.path()));
}

#[test]
fn empty_input() {
    logutil::init_test();
    let dir = tempfile::tempdir().unwrap();

    let source = VecSource::new(vec![DataType::Utf8], Vec::new());
    let mut stream =
        AggregatingStream::try_new(source, count_config(dir.path(), usize::MAX)).unwrap();
    let batches = read_all(&mut stream, &CancellationToken::new()).unwrap();
    assert!(sorted_rows(&batches).is_empty());

    // No group columns still produces the single global group.
    let source = VecSource::new(vec![DataType::Utf8], Vec::new());
    let config = AggregateConfig::new(Vec::new(), vec![AggregateSpec::new(&Count, [])]);
    let mut stream = AggregatingStream::try_new(source, config).unwrap();
    let batches = read_all(&mut stream, &CancellationToken::new()).unwrap();
    assert_eq!(vec![row![0i64]], sorted_rows(&batches));
}

#[test]
fn invalid_config_rejected_at_construction() {
    let mut config = AggregateConfig::new([0], vec![AggregateSpec::new(&Count, [])]);
    config.num_buckets = 0;
    let err = AggregatingStream::try_new(key_source(), config).unwrap_err();
    assert_eq!(ErrorKind::InvalidInput, err.kind());

    let config = AggregateConfig::new([3], vec![AggregateSpec::new(&Count, [])]);
    let err = AggregatingStream::try_new(key_source(), config).unwrap_err();
    assert_eq!(ErrorKind::InvalidInput, err.kind());
}
