//! C7: the step iterator.
//!
//! Walks buckets in ascending order within a key range, yielding `(key,
//! value)` pairs in file order. `StepIterator` awaits every read directly;
//! `NeoStepIterator` wraps it so a caller can poll without blocking, the way
//! spec.md §4.7 describes a promise/future pair — here realized with a
//! spawned `tokio` task and `JoinHandle::is_finished` standing in for "has
//! the promise been fulfilled yet".

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{trace, warn};

use crate::aio::AioPool;
use crate::bucket::{BucketReader, PooledBucketSource};
use crate::error::DlsError;
use crate::input_buffer::InputBuffer;
use crate::layout::{get_first_bucket_in_range, get_next_bucket, FoundBucket, StdFileSystem};

/// `{ Unstarted, Positioned, End, Aborted }` from spec.md §4.7. `Aborted` is
/// sticky: once set, `next()` always returns `Ok(None)`.
enum State {
    Unstarted,
    Positioned(ActiveBucket),
    End,
    Aborted,
}

struct ActiveBucket {
    reader: BucketReader,
    first_key: u64,
    source: PooledBucketSource,
    buffer: InputBuffer,
}

/// Yields `(key, value)` pairs across a key range within one channel, in
/// bucket-then-file order. Filtering (substring/regex) is applied by the
/// caller, not the iterator, per spec.md §2/§4.7.
pub struct StepIterator {
    pool: Arc<AioPool>,
    channel_dir: PathBuf,
    min: u64,
    max: u64,
    file_buffer_size: usize,
    state: State,
}

impl StepIterator {
    pub fn new(pool: Arc<AioPool>, channel_dir: PathBuf, min: u64, max: u64, file_buffer_size: usize) -> Self {
        StepIterator {
            pool,
            channel_dir,
            min,
            max,
            file_buffer_size,
            state: State::Unstarted,
        }
    }

    pub fn whole_channel(pool: Arc<AioPool>, channel_dir: PathBuf, file_buffer_size: usize) -> Self {
        Self::new(pool, channel_dir, 0, u64::MAX, file_buffer_size)
    }

    /// Aborts the iterator; sticky until the iterator is dropped and
    /// recreated (spec.md §4.7 `Aborted` is a terminal state).
    pub fn abort(&mut self) {
        self.state = State::Aborted;
    }

    fn open(&self, found: FoundBucket) -> Result<ActiveBucket, DlsError> {
        let reader = BucketReader::open(&found.path)?;
        let fd = reader.fd();
        let mut buffer = InputBuffer::new(self.file_buffer_size);
        buffer.seek_to(reader.data_start());
        Ok(ActiveBucket {
            first_key: found.first_key(),
            source: PooledBucketSource::new(self.pool.clone(), fd),
            buffer,
            reader,
        })
    }

    /// Reads the next in-range `(key, value)` pair, advancing across bucket
    /// boundaries as needed. Returns `Ok(None)` at end of range.
    pub async fn next(&mut self) -> Result<Option<(u64, Vec<u8>)>, DlsError> {
        loop {
            match &mut self.state {
                State::Aborted | State::End => return Ok(None),
                State::Unstarted => {
                    let found = get_first_bucket_in_range(&StdFileSystem, &self.channel_dir, self.min, self.max)?;
                    match found {
                        Some(found) => self.state = State::Positioned(self.open(found)?),
                        None => {
                            self.state = State::End;
                            return Ok(None);
                        }
                    }
                }
                State::Positioned(active) => match read_one_record(active, self.min, self.max).await? {
                    RecordOutcome::Record(key, value) => return Ok(Some((key, value))),
                    RecordOutcome::EndOfBucket => {
                        let last_first_key = active.first_key;
                        let next = get_next_bucket(&StdFileSystem, &self.channel_dir, last_first_key, self.max)?;
                        match next {
                            Some(found) => self.state = State::Positioned(self.open(found)?),
                            None => self.state = State::End,
                        }
                    }
                },
            }
        }
    }
}

enum RecordOutcome {
    Record(u64, Vec<u8>),
    EndOfBucket,
}

/// Reads one record from the current bucket position, skipping records
/// outside `[min, max]` rather than stopping early: bucket files are not
/// guaranteed perfectly key-sorted (e.g. after clock skew across writers),
/// so only true end-of-bucket (short read or a V1 parity mismatch) ends the
/// scan.
async fn read_one_record(active: &mut ActiveBucket, min: u64, max: u64) -> Result<RecordOutcome, DlsError> {
    let header_len = active.reader.record_header_len();
    loop {
        let mut header_buf = vec![0u8; header_len];
        let n = active.buffer.read_data(&mut active.source, &mut header_buf).await?;
        if n < header_len {
            trace!(bucket = active.first_key, "short header read, end of bucket");
            return Ok(RecordOutcome::EndOfBucket);
        }
        let Some(header) = active.reader.decode_header(&header_buf) else {
            warn!(bucket = active.first_key, "record header failed verification, end of bucket");
            return Ok(RecordOutcome::EndOfBucket);
        };

        let mut value = vec![0u8; header.len as usize];
        let n = active.buffer.read_data(&mut active.source, &mut value).await?;
        if (n as u64) < header.len {
            trace!(bucket = active.first_key, key = header.key, "truncated value, end of bucket");
            return Ok(RecordOutcome::EndOfBucket);
        }

        if header.key >= min && header.key <= max {
            return Ok(RecordOutcome::Record(header.key, value));
        }
        // out-of-range record within an in-range bucket: skip and keep scanning
    }
}

/// Yields bucket file *paths* in ascending bucket order within a key range,
/// without opening them for reading. Used only by the (out-of-scope)
/// redistribute flow (spec.md §4.5).
pub struct FileIterator {
    channel_dir: PathBuf,
    min: u64,
    max: u64,
    last: Option<u64>,
    done: bool,
}

impl FileIterator {
    pub fn new(channel_dir: PathBuf, min: u64, max: u64) -> Self {
        FileIterator {
            channel_dir,
            min,
            max,
            last: None,
            done: false,
        }
    }

    pub fn advance(&mut self) -> Result<Option<PathBuf>, DlsError> {
        if self.done {
            return Ok(None);
        }
        let found = match self.last {
            None => get_first_bucket_in_range(&StdFileSystem, &self.channel_dir, self.min, self.max)?,
            Some(last) => get_next_bucket(&StdFileSystem, &self.channel_dir, last, self.max)?,
        };
        match found {
            Some(found) => {
                self.last = Some(found.first_key());
                Ok(Some(found.path))
            }
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }
}

/// What a non-blocking poll produced.
pub enum StepOutcome {
    RecordRead(u64, Vec<u8>),
    WaitForData,
    NoMoreData,
}

/// Non-blocking wrapper around [`StepIterator`]: `poll_next` never awaits.
/// The first call with no read in flight kicks one off as a background
/// task; subsequent calls check whether it has completed.
type StepResult = Result<Option<(u64, Vec<u8>)>, DlsError>;
type InFlight = tokio::task::JoinHandle<(StepIterator, StepResult)>;

pub struct NeoStepIterator {
    inner: Option<StepIterator>,
    in_flight: Option<InFlight>,
}

impl NeoStepIterator {
    pub fn new(iter: StepIterator) -> Self {
        NeoStepIterator {
            inner: Some(iter),
            in_flight: None,
        }
    }

    /// Polls for the next record without blocking the caller's task.
    pub fn poll_next(&mut self) -> StepOutcome {
        if let Some(handle) = &self.in_flight {
            if !handle.is_finished() {
                return StepOutcome::WaitForData;
            }
            let handle = self.in_flight.take().unwrap();
            let (iter, result) = futures_join(handle);
            self.inner = Some(iter);
            return match result {
                Ok(Some((key, value))) => StepOutcome::RecordRead(key, value),
                Ok(None) => StepOutcome::NoMoreData,
                Err(source) => {
                    warn!(%source, "step iterator read failed");
                    StepOutcome::NoMoreData
                }
            };
        }

        let mut iter = self.inner.take().expect("poll_next called after NoMoreData");
        let handle = tokio::spawn(async move {
            let result = iter.next().await;
            (iter, result)
        });
        self.in_flight = Some(handle);
        StepOutcome::WaitForData
    }
}

/// Joins an already-finished `JoinHandle` without an `.await` point, via a
/// no-op waker: safe because `is_finished()` was already observed true.
fn futures_join<T>(handle: tokio::task::JoinHandle<T>) -> T {
    use std::task::{Context, Poll};
    let waker = futures_noop_waker();
    let mut cx = Context::from_waker(&waker);
    let mut pinned = Box::pin(handle);
    match pinned.as_mut().poll(&mut cx) {
        Poll::Ready(result) => result.expect("spawned iterator task panicked"),
        Poll::Pending => unreachable!("poll_next only joins handles already observed finished"),
    }
}

fn futures_noop_waker() -> std::task::Waker {
    use std::task::{RawWaker, RawWakerVTable, Waker};
    fn no_op(_: *const ()) {}
    fn clone(_: *const ()) -> RawWaker {
        raw_waker()
    }
    fn raw_waker() -> RawWaker {
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, no_op, no_op, no_op);
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe { Waker::from_raw(raw_waker()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::BucketWriter;

    fn write_bucket(dir: &std::path::Path, slot: u64, bucket: u64, records: &[(u64, &[u8])]) {
        let path = dir
            .join(crate::layout::slot_dir_name(slot))
            .join(crate::layout::bucket_file_name(bucket));
        let mut writer = BucketWriter::open(&path, 4096).unwrap();
        for (key, value) in records {
            writer.append(*key, value).unwrap();
        }
        writer.flush().unwrap();
    }

    #[tokio::test]
    async fn iterates_records_in_range_across_buckets() {
        let dir = tempfile::tempdir().unwrap();
        write_bucket(dir.path(), 0, 0, &[(1, b"a"), (2, b"b")]);
        write_bucket(dir.path(), 0, 1, &[(0x1000, b"c")]);

        let pool = Arc::new(AioPool::new(2));
        let mut iter = StepIterator::whole_channel(pool.clone(), dir.path().to_path_buf(), 64);

        let mut seen = Vec::new();
        while let Some((key, value)) = iter.next().await.unwrap() {
            seen.push((key, value));
        }

        assert_eq!(seen, vec![(1, b"a".to_vec()), (2, b"b".to_vec()), (0x1000, b"c".to_vec())]);

        drop(iter);
        std::sync::Arc::try_unwrap(pool).ok().unwrap().shutdown();
    }

    #[tokio::test]
    async fn empty_channel_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(AioPool::new(1));
        let mut iter = StepIterator::whole_channel(pool.clone(), dir.path().to_path_buf(), 64);
        assert!(iter.next().await.unwrap().is_none());
        drop(iter);
        std::sync::Arc::try_unwrap(pool).ok().unwrap().shutdown();
    }

    #[tokio::test]
    async fn range_excludes_out_of_range_records_in_a_shared_bucket() {
        let dir = tempfile::tempdir().unwrap();
        write_bucket(dir.path(), 0, 0, &[(1, b"too-low-ignored"), (5, b"in-range"), (0xf00, b"also-in-range")]);

        let pool = Arc::new(AioPool::new(1));
        let mut iter = StepIterator::new(pool.clone(), dir.path().to_path_buf(), 2, 0xfff, 64);

        let mut seen = Vec::new();
        while let Some((key, value)) = iter.next().await.unwrap() {
            seen.push((key, value));
        }
        assert_eq!(seen, vec![(5, b"in-range".to_vec()), (0xf00, b"also-in-range".to_vec())]);

        drop(iter);
        std::sync::Arc::try_unwrap(pool).ok().unwrap().shutdown();
    }

    #[test]
    fn file_iterator_yields_bucket_paths_ascending() {
        let dir = tempfile::tempdir().unwrap();
        write_bucket(dir.path(), 0, 0, &[(1, b"a")]);
        write_bucket(dir.path(), 0, 1, &[(0x1000, b"b")]);

        let mut iter = FileIterator::new(dir.path().to_path_buf(), 0, u64::MAX);
        let first = iter.advance().unwrap().unwrap();
        assert!(first.ends_with("000"));
        let second = iter.advance().unwrap().unwrap();
        assert!(second.ends_with("001"));
        assert!(iter.advance().unwrap().is_none());
    }

    #[tokio::test]
    async fn neo_iterator_eventually_yields_every_record() {
        let dir = tempfile::tempdir().unwrap();
        write_bucket(dir.path(), 0, 0, &[(1, b"a"), (2, b"b")]);

        let pool = Arc::new(AioPool::new(2));
        let iter = StepIterator::whole_channel(pool.clone(), dir.path().to_path_buf(), 64);
        let mut neo = NeoStepIterator::new(iter);

        let mut seen = Vec::new();
        loop {
            match neo.poll_next() {
                StepOutcome::RecordRead(k, v) => seen.push((k, v)),
                StepOutcome::NoMoreData => break,
                StepOutcome::WaitForData => tokio::task::yield_now().await,
            }
        }
        assert_eq!(seen, vec![(1, b"a".to_vec()), (2, b"b".to_vec())]);

        drop(neo);
        std::sync::Arc::try_unwrap(pool).ok().unwrap().shutdown();
    }
}
