//! C1: the async I/O pool.
//!
//! A fixed pool of OS threads executes blocking `pread`/`fsync`/`close`
//! calls on behalf of cooperative callers running on the (typically single-
//! threaded) main event loop, per spec.md §4.1. There is no direct teacher
//! file for this: the teacher (`vector_buffers`) leans on `tokio::fs`'s own
//! internal blocking pool and never exposes cancellation at this level. This
//! module is hand-rolled to match the spec's explicit job-slot-arena +
//! ready/waking-queue + discard-set design, because that design is exactly
//! what lets a caller cancel an in-flight job without leaking or
//! double-waking it (spec.md §8 scenario S5). Raw `pread`/`fsync`/`close`
//! syscalls and errno capture follow the style `koverstreet-bcachefs-tools`
//! uses throughout its device code: direct `libc` calls with the `errno`
//! crate surfacing the last OS error.

use std::collections::{HashSet, VecDeque};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tokio::sync::{oneshot, Notify};

use crate::error::AioError;

/// A unit of work submitted to the pool.
#[derive(Debug, Clone, Copy)]
enum Command {
    Pread { fd: RawFd, offset: u64, len: usize },
    Fsync { fd: RawFd },
    Close { fd: RawFd },
}

/// What a completed job produced.
#[derive(Debug)]
pub enum JobData {
    Bytes(Vec<u8>),
    Done,
}

type JobOutcome = io::Result<JobData>;

struct JobEntry {
    cmd: Command,
    notifier: Option<oneshot::Sender<JobOutcome>>,
}

struct Completion {
    slot: usize,
    outcome: JobOutcome,
}

/// Shared state between the submitting tasks, the worker threads, and the
/// scheduler pump task. Guarded piecewise, matching spec.md's "list mutex
/// guards slot reservation" / "scheduler mutex guards the two-queue swap".
struct Shared {
    slots: Mutex<Vec<Option<JobEntry>>>,
    pending: Mutex<VecDeque<usize>>,
    pending_cv: Condvar,
    ready: Mutex<VecDeque<Completion>>,
    discarded: Mutex<HashSet<usize>>,
    wake: Notify,
    shutting_down: Mutex<bool>,
}

impl Shared {
    fn reserve_slot(&self, cmd: Command, notifier: oneshot::Sender<JobOutcome>) -> usize {
        let mut slots = self.slots.lock().unwrap();
        let entry = JobEntry {
            cmd,
            notifier: Some(notifier),
        };
        if let Some(free) = slots.iter().position(Option::is_none) {
            slots[free] = Some(entry);
            free
        } else {
            slots.push(Some(entry));
            slots.len() - 1
        }
    }

    fn recycle(&self, slot: usize) {
        let mut slots = self.slots.lock().unwrap();
        slots[slot] = None;
    }
}

/// A job that has been submitted but not yet awaited, allowing the caller to
/// `cancel()` it instead of (or before) awaiting completion.
pub struct PendingJob {
    slot: usize,
    receiver: Option<oneshot::Receiver<JobOutcome>>,
    shared: Arc<Shared>,
}

impl PendingJob {
    /// Awaits completion. Raises [`AioError::IoFailure`] on a syscall
    /// failure.
    pub async fn wait(mut self) -> Result<JobData, AioError> {
        let receiver = self.receiver.take().expect("wait() called twice");
        match receiver.await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(source)) => Err(AioError::IoFailure { source }),
            Err(_) => Err(AioError::ShuttingDown),
        }
    }

    /// Cancels this job. If a worker has not yet claimed it, it is removed
    /// from the ready/pending path directly and its slot recycled
    /// immediately. If a worker already completed it, the slot is marked
    /// discarded so the scheduler silently recycles it without waking
    /// anyone, per spec.md §4.1 `cancel`.
    pub fn cancel(self) {
        let mut ready = self.shared.ready.lock().unwrap();
        if let Some(pos) = ready.iter().position(|c| c.slot == self.slot) {
            ready.remove(pos);
            drop(ready);
            self.shared.recycle(self.slot);
            return;
        }
        drop(ready);

        let mut pending = self.shared.pending.lock().unwrap();
        if let Some(pos) = pending.iter().position(|&s| s == self.slot) {
            pending.remove(pos);
            drop(pending);
            self.shared.recycle(self.slot);
            return;
        }
        drop(pending);

        // A worker has already claimed the slot and is executing it; mark
        // it discarded so the scheduler drops the eventual completion.
        self.shared.discarded.lock().unwrap().insert(self.slot);
    }
}

/// The async I/O pool: a fixed set of worker threads plus a scheduler pump
/// task that resumes callers on the event loop.
pub struct AioPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    pump: Option<tokio::task::JoinHandle<()>>,
}

impl AioPool {
    /// Spawns `num_workers` OS threads plus a scheduler pump task on the
    /// current Tokio runtime.
    pub fn new(num_workers: usize) -> Self {
        let shared = Arc::new(Shared {
            slots: Mutex::new(Vec::new()),
            pending: Mutex::new(VecDeque::new()),
            pending_cv: Condvar::new(),
            ready: Mutex::new(VecDeque::new()),
            discarded: Mutex::new(HashSet::new()),
            wake: Notify::new(),
            shutting_down: Mutex::new(false),
        });

        let workers = (0..num_workers.max(1))
            .map(|_| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || worker_loop(shared))
            })
            .collect();

        let pump_shared = Arc::clone(&shared);
        let pump = tokio::spawn(async move { scheduler_pump(pump_shared).await });

        AioPool {
            shared,
            workers,
            pump: Some(pump),
        }
    }

    fn submit(&self, cmd: Command) -> Result<PendingJob, AioError> {
        if *self.shared.shutting_down.lock().unwrap() {
            return Err(AioError::ShuttingDown);
        }
        let (tx, rx) = oneshot::channel();
        let slot = self.shared.reserve_slot(cmd, tx);
        self.shared.pending.lock().unwrap().push_back(slot);
        self.shared.pending_cv.notify_one();
        Ok(PendingJob {
            slot,
            receiver: Some(rx),
            shared: Arc::clone(&self.shared),
        })
    }

    pub fn submit_pread(&self, fd: RawFd, offset: u64, len: usize) -> Result<PendingJob, AioError> {
        self.submit(Command::Pread { fd, offset, len })
    }

    pub async fn pread(&self, fd: RawFd, offset: u64, len: usize) -> Result<Vec<u8>, AioError> {
        match self.submit_pread(fd, offset, len)?.wait().await? {
            JobData::Bytes(b) => Ok(b),
            JobData::Done => Ok(Vec::new()),
        }
    }

    pub async fn fsync(&self, fd: RawFd) -> Result<(), AioError> {
        self.submit(Command::Fsync { fd })?.wait().await?;
        Ok(())
    }

    pub async fn close(&self, fd: RawFd) -> Result<(), AioError> {
        self.submit(Command::Close { fd })?.wait().await?;
        Ok(())
    }

    /// Stops accepting new jobs, wakes every worker so it can observe
    /// shutdown, and joins them.
    pub fn shutdown(mut self) {
        *self.shared.shutting_down.lock().unwrap() = true;
        self.shared.pending_cv.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let slot = {
            let mut pending = shared.pending.lock().unwrap();
            loop {
                if let Some(slot) = pending.pop_front() {
                    break Some(slot);
                }
                if *shared.shutting_down.lock().unwrap() {
                    break None;
                }
                pending = shared.pending_cv.wait(pending).unwrap();
            }
        };
        let Some(slot) = slot else { return };

        let cmd = {
            let slots = shared.slots.lock().unwrap();
            match slots[slot].as_ref() {
                Some(entry) => entry.cmd,
                None => continue,
            }
        };

        let outcome = execute(cmd);

        shared.ready.lock().unwrap().push_back(Completion { slot, outcome });
        shared.wake.notify_one();
    }
}

fn execute(cmd: Command) -> JobOutcome {
    match cmd {
        Command::Pread { fd, offset, len } => {
            let mut buf = vec![0u8; len];
            let n = unsafe {
                libc::pread(
                    fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    len,
                    offset as libc::off_t,
                )
            };
            if n < 0 {
                return Err(last_os_error());
            }
            buf.truncate(n as usize);
            Ok(JobData::Bytes(buf))
        }
        Command::Fsync { fd } => {
            let rc = unsafe { libc::fsync(fd) };
            if rc < 0 {
                return Err(last_os_error());
            }
            Ok(JobData::Done)
        }
        Command::Close { fd } => {
            let rc = unsafe { libc::close(fd) };
            if rc < 0 {
                return Err(last_os_error());
            }
            Ok(JobData::Done)
        }
    }
}

fn last_os_error() -> io::Error {
    io::Error::from_raw_os_error(errno::errno().0)
}

/// Drains the `ready` queue as completions arrive and wakes each job's
/// caller, unless it was cancelled out from under the worker (in which case
/// it is silently recycled instead), per spec.md §4.1.
async fn scheduler_pump(shared: Arc<Shared>) {
    loop {
        shared.wake.notified().await;
        let mut waking: VecDeque<Completion> = {
            let mut ready = shared.ready.lock().unwrap();
            std::mem::take(&mut *ready)
        };
        for completion in waking.drain(..) {
            let discarded = shared.discarded.lock().unwrap().remove(&completion.slot);
            if discarded {
                shared.recycle(completion.slot);
                continue;
            }
            let notifier = {
                let mut slots = shared.slots.lock().unwrap();
                slots[completion.slot].as_mut().and_then(|e| e.notifier.take())
            };
            if let Some(notifier) = notifier {
                let _ = notifier.send(completion.outcome);
            }
            shared.recycle(completion.slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;

    fn scratch_file(contents: &[u8]) -> std::fs::File {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(contents).unwrap();
        file
    }

    #[tokio::test]
    async fn pread_reads_expected_bytes() {
        let file = scratch_file(b"hello world");
        let pool = AioPool::new(2);

        let data = pool.pread(file.as_raw_fd(), 6, 5).await.unwrap();
        assert_eq!(data, b"world");

        pool.shutdown();
    }

    #[tokio::test]
    async fn fsync_succeeds_on_open_fd() {
        let file = scratch_file(b"data");
        let pool = AioPool::new(2);
        pool.fsync(file.as_raw_fd()).await.unwrap();
        pool.shutdown();
    }

    #[tokio::test]
    async fn fsync_on_bad_fd_surfaces_io_failure() {
        let pool = AioPool::new(2);
        let result = pool.fsync(-1).await;
        assert!(matches!(result, Err(AioError::IoFailure { .. })));
        pool.shutdown();
    }

    #[tokio::test]
    async fn cancelled_job_never_wakes_its_caller() {
        // Scenario S5: submit a pread then immediately cancel; a second
        // pread on the same fd still completes normally.
        let file = scratch_file(b"0123456789");
        let pool = AioPool::new(1);

        let first = pool.submit_pread(file.as_raw_fd(), 0, 4).unwrap();
        first.cancel();

        let second = pool.submit_pread(file.as_raw_fd(), 4, 4).unwrap();
        let data = second.wait().await.unwrap();
        match data {
            JobData::Bytes(b) => assert_eq!(b, b"4567"),
            JobData::Done => panic!("expected bytes"),
        }

        pool.shutdown();
    }
}
