//! C6: the checkpoint service.
//!
//! An in-memory registry of each open bucket's durable tail, committed
//! periodically to a plain-text log via the same commit-to-temp-then-rename
//! pattern as `file_source::checkpointer::Checkpointer` (`checkpoints.json` ->
//! `checkpoint.dat` here, and a line-oriented format instead of JSON, per
//! spec.md §4.6/§7). Startup recovery truncates every bucket named in a
//! leftover log to its last known durable length, undoing any torn tail left
//! by a crash between appends and the next commit.
//!
//! The registry lives behind a `std::sync::Mutex`: the service is shared, via
//! an `Arc`, between the engine's write path and the periodic commit task
//! running on the Tokio multi-thread runtime, and every access is a short
//! synchronous critical section (never held across an `.await`).

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{error, info, warn};

use crate::aio::AioPool;
use crate::error::CheckpointError;
use crate::layout::{bucket_file_name, slot_bucket_of, slot_dir_name};

pub const CHECKPOINT_FILE_NAME: &str = "checkpoint.dat";
const TMP_FILE_NAME: &str = "checkpoint.dat.tmp";

/// Bookkeeping for one open (or recently closed) bucket.
struct BucketCheckpoint {
    bucket_start: u64,
    fd: RawFd,
    /// Last offset known to be durable on disk.
    durable_offset: u64,
    /// Length observed at the last `checkpoint()` call, not yet fsync-ed.
    pending_offset: Option<u64>,
    open: bool,
    /// Cleared once the entry has been written to the log after its bucket
    /// closed; a retired entry is pruned from the registry on the next pass.
    valid: bool,
}

struct ChannelBuckets {
    buckets: Vec<BucketCheckpoint>,
}

impl ChannelBuckets {
    fn find_mut(&mut self, bucket_start: u64) -> Option<&mut BucketCheckpoint> {
        self.buckets.iter_mut().find(|b| b.bucket_start == bucket_start)
    }
}

struct Registry {
    channels: HashMap<String, ChannelBuckets>,
}

/// Tracks durable tails across all open buckets and commits them to disk.
pub struct CheckpointService {
    registry: Mutex<Registry>,
    log_path: PathBuf,
    tmp_path: PathBuf,
}

impl CheckpointService {
    pub fn new(data_dir: &Path) -> Self {
        CheckpointService {
            registry: Mutex::new(Registry {
                channels: HashMap::new(),
            }),
            log_path: data_dir.join(CHECKPOINT_FILE_NAME),
            tmp_path: data_dir.join(TMP_FILE_NAME),
        }
    }

    /// Registers a freshly opened bucket writer. `initial_offset` is the
    /// file length observed at open time (its already-durable tail).
    pub fn bucket_open(&self, channel: &str, bucket_start: u64, fd: RawFd, initial_offset: u64) {
        let mut registry = self.registry.lock().unwrap();
        let entry = registry
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| ChannelBuckets { buckets: Vec::new() });
        match entry.find_mut(bucket_start) {
            Some(existing) => {
                existing.fd = fd;
                existing.open = true;
                existing.valid = true;
            }
            None => entry.buckets.push(BucketCheckpoint {
                bucket_start,
                fd,
                durable_offset: initial_offset,
                pending_offset: None,
                open: true,
                valid: true,
            }),
        }
    }

    /// Records a candidate durable length for the next commit cycle. The
    /// caller must already have flushed its buffered writer; the service
    /// performs the `fsync` itself at commit time.
    pub fn checkpoint(&self, channel: &str, bucket_start: u64, length: u64) {
        let mut registry = self.registry.lock().unwrap();
        if let Some(channel_buckets) = registry.channels.get_mut(channel) {
            if let Some(bucket) = channel_buckets.find_mut(bucket_start) {
                if bucket.valid {
                    bucket.pending_offset = Some(length);
                    return;
                }
            }
        }
        warn!(channel, bucket_start, "checkpoint() for unregistered bucket, ignoring");
    }

    pub fn bucket_close(&self, channel: &str, bucket_start: u64) {
        let mut registry = self.registry.lock().unwrap();
        if let Some(channel_buckets) = registry.channels.get_mut(channel) {
            if let Some(bucket) = channel_buckets.find_mut(bucket_start) {
                bucket.open = false;
            }
        }
    }

    /// Drops every tracked bucket for `channel`, e.g. after a channel
    /// removal (spec.md §4.5).
    pub fn remove_channel(&self, channel: &str) {
        self.registry.lock().unwrap().channels.remove(channel);
    }

    /// Fsyncs every bucket with a pending checkpoint through the async pool,
    /// then atomically rewrites the commit log. A bucket whose fsync fails
    /// (other than with `EBADF`, which means it raced a concurrent close) is
    /// skipped for this cycle; its previous durable offset is kept and it
    /// tries again next cycle.
    pub async fn commit(&self, pool: &AioPool) -> Result<(), CheckpointError> {
        let pending: Vec<(String, u64, RawFd, u64)> = {
            let registry = self.registry.lock().unwrap();
            registry
                .channels
                .iter()
                .flat_map(|(channel, buckets)| {
                    buckets.buckets.iter().filter_map(move |b| {
                        if !b.valid {
                            return None;
                        }
                        b.pending_offset
                            .map(|len| (channel.clone(), b.bucket_start, b.fd, len))
                    })
                })
                .collect()
        };

        for (channel, bucket_start, fd, len) in pending {
            match pool.fsync(fd).await {
                Ok(()) => {
                    let mut registry = self.registry.lock().unwrap();
                    if let Some(channel_buckets) = registry.channels.get_mut(&channel) {
                        if let Some(bucket) = channel_buckets.find_mut(bucket_start) {
                            bucket.durable_offset = len;
                            bucket.pending_offset = None;
                        }
                    }
                }
                Err(source) => {
                    let is_ebadf = matches!(
                        &source,
                        crate::error::AioError::IoFailure { source: io_err }
                            if io_err.raw_os_error() == Some(libc::EBADF)
                    );
                    warn!(channel, bucket_start, %source, is_ebadf, "checkpoint fsync failed, retrying next cycle");
                }
            }
        }

        self.write_log()?;
        Ok(())
    }

    fn write_log(&self) -> Result<(), CheckpointError> {
        let mut contents = String::new();
        {
            let mut registry = self.registry.lock().unwrap();
            for (channel, buckets) in &mut registry.channels {
                for bucket in &mut buckets.buckets {
                    if !bucket.valid {
                        continue;
                    }
                    contents.push_str(&format!(
                        "{} {} {}\n",
                        channel, bucket.bucket_start, bucket.durable_offset
                    ));
                    if !bucket.open {
                        bucket.valid = false;
                    }
                }
            }
            // A bucket retired just above (closed and already written one
            // final time) is pruned now; it has no further use in the
            // registry and would otherwise grow it without bound.
            for buckets in registry.channels.values_mut() {
                buckets.buckets.retain(|b| b.valid);
            }
        }

        std::fs::write(&self.tmp_path, contents)?;
        {
            let tmp = std::fs::File::open(&self.tmp_path)?;
            tmp.sync_all()?;
        }
        std::fs::rename(&self.tmp_path, &self.log_path)?;
        if let Some(dir) = self.log_path.parent() {
            if let Ok(dir_file) = std::fs::File::open(dir) {
                let _ = dir_file.sync_all();
            }
        }
        Ok(())
    }
}

/// A parsed line from a leftover commit log.
struct RecoveredEntry {
    channel: String,
    bucket_start: u64,
    durable_length: u64,
}

fn parse_log(contents: &str) -> Vec<RecoveredEntry> {
    let mut entries = Vec::new();
    for (lineno, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        let parsed = (|| -> Option<RecoveredEntry> {
            let [channel, bucket_dec, length] = <[&str; 3]>::try_from(parts.clone()).ok()?;
            let bucket_start: u64 = bucket_dec.parse().ok()?;
            let durable_length = length.parse().ok()?;
            Some(RecoveredEntry {
                channel: channel.to_string(),
                bucket_start,
                durable_length,
            })
        })();
        match parsed {
            Some(entry) => entries.push(entry),
            None => warn!(line = lineno, content = line, "malformed checkpoint line, skipping"),
        }
    }
    entries
}

/// Truncates every bucket file named in a leftover commit log to its last
/// recorded durable length, then removes the log. A no-op (clean shutdown)
/// if no log is present.
pub fn recover(data_dir: &Path) -> Result<(), CheckpointError> {
    let log_path = data_dir.join(CHECKPOINT_FILE_NAME);
    let contents = match std::fs::read_to_string(&log_path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("no checkpoint log found, clean startup");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    for entry in parse_log(&contents) {
        let (slot, bucket) = slot_bucket_of(entry.bucket_start);
        let path = data_dir
            .join(&entry.channel)
            .join(slot_dir_name(slot))
            .join(bucket_file_name(bucket));
        match std::fs::OpenOptions::new().write(true).open(&path) {
            Ok(file) => {
                if let Err(source) = file.set_len(entry.durable_length) {
                    error!(channel = %entry.channel, bucket_start = entry.bucket_start, %source, "failed to truncate bucket during recovery");
                } else {
                    info!(channel = %entry.channel, bucket_start = entry.bucket_start, length = entry.durable_length, "truncated bucket to durable length");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(channel = %entry.channel, bucket_start = entry.bucket_start, "checkpointed bucket file missing, skipping");
            }
            Err(source) => return Err(source.into()),
        }
    }

    std::fs::remove_file(&log_path)?;
    Ok(())
}
