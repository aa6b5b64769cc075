//! Error types for every core component, composed into [`DlsError`].

use std::io;
use std::path::PathBuf;

use snafu::Snafu;

/// Errors raised by the async I/O pool (C1).
#[derive(Debug, Snafu)]
pub enum AioError {
    /// A submitted `pread`/`fsync`/`close` job returned a system-call failure.
    #[snafu(display("async I/O job failed: {source}"))]
    IoFailure { source: io::Error },

    /// The pool was submitted to after `shutdown()` was called.
    #[snafu(display("async I/O pool is shutting down"))]
    ShuttingDown,
}

/// Errors raised while opening or reading a bucket file (C3).
#[derive(Debug, Snafu)]
pub enum BucketError {
    #[snafu(display("bucket I/O error: {source}"), context(false))]
    Io { source: io::Error },

    /// Magic present but `version` exceeds the supported maximum, or a V1
    /// record's parity byte did not verify.
    #[snafu(display("bucket {path:?} is corrupt: {reason}"))]
    Corrupt { path: PathBuf, reason: String },
}

/// Errors raised by the checkpoint service (C6).
#[derive(Debug, Snafu)]
pub enum CheckpointError {
    #[snafu(display("checkpoint I/O error: {source}"), context(false))]
    Io { source: io::Error },
}

/// Errors raised by the filesystem layout scan (C4).
#[derive(Debug, Snafu)]
pub enum LayoutError {
    #[snafu(display("layout I/O error: {source}"), context(false))]
    Io { source: io::Error },
}

/// Crate-level error, composed from every component's error type.
#[derive(Debug, Snafu)]
pub enum DlsError {
    #[snafu(display("{source}"))]
    Aio { source: AioError },

    #[snafu(display("{source}"))]
    Bucket { source: BucketError },

    #[snafu(display("{source}"))]
    Checkpoint { source: CheckpointError },

    #[snafu(display("{source}"))]
    Layout { source: LayoutError },

    /// A `put` whose value exceeded the configured `max_batch`.
    #[snafu(display("record of {len} bytes exceeds max_batch of {limit} bytes"))]
    SizeLimitExceeded { len: usize, limit: usize },

    /// A range query where `min > max`.
    #[snafu(display("invalid range: min ({min:#018x}) > max ({max:#018x})"))]
    InvalidRange { min: u64, max: u64 },

    /// An I/O error outside any of the above components (directory creation,
    /// commit-log removal).
    #[snafu(display("I/O error: {source}"), context(false))]
    Io { source: io::Error },
}

impl From<AioError> for DlsError {
    fn from(source: AioError) -> Self {
        DlsError::Aio { source }
    }
}

impl From<BucketError> for DlsError {
    fn from(source: BucketError) -> Self {
        DlsError::Bucket { source }
    }
}

impl From<CheckpointError> for DlsError {
    fn from(source: CheckpointError) -> Self {
        DlsError::Checkpoint { source }
    }
}

impl From<LayoutError> for DlsError {
    fn from(source: LayoutError) -> Self {
        DlsError::Layout { source }
    }
}

pub type Result<T, E = DlsError> = std::result::Result<T, E>;
