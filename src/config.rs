//! Typed configuration for the storage engine, with a builder that mirrors
//! the teacher's `DiskBufferConfigBuilder`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::Snafu;

pub const DEFAULT_FILE_BUFFER_SIZE: usize = 64 * 1024;
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 256 * 1024;
pub const DEFAULT_CHECKPOINT_COMMIT_SECONDS: u64 = 5;
pub const DEFAULT_NUMBER_OF_THREAD_WORKERS: usize = 20;
pub const DEFAULT_WRITE_FLUSH_MS: u64 = 500;
pub const DEFAULT_MAX_BATCH: usize = 16 * 1024 * 1024;
pub const DEFAULT_WRITER_LRU_CAPACITY: usize = 3;

#[derive(Debug, Snafu)]
pub enum BuildError {
    #[snafu(display("parameter '{param_name}' was invalid: {reason}"))]
    InvalidParameter {
        param_name: &'static str,
        reason: String,
    },
}

/// Engine-wide configuration, as recognized by the core (spec.md §6).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DlsConfig {
    pub data_dir: PathBuf,
    pub file_buffer_size: usize,
    pub write_buffer_size: usize,
    pub checkpoint_commit_seconds: u64,
    pub number_of_thread_workers: usize,
    pub write_flush_ms: u64,
    pub max_batch: usize,
    pub writer_lru_capacity: usize,
}

impl Default for DlsConfig {
    fn default() -> Self {
        DlsConfig {
            data_dir: PathBuf::from("./data"),
            file_buffer_size: DEFAULT_FILE_BUFFER_SIZE,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            checkpoint_commit_seconds: DEFAULT_CHECKPOINT_COMMIT_SECONDS,
            number_of_thread_workers: DEFAULT_NUMBER_OF_THREAD_WORKERS,
            write_flush_ms: DEFAULT_WRITE_FLUSH_MS,
            max_batch: DEFAULT_MAX_BATCH,
            writer_lru_capacity: DEFAULT_WRITER_LRU_CAPACITY,
        }
    }
}

impl DlsConfig {
    pub fn checkpoint_commit_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_commit_seconds)
    }

    pub fn write_flush_interval(&self) -> Duration {
        Duration::from_millis(self.write_flush_ms)
    }
}

/// Builder for [`DlsConfig`], mirroring
/// `vector_buffers::variants::disk_v2::common::DiskBufferConfigBuilder`.
#[derive(Clone, Debug, Default)]
pub struct DlsConfigBuilder {
    data_dir: Option<PathBuf>,
    file_buffer_size: Option<usize>,
    write_buffer_size: Option<usize>,
    checkpoint_commit_seconds: Option<u64>,
    number_of_thread_workers: Option<usize>,
    write_flush_ms: Option<u64>,
    max_batch: Option<usize>,
    writer_lru_capacity: Option<usize>,
}

impl DlsConfigBuilder {
    pub fn from_path<P: AsRef<Path>>(data_dir: P) -> Self {
        DlsConfigBuilder {
            data_dir: Some(data_dir.as_ref().to_path_buf()),
            ..Default::default()
        }
    }

    pub fn file_buffer_size(mut self, amount: usize) -> Self {
        self.file_buffer_size = Some(amount);
        self
    }

    pub fn write_buffer_size(mut self, amount: usize) -> Self {
        self.write_buffer_size = Some(amount);
        self
    }

    pub fn checkpoint_commit_seconds(mut self, amount: u64) -> Self {
        self.checkpoint_commit_seconds = Some(amount);
        self
    }

    pub fn number_of_thread_workers(mut self, amount: usize) -> Self {
        self.number_of_thread_workers = Some(amount);
        self
    }

    pub fn write_flush_ms(mut self, amount: u64) -> Self {
        self.write_flush_ms = Some(amount);
        self
    }

    pub fn max_batch(mut self, amount: usize) -> Self {
        self.max_batch = Some(amount);
        self
    }

    pub fn writer_lru_capacity(mut self, amount: usize) -> Self {
        self.writer_lru_capacity = Some(amount);
        self
    }

    pub fn build(self) -> Result<DlsConfig, BuildError> {
        let defaults = DlsConfig::default();
        let data_dir = self.data_dir.unwrap_or(defaults.data_dir);
        let write_buffer_size = self.write_buffer_size.unwrap_or(defaults.write_buffer_size);
        let number_of_thread_workers = self
            .number_of_thread_workers
            .unwrap_or(defaults.number_of_thread_workers);
        let max_batch = self.max_batch.unwrap_or(defaults.max_batch);
        let writer_lru_capacity = self
            .writer_lru_capacity
            .unwrap_or(defaults.writer_lru_capacity);

        if write_buffer_size == 0 {
            return Err(BuildError::InvalidParameter {
                param_name: "write_buffer_size",
                reason: "cannot be zero".to_string(),
            });
        }

        if number_of_thread_workers == 0 {
            return Err(BuildError::InvalidParameter {
                param_name: "number_of_thread_workers",
                reason: "cannot be zero".to_string(),
            });
        }

        if max_batch == 0 {
            return Err(BuildError::InvalidParameter {
                param_name: "max_batch",
                reason: "cannot be zero".to_string(),
            });
        }

        if writer_lru_capacity == 0 {
            return Err(BuildError::InvalidParameter {
                param_name: "writer_lru_capacity",
                reason: "cannot be zero".to_string(),
            });
        }

        Ok(DlsConfig {
            data_dir,
            file_buffer_size: self.file_buffer_size.unwrap_or(defaults.file_buffer_size),
            write_buffer_size,
            checkpoint_commit_seconds: self
                .checkpoint_commit_seconds
                .unwrap_or(defaults.checkpoint_commit_seconds),
            number_of_thread_workers,
            write_flush_ms: self.write_flush_ms.unwrap_or(defaults.write_flush_ms),
            max_batch,
            writer_lru_capacity,
        })
    }
}
