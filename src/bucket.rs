//! C3: a single bucket file.
//!
//! Appending is a direct, synchronous, buffered write — mirroring
//! `vector_buffers::variants::disk_v2::writer`'s `RecordWriter<W, T>` wrapping
//! a `BufWriter<W>` — since a bucket has exactly one writer at a time (held by
//! the engine's per-channel writer LRU) and there is no concurrent access to
//! race against. Reading dispatches through the async I/O pool (C1) and the
//! read-ahead buffer (C2) via the `ChunkSource` seam, the same composition
//! point `disk_v2::io`'s `Filesystem`/`AsyncFile` traits provide for the
//! teacher's reader.
//!
//! New buckets are always created in the V1 format; the legacy, header-less
//! layout is only ever encountered when opening a bucket written before V1
//! existed (spec.md §3, §6).

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::aio::AioPool;
use crate::error::BucketError;
use crate::input_buffer::ChunkSource;
use crate::record::{
    decode_legacy_header, decode_v1_header, encode_legacy_header, encode_v1_header,
    BucketVersion, FileHeader, FileHeaderError, LEGACY_RECORD_HEADER_LEN, V1_RECORD_HEADER_LEN,
};

/// Reads and classifies the first `FILE_HEADER_LEN` bytes of `file` without
/// disturbing the file's append position, via positional `pread` (C1 is not
/// needed here: this happens once, synchronously, at open time, before the
/// bucket is handed to either the writer or the reader path).
fn classify_existing(file: &File, path: &Path) -> Result<BucketVersion, BucketError> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(BucketVersion::V1);
    }
    let mut head = [0u8; crate::record::FILE_HEADER_LEN];
    let n = file.read_at(&mut head, 0)?;
    FileHeader::classify(&head[..n]).map_err(|FileHeaderError::UnsupportedVersion(v)| {
        BucketError::Corrupt {
            path: path.to_path_buf(),
            reason: format!("unsupported bucket file version {v}"),
        }
    })
}

/// The offset at which record data begins for a given version.
pub fn data_start_offset(version: BucketVersion) -> u64 {
    match version {
        BucketVersion::Legacy => 0,
        BucketVersion::V1 => crate::record::FILE_HEADER_LEN as u64,
    }
}

fn decode_header(version: BucketVersion, buf: &[u8]) -> Option<crate::record::RecordHeader> {
    match version {
        BucketVersion::Legacy => {
            let arr: [u8; LEGACY_RECORD_HEADER_LEN] = buf.try_into().ok()?;
            Some(decode_legacy_header(&arr))
        }
        BucketVersion::V1 => {
            let arr: [u8; V1_RECORD_HEADER_LEN] = buf.try_into().ok()?;
            decode_v1_header(&arr)
        }
    }
}

/// Appends records to a bucket file, buffering writes the way
/// `RecordWriter` buffers its underlying `File`.
pub struct BucketWriter {
    file: io::BufWriter<File>,
    version: BucketVersion,
    path: PathBuf,
}

impl BucketWriter {
    /// Opens (creating if necessary) a bucket file for append, writing a
    /// fresh V1 header if the file is new.
    pub fn open(path: &Path, write_buffer_size: usize) -> Result<Self, BucketError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)?;

        let version = classify_existing(&file, path)?;
        let mut writer = BucketWriter {
            file: io::BufWriter::with_capacity(write_buffer_size, file),
            version,
            path: path.to_path_buf(),
        };
        if version == BucketVersion::V1 && writer.file.get_ref().metadata()?.len() == 0 {
            use std::io::Write;
            writer.file.write_all(&FileHeader { version: 1 }.encode())?;
            writer.file.flush()?;
        }
        Ok(writer)
    }

    pub fn version(&self) -> BucketVersion {
        self.version
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fd(&self) -> RawFd {
        self.file.get_ref().as_raw_fd()
    }

    /// Appends one record (header plus value) to the buffered writer.
    pub fn append(&mut self, key: u64, value: &[u8]) -> Result<(), BucketError> {
        use std::io::Write;
        match self.version {
            BucketVersion::Legacy => {
                self.file.write_all(&encode_legacy_header(key, value.len() as u64))?;
            }
            BucketVersion::V1 => {
                self.file.write_all(&encode_v1_header(key, value.len() as u64))?;
            }
        }
        self.file.write_all(value)?;
        Ok(())
    }

    /// Flushes the in-process buffer to the OS. Does not `fsync`; durability
    /// is the checkpoint service's job (C6).
    pub fn flush(&mut self) -> Result<(), BucketError> {
        use std::io::Write;
        self.file.flush()?;
        Ok(())
    }

    /// The file's length as seen by the OS. Only meaningful for the purpose
    /// of checkpointing right after a `flush()`: bytes still sitting in the
    /// `BufWriter` are not reflected here.
    pub fn len(&self) -> Result<u64, BucketError> {
        Ok(self.file.get_ref().metadata()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, BucketError> {
        Ok(self.len()? == 0)
    }
}

/// Reads a bucket file's records via the async I/O pool.
pub struct BucketReader {
    file: File,
    version: BucketVersion,
    path: PathBuf,
}

impl BucketReader {
    pub fn open(path: &Path) -> Result<Self, BucketError> {
        let file = OpenOptions::new().read(true).open(path)?;
        let version = classify_existing(&file, path)?;
        Ok(BucketReader {
            file,
            version,
            path: path.to_path_buf(),
        })
    }

    pub fn version(&self) -> BucketVersion {
        self.version
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn len(&self) -> Result<u64, BucketError> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, BucketError> {
        Ok(self.len()? == 0)
    }

    /// The offset of the first record in this bucket.
    pub fn data_start(&self) -> u64 {
        data_start_offset(self.version)
    }

    pub fn record_header_len(&self) -> usize {
        self.version.record_header_len()
    }

    /// Decodes a record header previously read into `buf`, honoring this
    /// bucket's version. `None` means end-of-bucket: either a short read, or
    /// (V1 only) a parity mismatch signalling a torn write at the tail.
    pub fn decode_header(&self, buf: &[u8]) -> Option<crate::record::RecordHeader> {
        decode_header(self.version, buf)
    }
}

fn aio_to_io(err: crate::error::AioError) -> io::Error {
    io::Error::other(err)
}

/// Bridges a [`BucketReader`]'s file descriptor to the async I/O pool so it
/// can serve as an [`InputBuffer`](crate::input_buffer::InputBuffer) source.
/// Owns a clone of the pool handle (cheap: it is an `Arc` internally) rather
/// than borrowing it, so a source can be moved into a spawned task, the way
/// `NeoStepIterator` must (spec.md §4.7's non-blocking variant).
pub struct PooledBucketSource {
    pool: std::sync::Arc<AioPool>,
    fd: RawFd,
}

impl PooledBucketSource {
    pub fn new(pool: std::sync::Arc<AioPool>, fd: RawFd) -> Self {
        PooledBucketSource { pool, fd }
    }
}

#[async_trait]
impl ChunkSource for PooledBucketSource {
    async fn read_chunk(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let data = self
            .pool
            .pread(self.fd, offset, buf.len())
            .await
            .map_err(aio_to_io)?;
        let n = data.len();
        buf[..n].copy_from_slice(&data);
        Ok(n)
    }
}
