//! C2: a read-ahead buffer for a single bucket file.
//!
//! Mirrors the buffered, position-tracking reads in
//! `vector_buffers::variants::disk_v2::reader` and the max-size buffered
//! scan in `file_source::buffer::read_until_with_max_size`, generalized to
//! the blocking/non-blocking duality spec.md §4.2 asks for. The spec's
//! "promise/future" is realized here as Rust's native `async`/`.await`: a
//! pending read is simply a `Future` that the caller polls (or suspends on,
//! via `tokio`), and "reaping" it is simply awaiting it to completion — no
//! separate state machine is needed since `Future` already encodes
//! Empty/Made/Fulfilled/Reaped as not-yet-polled/polled-pending/ready/
//! consumed.

use std::cmp;
use std::io;

use async_trait::async_trait;

/// Anything that can fill a caller-provided buffer with the next bytes of a
/// sequential byte stream, asynchronously. Implemented by the AIO-pool-backed
/// bucket file reader (C1 + C3 composition point).
#[async_trait]
pub trait ChunkSource: Send {
    /// Reads up to `buf.len()` bytes starting at `offset`. Returns the number
    /// of bytes actually read (`0` at end of stream).
    async fn read_chunk(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
}

/// Read-ahead buffer. Holds at most `capacity` bytes read ahead of the
/// caller's logical cursor.
pub struct InputBuffer {
    buf: Vec<u8>,
    capacity: usize,
    /// Logical file offset corresponding to `buf[0]`.
    chunk_start: u64,
    /// `position_in_chunk` from spec.md §4.2.
    position_in_chunk: usize,
    /// `data_in_chunk` from spec.md §4.2.
    data_in_chunk: usize,
    eof: bool,
}

impl InputBuffer {
    /// `capacity == 0` disables buffering: every read goes straight to the
    /// source (spec.md §8 boundary behaviour "input buffer size 0").
    pub fn new(capacity: usize) -> Self {
        InputBuffer {
            buf: vec![0u8; capacity],
            capacity,
            chunk_start: 0,
            position_in_chunk: 0,
            data_in_chunk: 0,
            eof: false,
        }
    }

    /// Current logical file offset (chunk start plus in-chunk cursor).
    pub fn position(&self) -> u64 {
        self.chunk_start + self.position_in_chunk as u64
    }

    fn buffered(&self) -> usize {
        self.data_in_chunk - self.position_in_chunk
    }

    /// Non-blocking peek at how many bytes are immediately available without
    /// touching the source. Used by the non-blocking step iterator to decide
    /// between `RecordRead` and `WaitForData`.
    pub fn available(&self) -> usize {
        self.buffered()
    }

    fn take_buffered(&mut self, dest: &mut [u8]) -> usize {
        let n = cmp::min(dest.len(), self.buffered());
        dest[..n].copy_from_slice(&self.buf[self.position_in_chunk..self.position_in_chunk + n]);
        self.position_in_chunk += n;
        n
    }

    /// `read_data` (spec.md §4.2): copy buffered bytes first, then either
    /// read the remainder straight into `dest` (bypassing the buffer, when
    /// the remaining request is at least as large as the buffer capacity) or
    /// refill the buffer once and copy from it.
    pub async fn read_data<S: ChunkSource>(
        &mut self,
        source: &mut S,
        dest: &mut [u8],
    ) -> io::Result<usize> {
        let copied = self.take_buffered(dest);
        if copied == dest.len() || self.eof {
            return Ok(copied);
        }

        let remaining = &mut dest[copied..];
        if self.capacity == 0 || remaining.len() >= self.capacity {
            let direct_offset = self.position();
            let n = source.read_chunk(direct_offset, remaining).await?;
            self.chunk_start = direct_offset + n as u64;
            self.position_in_chunk = 0;
            self.data_in_chunk = 0;
            if n < remaining.len() {
                self.eof = true;
            }
            return Ok(copied + n);
        }

        self.refill(source).await?;
        let more = self.take_buffered(remaining);
        Ok(copied + more)
    }

    async fn refill<S: ChunkSource>(&mut self, source: &mut S) -> io::Result<()> {
        let offset = self.position();
        let n = source.read_chunk(offset, &mut self.buf[..self.capacity]).await?;
        self.chunk_start = offset;
        self.position_in_chunk = 0;
        self.data_in_chunk = n;
        self.eof = n < self.capacity;
        Ok(())
    }

    /// `seek` (spec.md §4.2): if the new position stays inside the buffered
    /// window, only the in-buffer cursor moves; otherwise the buffer is
    /// invalidated and the next read refills at the new offset.
    pub fn seek_to(&mut self, offset: u64) {
        if offset >= self.chunk_start && offset <= self.chunk_start + self.data_in_chunk as u64 {
            self.position_in_chunk = (offset - self.chunk_start) as usize;
        } else {
            self.chunk_start = offset;
            self.position_in_chunk = 0;
            self.data_in_chunk = 0;
            self.eof = false;
        }
    }

    pub fn is_eof(&self) -> bool {
        self.eof && self.buffered() == 0
    }
}
