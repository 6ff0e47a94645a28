//! Sharded byte buffer.
//!
//! Response bodies are captured into a [`ShardWriter`], which slices an unbounded stream
//! of writes into fixed-size shards so a large body never needs one contiguous
//! allocation. Finishing the writer yields an immutable [`ShardedBody`]; replaying it goes
//! through a [`ShardReader`]. Writing after finish and reading before finish are not
//! expressible.

use bytes::{Bytes, BytesMut};
use std::io::{self, Read, Write};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Write-only accumulator. Only full shards are sealed; the tail shard is sealed by
/// [`ShardWriter::finish`].
#[derive(Debug)]
pub struct ShardWriter {
    shards: Vec<Bytes>,
    current: BytesMut,
    shard_size: usize,
    len: u64,
}

impl ShardWriter {
    pub fn new(shard_size: usize) -> Self {
        assert!(shard_size > 0, "shard size must be > 0");
        Self {
            shards: Vec::new(),
            current: BytesMut::new(),
            shard_size,
            len: 0,
        }
    }

    /// Append `bytes`, sealing each shard as soon as it is full.
    pub fn write(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let room = self.shard_size - self.current.len();
            let take = room.min(bytes.len());
            self.current.extend_from_slice(&bytes[..take]);
            self.len += take as u64;
            bytes = &bytes[take..];

            if self.current.len() == self.shard_size {
                self.shards.push(self.current.split().freeze());
            }
        }
    }

    /// Total bytes written so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn shard_size(&self) -> usize {
        self.shard_size
    }

    /// Seal the partial shard (if any) and hand back the read-only body.
    pub fn finish(mut self) -> ShardedBody {
        if !self.current.is_empty() {
            self.shards.push(self.current.split().freeze());
        }
        ShardedBody {
            shards: self.shards.into(),
            shard_size: self.shard_size,
            len: self.len,
        }
    }
}

impl Write for ShardWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        ShardWriter::write(self, buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A finished body: every shard but the last is exactly `shard_size` bytes and the shard
/// lengths add up to `len`. Cloning shares the shards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardedBody {
    shards: Arc<[Bytes]>,
    shard_size: usize,
    len: u64,
}

impl ShardedBody {
    pub fn empty(shard_size: usize) -> Self {
        ShardWriter::new(shard_size).finish()
    }

    /// Split a contiguous buffer into shards without copying.
    pub fn from_bytes(bytes: Bytes, shard_size: usize) -> Self {
        assert!(shard_size > 0, "shard size must be > 0");
        let len = bytes.len() as u64;
        let mut shards = Vec::with_capacity(bytes.len().div_ceil(shard_size));
        let mut start = 0;
        while start < bytes.len() {
            let end = (start + shard_size).min(bytes.len());
            shards.push(bytes.slice(start..end));
            start = end;
        }
        Self {
            shards: shards.into(),
            shard_size,
            len,
        }
    }

    /// Reassemble a body from shards fetched elsewhere. Returns `None` if the shards
    /// don't satisfy the shard invariants for `shard_size` and `len`.
    pub fn from_shards(shards: Vec<Bytes>, shard_size: usize, len: u64) -> Option<Self> {
        if shard_size == 0 {
            return None;
        }
        let expected = usize::try_from(len.div_ceil(shard_size as u64)).ok()?;
        if shards.len() != expected {
            return None;
        }
        let mut total = 0u64;
        for (i, shard) in shards.iter().enumerate() {
            let last = i + 1 == shards.len();
            let short = !last && shard.len() != shard_size;
            if shard.is_empty() || shard.len() > shard_size || short {
                return None;
            }
            total += shard.len() as u64;
        }
        if total != len {
            return None;
        }
        Some(Self {
            shards: shards.into(),
            shard_size,
            len,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn shard_size(&self) -> usize {
        self.shard_size
    }

    pub fn shards(&self) -> &[Bytes] {
        &self.shards
    }

    /// A fresh cursor positioned at the start of the body.
    pub fn reader(&self) -> ShardReader {
        ShardReader {
            body: self.clone(),
            shard_index: 0,
            shard_offset: 0,
            position: 0,
        }
    }

    /// Copy the whole body into one contiguous buffer.
    pub fn to_bytes(&self) -> Bytes {
        match self.shards.len() {
            0 => Bytes::new(),
            1 => self.shards[0].clone(),
            _ => {
                let mut out = BytesMut::with_capacity(self.len as usize);
                for shard in self.shards.iter() {
                    out.extend_from_slice(shard);
                }
                out.freeze()
            }
        }
    }
}

/// Sequential cursor over a [`ShardedBody`].
///
/// Iterating yields the unread remainder of each shard as a zero-copy slice, which is
/// what the host uses to stream a cached body frame by frame.
#[derive(Debug, Clone)]
pub struct ShardReader {
    body: ShardedBody,
    shard_index: usize,
    shard_offset: usize,
    position: u64,
}

impl ShardReader {
    /// Bytes consumed so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn remaining(&self) -> u64 {
        self.body.len - self.position()
    }

    /// Fill `buf` from the current position. Returns 0 at end of body.
    pub fn read_into(&mut self, buf: &mut [u8]) -> usize {
        let mut read = 0;
        while read < buf.len() {
            let Some(shard) = self.body.shards.get(self.shard_index) else {
                break;
            };
            if self.shard_offset == shard.len() {
                self.shard_index += 1;
                self.shard_offset = 0;
                continue;
            }
            let n = (buf.len() - read).min(shard.len() - self.shard_offset);
            buf[read..read + n].copy_from_slice(&shard[self.shard_offset..self.shard_offset + n]);
            self.shard_offset += n;
            read += n;
        }
        self.position += read as u64;
        read
    }

    /// Copy everything from the current position into `sink`.
    pub fn copy_to<W: Write>(&mut self, sink: &mut W) -> io::Result<u64> {
        let mut copied = 0u64;
        for chunk in Iterator::by_ref(self) {
            sink.write_all(&chunk)?;
            copied += chunk.len() as u64;
        }
        Ok(copied)
    }

    /// Async counterpart of [`ShardReader::copy_to`]. A failed write leaves the cursor
    /// after the last shard handed to the sink.
    pub async fn copy_to_async<W: AsyncWrite + Unpin>(&mut self, sink: &mut W) -> io::Result<u64> {
        let mut copied = 0u64;
        while let Some(chunk) = self.next() {
            sink.write_all(&chunk).await?;
            copied += chunk.len() as u64;
        }
        sink.flush().await?;
        Ok(copied)
    }
}

impl Iterator for ShardReader {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        loop {
            let shard = self.body.shards.get(self.shard_index)?;
            if self.shard_offset < shard.len() {
                let chunk = shard.slice(self.shard_offset..);
                self.position += chunk.len() as u64;
                self.shard_index += 1;
                self.shard_offset = 0;
                return Some(chunk);
            }
            self.shard_index += 1;
            self.shard_offset = 0;
        }
    }
}

impl Read for ShardReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_into(buf))
    }
}
