//! Splits a file into fixed-size chunks and encodes them for transport.
//!
//! Chunk boundaries are a pure function of `(file_size, chunk_size)`:
//! chunk `i` covers `[i * chunk_size, min((i + 1) * chunk_size, file_size))`.

use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use std::{io, ops::Range, path::Path};
use tokio::{
    fs::File,
    io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, SeekFrom},
};

/// Default chunk size: 4 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Number of chunks needed to cover `file_size` bytes.
///
/// An empty file has zero chunks. A `chunk_size` of 0 falls back to
/// [`DEFAULT_CHUNK_SIZE`].
pub fn chunk_count(file_size: u64, chunk_size: u64) -> u64 {
    file_size.div_ceil(effective_chunk_size(chunk_size))
}

/// Byte range `[start, end)` of chunk `index`, or `None` past the end.
pub fn chunk_range(file_size: u64, index: u64, chunk_size: u64) -> Option<Range<u64>> {
    let chunk_size = effective_chunk_size(chunk_size);
    if index >= chunk_count(file_size, chunk_size) {
        return None;
    }
    let start = index * chunk_size;
    let end = (start + chunk_size).min(file_size);
    Some(start..end)
}

/// Base64 (standard alphabet, padded) representation of a chunk.
pub fn encode_chunk(data: &[u8]) -> String {
    general_purpose::STANDARD.encode(data)
}

/// Inverse of [`encode_chunk`].
pub fn decode_chunk(encoded: &str) -> Result<Bytes, base64::DecodeError> {
    general_purpose::STANDARD.decode(encoded).map(Bytes::from)
}

fn effective_chunk_size(chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    }
}

/// Random-access chunk reader over any seekable async source.
pub struct ChunkReader<R> {
    source: R,
    file_size: u64,
    chunk_size: u64,
}

impl ChunkReader<File> {
    /// Opens `path` for chunked reading.
    pub async fn open(path: &Path, chunk_size: u64) -> io::Result<Self> {
        let file = File::open(path).await?;
        let file_size = file.metadata().await?.len();
        Ok(Self::new(file, file_size, chunk_size))
    }
}

impl<R> ChunkReader<R>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    pub fn new(source: R, file_size: u64, chunk_size: u64) -> Self {
        Self {
            source,
            file_size,
            chunk_size: effective_chunk_size(chunk_size),
        }
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn total_chunks(&self) -> u64 {
        chunk_count(self.file_size, self.chunk_size)
    }

    /// Reads the raw bytes of chunk `index`.
    pub async fn read_chunk(&mut self, index: u64) -> io::Result<Bytes> {
        let range = chunk_range(self.file_size, index, self.chunk_size).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "chunk {} out of range ({} chunks)",
                    index,
                    self.total_chunks()
                ),
            )
        })?;

        self.source.seek(SeekFrom::Start(range.start)).await?;
        let mut buf = vec![0u8; (range.end - range.start) as usize];
        self.source.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    /// Reads chunk `index` and returns its base64 encoding.
    pub async fn read_chunk_encoded(&mut self, index: u64) -> io::Result<String> {
        let data = self.read_chunk(index).await?;
        Ok(encode_chunk(&data))
    }
}
