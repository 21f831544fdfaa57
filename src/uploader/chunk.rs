//! Chunk layout of a file and ranged reads over it

use crate::providers::ByteStream;
use bytes::Bytes;
use std::io;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio_util::io::ReaderStream;

/// Buffer size for streaming reads (64KB)
const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Metadata about a single chunk (without the data)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    /// 0-based chunk index
    pub index: u32,
    /// Byte offset in file
    pub offset: u64,
    pub size: u64,
}

impl ChunkInfo {
    /// 1-based number used by multipart APIs
    pub fn part_number(&self) -> u32 {
        self.index + 1
    }
}

/// `ceil(total_size / chunk_size)`, or `None` when it does not fit a `u32`
pub fn chunk_count(total_size: u64, chunk_size: u64) -> Option<u32> {
    if chunk_size == 0 {
        return None;
    }
    u32::try_from(total_size.div_ceil(chunk_size)).ok()
}

/// Size of chunk `index`; only the last one may be short
pub fn expected_chunk_size(total_size: u64, chunk_size: u64, index: u32) -> u64 {
    let offset = index as u64 * chunk_size;
    total_size.saturating_sub(offset).min(chunk_size)
}

/// Split a file into consecutive chunks covering every byte
pub fn plan_chunks(total_size: u64, chunk_size: u64) -> Vec<ChunkInfo> {
    let count = chunk_count(total_size, chunk_size).unwrap_or(0);
    (0..count)
        .map(|index| ChunkInfo {
            index,
            offset: index as u64 * chunk_size,
            size: expected_chunk_size(total_size, chunk_size, index),
        })
        .collect()
}

/// Read exactly `size` bytes at `offset`
pub async fn read_range(path: &Path, offset: u64, size: u64) -> io::Result<Bytes> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; size as usize];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

/// Stream `size` bytes of a file starting at `offset`
pub async fn stream_range(path: &Path, offset: u64, size: u64) -> io::Result<ByteStream> {
    let mut file = File::open(path).await?;
    if offset > 0 {
        file.seek(SeekFrom::Start(offset)).await?;
    }
    Ok(Box::pin(ReaderStream::with_capacity(
        file.take(size),
        STREAM_BUFFER_SIZE,
    )))
}

/// Stream a whole file
pub async fn stream_file(path: &Path) -> io::Result<ByteStream> {
    let size = tokio::fs::metadata(path).await?.len();
    stream_range(path, 0, size).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::collect_bytes;

    #[test]
    fn test_plan_chunks_covers_file() {
        let chunks = plan_chunks(120_000_000, 50_000_000);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].offset, 100_000_000);
        assert_eq!(chunks[2].size, 20_000_000);
        assert_eq!(chunks[2].part_number(), 3);
        assert_eq!(chunks.iter().map(|c| c.size).sum::<u64>(), 120_000_000);

        assert_eq!(plan_chunks(100, 50).len(), 2);
        assert!(plan_chunks(0, 50).is_empty());
        assert_eq!(chunk_count(10, 0), None);
    }

    #[tokio::test]
    async fn test_ranged_reads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        assert_eq!(&read_range(&path, 3, 4).await.unwrap()[..], b"3456");
        assert_eq!(collect_bytes(stream_range(&path, 8, 2).await.unwrap()).await.unwrap(), b"89");
        assert_eq!(collect_bytes(stream_file(&path).await.unwrap()).await.unwrap(), b"0123456789");
        assert!(read_range(&path, 8, 4).await.is_err());
    }
}
